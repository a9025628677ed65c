//! NBD wire protocol framing and the serve loop.
//!
//! The kernel's nbd client speaks a simple request/reply protocol over
//! the socket handed to it with `NBD_SET_SOCK`. All multibyte fields
//! are big-endian on the wire. Requests are served strictly in arrival
//! order; the engine is invoked once per request on this task.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use fatcast_engine::Volume;

pub const REQUEST_MAGIC: u32 = 0x2560_9513;
pub const REPLY_MAGIC: u32 = 0x6744_6698;

pub const CMD_READ: u32 = 0;
pub const CMD_WRITE: u32 = 1;
pub const CMD_DISC: u32 = 2;
pub const CMD_FLUSH: u32 = 3;
pub const CMD_TRIM: u32 = 4;

pub const REQUEST_SIZE: usize = 28;
pub const REPLY_SIZE: usize = 16;

/// The kernel never issues requests larger than this; anything bigger
/// means the stream is desynchronized.
const MAX_REQUEST_LEN: u32 = 32 * 1024 * 1024;

/// A parsed NBD request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub kind: u32,
    pub handle: [u8; 8],
    pub from: u64,
    pub len: u32,
}

impl Request {
    /// Parse a request header, validating the magic.
    pub fn parse(buf: &[u8; REQUEST_SIZE]) -> io::Result<Request> {
        let magic = be32(&buf[0..4]);
        if magic != REQUEST_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad request magic 0x{magic:08x}"),
            ));
        }
        let mut handle = [0u8; 8];
        handle.copy_from_slice(&buf[8..16]);
        Ok(Request {
            kind: be32(&buf[4..8]),
            handle,
            from: be64(&buf[16..24]),
            len: be32(&buf[24..28]),
        })
    }

    /// Encode this request as wire bytes. Used by tests acting as the
    /// client side.
    pub fn encode(&self) -> [u8; REQUEST_SIZE] {
        let mut buf = [0u8; REQUEST_SIZE];
        buf[0..4].copy_from_slice(&REQUEST_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.kind.to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle);
        buf[16..24].copy_from_slice(&self.from.to_be_bytes());
        buf[24..28].copy_from_slice(&self.len.to_be_bytes());
        buf
    }
}

/// Encode a reply header.
pub fn encode_reply(handle: &[u8; 8], error: i32) -> [u8; REPLY_SIZE] {
    let mut reply = [0u8; REPLY_SIZE];
    reply[0..4].copy_from_slice(&REPLY_MAGIC.to_be_bytes());
    reply[4..8].copy_from_slice(&(error as u32).to_be_bytes());
    reply[8..16].copy_from_slice(handle);
    reply
}

/// Serve NBD requests from `stream` until the peer closes it.
///
/// READ fills from the volume and replies with the payload or an errno.
/// WRITE drains its payload and offers it to the volume, which only the
/// FAT region accepts. Everything else gets EINVAL. A bad request magic
/// is fatal: the stream cannot be trusted afterwards.
pub async fn serve<S>(stream: &mut S, volume: &mut Volume) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; REQUEST_SIZE];
    loop {
        match stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                debug!("client closed the request stream");
                return Ok(());
            }
            Err(err) => return Err(err),
        }
        let request = Request::parse(&header)?;

        match request.kind {
            CMD_READ => {
                trace!(from = request.from, len = request.len, "READ");
                if request.len > MAX_REQUEST_LEN {
                    stream
                        .write_all(&encode_reply(&request.handle, libc::EINVAL))
                        .await?;
                    continue;
                }
                let mut buf = vec![0u8; request.len as usize];
                match volume.fill(&mut buf, request.from) {
                    Ok(()) => {
                        stream.write_all(&encode_reply(&request.handle, 0)).await?;
                        stream.write_all(&buf).await?;
                    }
                    Err(err) => {
                        debug!(%err, from = request.from, "read failed");
                        stream
                            .write_all(&encode_reply(&request.handle, err.errno()))
                            .await?;
                    }
                }
            }
            CMD_WRITE => {
                trace!(from = request.from, len = request.len, "WRITE");
                if request.len > MAX_REQUEST_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "oversized write request",
                    ));
                }
                let mut buf = vec![0u8; request.len as usize];
                stream.read_exact(&mut buf).await?;
                let reply = match volume.receive(&buf, request.from) {
                    Ok(()) => encode_reply(&request.handle, 0),
                    Err(err) => {
                        debug!(%err, from = request.from, "write rejected");
                        encode_reply(&request.handle, err.errno())
                    }
                };
                stream.write_all(&reply).await?;
            }
            kind => {
                debug!(kind, "unsupported command");
                stream
                    .write_all(&encode_reply(&request.handle, libc::EINVAL))
                    .await?;
            }
        }
    }
}

fn be32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn be64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let request = Request {
            kind: CMD_READ,
            handle: *b"handle!!",
            from: 0x1122_3344_5566_7788,
            len: 4096,
        };
        let parsed = Request::parse(&request.encode()).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn bad_magic_is_an_error() {
        let mut buf = Request {
            kind: CMD_READ,
            handle: [0; 8],
            from: 0,
            len: 0,
        }
        .encode();
        buf[0] ^= 0xff;
        assert!(Request::parse(&buf).is_err());
    }

    #[test]
    fn reply_layout() {
        let reply = encode_reply(b"abcdefgh", libc::EROFS);
        assert_eq!(&reply[0..4], &REPLY_MAGIC.to_be_bytes());
        assert_eq!(&reply[4..8], &(libc::EROFS as u32).to_be_bytes());
        assert_eq!(&reply[8..16], b"abcdefgh");
    }
}
