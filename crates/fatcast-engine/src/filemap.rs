//! Host file passthrough.
//!
//! Binds a host file to a cluster range of the image and serves reads
//! straight from it. No contents are cached: the file is opened, read
//! and closed inside each fill, which client block sizes amortize.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::image::Provider;

/// Serves a host file's bytes on demand.
pub struct FileMap {
    path: PathBuf,
}

impl FileMap {
    pub fn new(path: impl Into<PathBuf>) -> FileMap {
        FileMap { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Provider for FileMap {
    fn fill(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                // Shorter than at scan time; the tail reads as zero.
                break;
            }
            filled += n;
        }
        buf[filled..].fill(0);
        Ok(())
    }

    fn receive(&self, _buf: &[u8], _offset: u64) -> Result<()> {
        // Mapped files are read-only through the image, for now.
        Err(Error::ReadOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_from_the_file_and_zero_pads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        std::fs::write(&path, b"hello world").unwrap();

        let map = FileMap::new(&path);
        let mut buf = [0xffu8; 16];
        map.fill(&mut buf, 0).unwrap();
        assert_eq!(&buf[..11], b"hello world");
        assert_eq!(&buf[11..], &[0; 5]);

        let mut buf = [0xffu8; 4];
        map.fill(&mut buf, 6).unwrap();
        assert_eq!(&buf, b"worl");
    }

    #[test]
    fn missing_file_surfaces_the_errno() {
        let dir = tempfile::tempdir().unwrap();
        let map = FileMap::new(dir.path().join("gone"));
        let mut buf = [0u8; 4];
        let err = map.fill(&mut buf, 0).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[test]
    fn writes_are_rejected() {
        let map = FileMap::new("/does/not/matter");
        assert!(map.receive(b"x", 0).is_err());
    }
}
