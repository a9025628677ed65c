//! NBD device attachment.
//!
//! The kernel side of an nbd device is configured through ioctls on the
//! `/dev/nbdN` file descriptor: block size, device size in blocks, the
//! socket to read requests from, and finally `NBD_DO_IT`, which parks
//! the calling thread until the device is disconnected. There is no
//! ecosystem wrapper for these, so the codes from `<linux/nbd.h>` are
//! spelled out here: `_IO(0xab, N)`.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::Path;

const NBD_SET_SOCK: libc::c_ulong = 0xab00;
const NBD_SET_BLKSIZE: libc::c_ulong = 0xab01;
const NBD_DO_IT: libc::c_ulong = 0xab03;
const NBD_SET_SIZE_BLOCKS: libc::c_ulong = 0xab07;

/// An open network block device node.
pub struct NbdDevice {
    file: File,
}

impl NbdDevice {
    pub fn open(path: &Path) -> io::Result<NbdDevice> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(NbdDevice { file })
    }

    pub fn set_block_size(&self, size: u32) -> io::Result<()> {
        self.ioctl(NBD_SET_BLKSIZE, size as libc::c_ulong)
    }

    pub fn set_size_blocks(&self, blocks: u64) -> io::Result<()> {
        self.ioctl(NBD_SET_SIZE_BLOCKS, blocks as libc::c_ulong)
    }

    /// Hand the kernel its end of the request socket.
    pub fn set_socket(&self, socket: BorrowedFd<'_>) -> io::Result<()> {
        self.ioctl(NBD_SET_SOCK, socket.as_raw_fd() as libc::c_ulong)
    }

    /// Run the device until it is disconnected. Blocks the calling
    /// thread for the lifetime of the device.
    pub fn run(&self) -> io::Result<()> {
        self.ioctl(NBD_DO_IT, 0)
    }

    fn ioctl(&self, request: libc::c_ulong, arg: libc::c_ulong) -> io::Result<()> {
        // Safety: the fd is owned by `self.file` and every request here
        // takes an integer argument or none.
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, arg) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}
