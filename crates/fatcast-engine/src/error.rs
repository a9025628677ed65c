//! Engine error type.

use std::io;

use thiserror::Error;

/// Errors surfaced by the synthesis engine.
///
/// The NBD transport reduces these to an errno with [`Error::errno`];
/// startup and scan failures are reported with their message.
#[derive(Debug, Error)]
pub enum Error {
    /// Request touches bytes past the end of the image.
    #[error("request outside image bounds")]
    OutOfBounds,

    /// FAT write not aligned to whole entries.
    #[error("misaligned FAT write")]
    Misaligned,

    /// Write to a region that only serves reads.
    #[error("write to read-only region")]
    ReadOnly,

    /// FAT update that cannot be mapped back to an allocation change.
    #[error("uninterpretable FAT update: {0}")]
    FatMutation(&'static str),

    /// No directory stream starts at the given cluster.
    #[error("no directory at cluster {0}")]
    UnknownDirectory(u32),

    /// Name does not fit within the VFAT limits.
    #[error("file name too long")]
    NameTooLong,

    /// The volume ran out of data clusters.
    #[error("volume is full")]
    VolumeFull,

    /// Geometry that cannot host a FAT32 volume.
    #[error("unsupported geometry: {0}")]
    Geometry(String),

    /// Host I/O error, carrying the OS error code when present.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// The errno equivalent reported in NBD replies.
    pub fn errno(&self) -> i32 {
        match self {
            Error::OutOfBounds | Error::Misaligned => libc::EINVAL,
            Error::ReadOnly => libc::EROFS,
            Error::FatMutation(_) => libc::EIO,
            Error::UnknownDirectory(_) => libc::ENOENT,
            Error::NameTooLong => libc::ENAMETOOLONG,
            Error::VolumeFull => libc::ENOSPC,
            Error::Geometry(_) => libc::EINVAL,
            Error::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Engine result type.
pub type Result<T> = std::result::Result<T, Error>;
