//! # fatcast-engine
//!
//! Image synthesis engine for presenting a live host directory tree as a
//! virtual FAT32 block device.
//!
//! Nothing is rendered to disk: the engine answers arbitrary
//! (offset, length) read requests over a multi-gigabyte virtual volume by
//! routing byte ranges to on-demand providers, and absorbs client writes
//! to the FAT region by reverse-engineering them back into allocation
//! changes. The layered subsystems:
//!
//! - [`image`] — sparse offset-indexed routing of byte ranges to
//!   providers, overlaid with received write data
//! - [`fat`] — extent-compressed File Allocation Table with allocation,
//!   chain extension, byte-range fill and write-back interpretation
//! - [`dir`] — VFAT long-filename directory stream construction
//! - [`filemap`] — demand-paged passthrough to host files
//! - [`boot`] — boot sector and FSInfo assembly
//! - [`geometry`] — cluster/FAT/sector sizing
//! - [`volume`] — the facade owning all of the above
//! - [`scan`] — walks the host tree and drives allocation
//!
//! Construction runs in two phases: the scan allocates directories and
//! files, then [`Volume::finalize`] materializes free space and switches
//! the volume into service mode. The engine is single-threaded; all
//! operations run to completion on the calling thread.

pub mod boot;
pub mod dir;
pub mod error;
pub mod fat;
pub mod filemap;
pub mod geometry;
pub mod image;
pub mod scan;
pub mod volume;

pub use error::{Error, Result};
pub use geometry::Geometry;
pub use volume::Volume;
