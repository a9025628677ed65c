//! The assembled virtual volume.
//!
//! Owns the geometry, the FAT, the directory table and the image map,
//! and wires the provider kinds into the map. Construction runs in two
//! phases: allocation (directories from the low clusters, files from the
//! high ones), then [`Volume::finalize`] materializes the free-space
//! accounting and switches the volume into service.
//!
//! The engine is single-threaded by contract, so shared state between
//! the facade and the providers is plain `Rc<RefCell<_>>`.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use crate::boot::BootRecord;
use crate::dir::{DirTable, DIR_ENTRY_SIZE};
use crate::error::{Error, Result};
use crate::fat::Fat;
use crate::filemap::FileMap;
use crate::geometry::{Geometry, CLUSTER_SIZE, ROOT_DIR_CLUSTER, SECTOR_SIZE};
use crate::image::{ImageMap, Provider};

/// A complete virtual FAT32 volume.
pub struct Volume {
    geometry: Geometry,
    fat: Rc<RefCell<Fat>>,
    dirs: Rc<RefCell<DirTable>>,
    image: ImageMap,
    finalized: bool,
}

/// Routes the FAT byte range of the image to the FAT engine.
struct FatSource {
    fat: Rc<RefCell<Fat>>,
}

impl Provider for FatSource {
    fn fill(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.fat.borrow().fill_bytes(buf, offset);
        Ok(())
    }

    fn receive(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.fat.borrow_mut().receive(buf, offset)
    }
}

/// Routes one cluster of a directory to its stream.
struct DirSource {
    dirs: Rc<RefCell<DirTable>>,
    index: usize,
}

impl Provider for DirSource {
    fn fill(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.dirs.borrow().fill(self.index, buf, offset);
        Ok(())
    }

    fn receive(&self, _buf: &[u8], _offset: u64) -> Result<()> {
        Err(Error::ReadOnly)
    }
}

impl Volume {
    /// Set up an empty volume: boot and FSInfo sectors registered, FAT
    /// initialized for the planned cluster count, root directory
    /// allocated at cluster 2.
    pub fn new(geometry: Geometry, label: Option<&str>) -> Result<Volume> {
        let fat = Rc::new(RefCell::new(Fat::new(geometry.data_clusters)));
        let dirs = Rc::new(RefCell::new(DirTable::new()));
        let mut image = ImageMap::new();
        image.register(
            Rc::new(BootRecord::new(&geometry, label)),
            0,
            2 * SECTOR_SIZE as u64,
            0,
        );

        let mut volume = Volume {
            geometry,
            fat,
            dirs,
            image,
            finalized: false,
        };
        let root = volume.alloc_directory()?;
        debug_assert_eq!(root, ROOT_DIR_CLUSTER);
        Ok(volume)
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Byte position of a data cluster in the image.
    pub fn cluster_pos(&self, cluster: u32) -> u64 {
        self.fat.borrow().cluster_pos(cluster)
    }

    /// Allocate a new, empty directory and route its first cluster.
    pub fn alloc_directory(&mut self) -> Result<u32> {
        let cluster = self.fat.borrow_mut().alloc_beginning(1)?;
        let index = self.dirs.borrow_mut().add_stream(cluster);
        let pos = self.fat.borrow().cluster_pos(cluster);
        self.image.register(
            Rc::new(DirSource {
                dirs: Rc::clone(&self.dirs),
                index,
            }),
            pos,
            CLUSTER_SIZE as u64,
            0,
        );
        Ok(cluster)
    }

    /// Append an entry to the directory starting at `parent_cluster`,
    /// growing its cluster chain when the stream spills over.
    ///
    /// Directory entries refer to the root as cluster 0; that is
    /// accepted here so callers don't need the special case.
    pub fn add_entry(
        &mut self,
        parent_cluster: u32,
        entry_cluster: u32,
        name: &[u16],
        file_size: u32,
        attrs: u8,
        mtime: i64,
        atime: i64,
    ) -> Result<()> {
        let parent = if parent_cluster == 0 {
            ROOT_DIR_CLUSTER
        } else {
            parent_cluster
        };
        let index = self
            .dirs
            .borrow()
            .index_of(parent)
            .ok_or(Error::UnknownDirectory(parent))?;
        let num_entries = DirTable::entry_count(name)?;

        loop {
            let (allocated, len, last) = self.dirs.borrow().usage(index);
            if len + num_entries * DIR_ENTRY_SIZE <= allocated as usize * CLUSTER_SIZE as usize {
                break;
            }
            let new_last = self
                .fat
                .borrow_mut()
                .extend_chain(last)
                .ok_or(Error::VolumeFull)?;
            let pos = self.fat.borrow().cluster_pos(new_last);
            let logical = allocated as u64 * CLUSTER_SIZE as u64;
            self.dirs.borrow_mut().grow(index, new_last);
            self.image.register(
                Rc::new(DirSource {
                    dirs: Rc::clone(&self.dirs),
                    index,
                }),
                pos,
                CLUSTER_SIZE as u64,
                logical,
            );
            tracing::debug!(cluster = parent, new_last, "directory grew");
        }

        self.dirs.borrow_mut().append_entry(
            index,
            entry_cluster,
            name,
            file_size,
            attrs,
            mtime,
            atime,
        );
        Ok(())
    }

    /// Bind a host file to a cluster range reserved from the high end of
    /// the volume. Returns the starting cluster.
    pub fn add_file(&mut self, path: impl Into<PathBuf>, size: u32) -> Result<u32> {
        debug_assert!(size > 0);
        let clusters = (size as u64).div_ceil(CLUSTER_SIZE as u64) as u32;
        let cluster = self.fat.borrow_mut().alloc_end(clusters)?;
        let pos = self.fat.borrow().cluster_pos(cluster);
        self.image.register(
            Rc::new(FileMap::new(path)),
            pos,
            clusters as u64 * CLUSTER_SIZE as u64,
            0,
        );
        Ok(cluster)
    }

    /// One-time transition from construction to service: the FAT's
    /// free-space and bad-cluster extents materialize and the FAT byte
    /// range starts answering reads and absorbing writes.
    pub fn finalize(&mut self, max_free_clusters: u32) {
        debug_assert!(!self.finalized);
        self.fat.borrow_mut().finalize(max_free_clusters);
        let bytes = self.fat.borrow().fat_bytes();
        self.image.register(
            Rc::new(FatSource {
                fat: Rc::clone(&self.fat),
            }),
            self.geometry.fat_start(),
            bytes,
            0,
        );
        self.finalized = true;
    }

    /// Answer a read anywhere in the image.
    pub fn fill(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(Error::OutOfBounds)?;
        if end > self.geometry.total_bytes() {
            return Err(Error::OutOfBounds);
        }
        self.image.fill(buf, offset)
    }

    /// Accept a client write. Only the FAT absorbs writes; everything
    /// else is read-only.
    pub fn receive(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        let fat_start = self.geometry.fat_start();
        let fat_end = fat_start + self.fat.borrow().fat_bytes();
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(Error::OutOfBounds)?;
        if offset < fat_start || end > fat_end {
            return Err(Error::ReadOnly);
        }
        self.image.receive(buf, offset)
    }

    /// Chain-linkage check over the synthesized FAT; see
    /// [`Fat::is_consistent`].
    pub fn fat_is_consistent(&mut self) -> bool {
        self.fat.borrow_mut().is_consistent()
    }
}
