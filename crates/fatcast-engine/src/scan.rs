//! Host tree scanning.
//!
//! Walks the exported subtree once, before any request is served, and
//! drives allocation: a directory stream per subdirectory, a passthrough
//! mapping per regular file, entries appended to the parent's stream.
//! Anything the FAT cannot represent is skipped with a warning: names
//! that aren't valid Unicode, files larger than 4 GiB, symlinks, special
//! files, and subtrees on other devices.

use std::fs::{self, Metadata};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use tracing::warn;

use crate::dir::{utf16_name, DirTable, Utf16Name, ATTR_DIRECTORY, ATTR_NONE};
use crate::error::Result;
use crate::volume::Volume;

/// Scan `root` and populate the volume with its contents.
///
/// Fails only if the root itself cannot be read; problems below it are
/// logged and skipped, matching the best-effort nature of the snapshot.
pub fn populate(volume: &mut Volume, root: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(root)?;
    let walker = Walker {
        device: meta.dev(),
        dot: utf16_name("."),
        dot_dot: utf16_name(".."),
    };
    // Children of the root refer to their parent as cluster 0.
    walker.scan_dir(volume, root, 0, &meta);
    Ok(())
}

struct Walker {
    /// Device of the scan root; the walk never crosses mount points.
    device: u64,
    dot: Utf16Name,
    dot_dot: Utf16Name,
}

impl Walker {
    fn scan_dir(&self, volume: &mut Volume, path: &Path, parent: u32, parent_meta: &Metadata) {
        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %path.display(), %err, "skipping unreadable directory");
                return;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(path = %path.display(), %err, "skipping unreadable entry");
                    continue;
                }
            };
            // DirEntry metadata does not traverse symlinks, which is
            // what we want: links have no FAT representation.
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(err) => {
                    warn!(path = %entry.path().display(), %err, "skipping unstattable entry");
                    continue;
                }
            };
            let file_name = entry.file_name();
            let name = match file_name.to_str() {
                Some(name) => utf16_name(name),
                None => {
                    warn!(path = %entry.path().display(), "name not representable, skipping");
                    continue;
                }
            };
            if DirTable::entry_count(&name).is_err() {
                warn!(path = %entry.path().display(), "name too long, skipping");
                continue;
            }

            if meta.is_dir() {
                if meta.dev() != self.device {
                    continue;
                }
                self.add_directory(volume, &entry.path(), &name, parent, parent_meta, &meta);
            } else if meta.is_file() {
                self.add_file(volume, &entry.path(), &name, parent, &meta);
            }
        }
    }

    fn add_directory(
        &self,
        volume: &mut Volume,
        path: &Path,
        name: &[u16],
        parent: u32,
        parent_meta: &Metadata,
        meta: &Metadata,
    ) {
        let cluster = match volume.alloc_directory() {
            Ok(cluster) => cluster,
            Err(err) => {
                warn!(path = %path.display(), %err, "directory does not fit, skipping");
                return;
            }
        };

        // Link the new directory into the hierarchy.
        let linked = volume
            .add_entry(cluster, cluster, &self.dot, 0, ATTR_DIRECTORY, meta.mtime(), meta.atime())
            .and_then(|_| {
                volume.add_entry(
                    cluster,
                    parent,
                    &self.dot_dot,
                    0,
                    ATTR_DIRECTORY,
                    parent_meta.mtime(),
                    parent_meta.atime(),
                )
            })
            .and_then(|_| {
                volume.add_entry(
                    parent,
                    cluster,
                    name,
                    0,
                    ATTR_DIRECTORY,
                    meta.mtime(),
                    meta.atime(),
                )
            });
        if let Err(err) = linked {
            warn!(path = %path.display(), %err, "could not link directory, skipping");
            return;
        }

        self.scan_dir(volume, path, cluster, meta);
    }

    fn add_file(
        &self,
        volume: &mut Volume,
        path: &Path,
        name: &[u16],
        parent: u32,
        meta: &Metadata,
    ) {
        let size = match u32::try_from(meta.len()) {
            Ok(size) => size,
            Err(_) => {
                warn!(path = %path.display(), "file too large for FAT32, skipping");
                return;
            }
        };
        let cluster = if size > 0 {
            match volume.add_file(path, size) {
                Ok(cluster) => cluster,
                Err(err) => {
                    warn!(path = %path.display(), %err, "file does not fit, skipping");
                    return;
                }
            }
        } else {
            0
        };
        if let Err(err) =
            volume.add_entry(parent, cluster, name, size, ATTR_NONE, meta.mtime(), meta.atime())
        {
            warn!(path = %path.display(), %err, "could not add file entry");
        }
    }
}
