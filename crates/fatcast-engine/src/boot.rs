//! Boot sector and filesystem information sector.
//!
//! Fixed 512-byte templates with a handful of runtime-filled fields.
//! The boot sector starts with `jmp $` so the image is never bootable;
//! the FSInfo sector carries only its magic markers and leaves the
//! free-cluster hints unknown.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::geometry::{
    Geometry, RESERVED_SECTORS, ROOT_DIR_CLUSTER, SECTOR_SIZE, SECTORS_PER_CLUSTER,
};
use crate::image::Provider;

const SECTOR: usize = SECTOR_SIZE as usize;

const SECTOR_COUNT_OFFSET: usize = 0x20;
const FAT_SECTORS_OFFSET: usize = 0x24;
const ROOT_CLUSTER_OFFSET: usize = 0x2c;
const FSINFO_SECTOR_OFFSET: usize = 0x30;
const DRIVE_NUMBER_OFFSET: usize = 0x40;
const EXT_BOOT_SIG_OFFSET: usize = 0x42;
const VOLUME_ID_OFFSET: usize = 0x43;
const VOLUME_LABEL_OFFSET: usize = 0x47;
const FS_TYPE_OFFSET: usize = 0x52;

const DEFAULT_LABEL: &str = "FATCAST";

/// The reserved-area contents: boot sector and FSInfo sector.
pub struct BootRecord {
    boot: [u8; SECTOR],
    fsinfo: [u8; SECTOR],
}

impl BootRecord {
    pub fn new(geometry: &Geometry, label: Option<&str>) -> BootRecord {
        let mut boot = [0u8; SECTOR];

        // jmp $ — never bootable — followed by the system id.
        boot[0..3].copy_from_slice(&[0xeb, 0xfe, 0x90]);
        boot[3..11].copy_from_slice(b"FATCAST ");

        // BIOS parameter block.
        boot[11..13].copy_from_slice(&(SECTOR_SIZE as u16).to_le_bytes());
        boot[13] = SECTORS_PER_CLUSTER as u8;
        boot[14..16].copy_from_slice(&(RESERVED_SECTORS as u16).to_le_bytes());
        boot[16] = 1; // number of FATs; one is enough, nothing is on disk
        // 17..19: root directory size, unused for FAT32
        // 19..21: 16-bit sector count, stored as 32 bits below
        boot[21] = 0xf8; // media descriptor: fixed disk
        // 22..24: 16-bit sectors per FAT, stored as 32 bits below
        boot[24..26].copy_from_slice(&1u16.to_le_bytes()); // sectors per track
        boot[26..28].copy_from_slice(&1u16.to_le_bytes()); // heads
        // 28..32: sectors before the start of the partition
        boot[SECTOR_COUNT_OFFSET..][..4]
            .copy_from_slice(&geometry.total_sectors.to_le_bytes());
        boot[FAT_SECTORS_OFFSET..][..4]
            .copy_from_slice(&geometry.fat_sectors.to_le_bytes());
        // 0x28..0x2a: FAT usage flags; 0x2a..0x2c: format version 0.0
        boot[ROOT_CLUSTER_OFFSET..][..4]
            .copy_from_slice(&ROOT_DIR_CLUSTER.to_le_bytes());
        boot[FSINFO_SECTOR_OFFSET..][..2].copy_from_slice(&1u16.to_le_bytes());
        // 0x32..0x34: backup boot sector (none); 12 reserved bytes
        boot[DRIVE_NUMBER_OFFSET] = 0x80; // first fixed disk
        boot[EXT_BOOT_SIG_OFFSET] = 0x29; // id, label and type are valid

        let volume_id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        boot[VOLUME_ID_OFFSET..][..4].copy_from_slice(&volume_id.to_le_bytes());

        let mut label_bytes = [b' '; 11];
        let label = label.unwrap_or(DEFAULT_LABEL);
        for (slot, byte) in label_bytes.iter_mut().zip(label.bytes()) {
            *slot = byte;
        }
        boot[VOLUME_LABEL_OFFSET..][..11].copy_from_slice(&label_bytes);
        boot[FS_TYPE_OFFSET..][..8].copy_from_slice(b"FAT32   ");

        let mut fsinfo = [0u8; SECTOR];
        fsinfo[0..4].copy_from_slice(b"RRaA");
        fsinfo[0x1e4..0x1e8].copy_from_slice(b"rrAa");
        // Free-cluster count and next-free hint, both left unknown.
        fsinfo[0x1e8..0x1ec].copy_from_slice(&[0xff; 4]);
        fsinfo[0x1ec..0x1f0].copy_from_slice(&[0xff; 4]);
        fsinfo[0x1fc..0x200].copy_from_slice(&[0x00, 0x00, 0x55, 0xaa]);

        BootRecord { boot, fsinfo }
    }
}

impl Provider for BootRecord {
    fn fill(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        // Registered over the first two sectors only.
        for (i, slot) in buf.iter_mut().enumerate() {
            let pos = offset as usize + i;
            *slot = if pos < SECTOR {
                self.boot[pos]
            } else if pos < 2 * SECTOR {
                self.fsinfo[pos - SECTOR]
            } else {
                0
            };
        }
        Ok(())
    }

    fn receive(&self, _buf: &[u8], _offset: u64) -> Result<()> {
        Err(Error::ReadOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> Geometry {
        Geometry::plan(1_000_000, 512).unwrap()
    }

    #[test]
    fn boot_sector_fields() {
        let record = BootRecord::new(&geometry(), None);
        let boot = &record.boot;
        assert_eq!(&boot[0..3], &[0xeb, 0xfe, 0x90]);
        assert_eq!(&boot[11..13], &512u16.to_le_bytes());
        assert_eq!(boot[13], 8); // 4096-byte clusters
        assert_eq!(boot[16], 1);
        assert_eq!(boot[21], 0xf8);
        let g = geometry();
        assert_eq!(&boot[0x20..0x24], &g.total_sectors.to_le_bytes());
        assert_eq!(&boot[0x24..0x28], &g.fat_sectors.to_le_bytes());
        assert_eq!(&boot[0x2c..0x30], &2u32.to_le_bytes());
        assert_eq!(boot[0x40], 0x80);
        assert_eq!(boot[0x42], 0x29);
        assert_eq!(&boot[0x47..0x52], b"FATCAST    ");
        assert_eq!(&boot[0x52..0x5a], b"FAT32   ");
    }

    #[test]
    fn label_is_space_padded_and_truncated() {
        let record = BootRecord::new(&geometry(), Some("PHOTOS"));
        assert_eq!(&record.boot[0x47..0x52], b"PHOTOS     ");
        let record = BootRecord::new(&geometry(), Some("ALONGVOLUMELABEL"));
        assert_eq!(&record.boot[0x47..0x52], b"ALONGVOLUME");
    }

    #[test]
    fn fsinfo_markers() {
        let record = BootRecord::new(&geometry(), None);
        let fsinfo = &record.fsinfo;
        assert_eq!(&fsinfo[0..4], b"RRaA");
        assert_eq!(&fsinfo[0x1e4..0x1e8], b"rrAa");
        assert_eq!(&fsinfo[0x1e8..0x1ec], &[0xff; 4]);
        assert_eq!(&fsinfo[0x1ec..0x1f0], &[0xff; 4]);
        assert_eq!(&fsinfo[0x1fc..0x200], &[0x00, 0x00, 0x55, 0xaa]);
    }

    #[test]
    fn fill_crosses_the_sector_boundary() {
        let record = BootRecord::new(&geometry(), None);
        let mut buf = [0u8; 8];
        record.fill(&mut buf, 508).unwrap();
        // Last four boot sector bytes, then the FSInfo magic.
        assert_eq!(&buf[4..8], b"RRaA");
    }
}
