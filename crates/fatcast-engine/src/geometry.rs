//! Volume geometry and the sizing planner.
//!
//! The image layout is fixed: reserved sectors first (boot sector,
//! FSInfo, padding), then a single FAT, then the data clusters,
//! everything sector aligned. Directories are allocated from the start
//! of the data area and mapped files from the end, with all free space
//! in between.

use crate::error::Error;

/// Bytes per sector. Only 512 is accepted by the planner.
pub const SECTOR_SIZE: u32 = 512;
/// Bytes per data cluster.
pub const CLUSTER_SIZE: u32 = 4096;
pub const SECTORS_PER_CLUSTER: u32 = CLUSTER_SIZE / SECTOR_SIZE;
/// Sectors before the first FAT.
pub const RESERVED_SECTORS: u32 = 32;
/// FAT entries 0 and 1 are dummies and do not map to data clusters.
pub const RESERVED_FAT_ENTRIES: u32 = 2;
/// The root directory always occupies the first data cluster.
pub const ROOT_DIR_CLUSTER: u32 = 2;

/// A volume with fewer data clusters must be FAT12 or FAT16.
const MIN_FAT32_CLUSTERS: u32 = 65_525;
/// FAT32 entries only use 28 bits; 0x0ffffff0 and up are reserved codes.
const MAX_FAT32_CLUSTERS: u32 = 0x0fff_fff0 - RESERVED_FAT_ENTRIES;

/// Round `value` up to a multiple of `to` (a power of two).
pub fn align(value: u64, to: u64) -> u64 {
    (value + to - 1) & !(to - 1)
}

/// The sector and cluster counts of a planned volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub data_clusters: u32,
    pub fat_sectors: u32,
    pub total_sectors: u32,
}

impl Geometry {
    /// Pick cluster, FAT and sector counts for a requested device size.
    ///
    /// The result may be larger or smaller than the request: the data
    /// cluster count is clamped to the FAT32 limits and the total is
    /// recomputed from the final layout. The block device must be
    /// configured with the returned total.
    pub fn plan(sectors: u32, sector_size: u32) -> Result<Geometry, Error> {
        if sector_size != SECTOR_SIZE {
            return Err(Error::Geometry(format!(
                "sector size {sector_size} not supported"
            )));
        }

        // The first calculation is too optimistic because the FAT needs
        // sectors too; the second corrects for that.
        let mut data_clusters =
            sectors.saturating_sub(RESERVED_SECTORS) / SECTORS_PER_CLUSTER;
        let mut fat_sectors = Self::fat_sectors_for(data_clusters);

        data_clusters = sectors.saturating_sub(RESERVED_SECTORS + fat_sectors)
            / SECTORS_PER_CLUSTER;
        data_clusters = data_clusters.clamp(MIN_FAT32_CLUSTERS, MAX_FAT32_CLUSTERS);
        fat_sectors = Self::fat_sectors_for(data_clusters);

        let total_sectors = RESERVED_SECTORS
            + fat_sectors
            + data_clusters * SECTORS_PER_CLUSTER;

        let geometry = Geometry {
            data_clusters,
            fat_sectors,
            total_sectors,
        };
        tracing::info!(
            total_sectors,
            reserved = RESERVED_SECTORS,
            fat_sectors,
            data_clusters,
            data_start = geometry.data_start(),
            "planned image layout"
        );
        Ok(geometry)
    }

    fn fat_sectors_for(data_clusters: u32) -> u32 {
        let bytes = (data_clusters as u64 + RESERVED_FAT_ENTRIES as u64) * 4;
        (align(bytes, SECTOR_SIZE as u64) / SECTOR_SIZE as u64) as u32
    }

    /// Byte offset of the FAT.
    pub fn fat_start(&self) -> u64 {
        (RESERVED_SECTORS * SECTOR_SIZE) as u64
    }

    /// Byte length of the FAT, including sector-alignment padding.
    pub fn fat_bytes(&self) -> u64 {
        self.fat_sectors as u64 * SECTOR_SIZE as u64
    }

    /// Byte offset of the first data cluster.
    pub fn data_start(&self) -> u64 {
        self.fat_start() + self.fat_bytes()
    }

    /// Total image size in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.total_sectors as u64 * SECTOR_SIZE as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_other_sector_sizes() {
        assert!(Geometry::plan(1_000_000, 4096).is_err());
        assert!(Geometry::plan(1_000_000, 512).is_ok());
    }

    #[test]
    fn small_requests_clamp_to_fat32_minimum() {
        let g = Geometry::plan(1000, 512).unwrap();
        assert_eq!(g.data_clusters, MIN_FAT32_CLUSTERS);
        assert_eq!(
            g.total_sectors,
            RESERVED_SECTORS + g.fat_sectors + g.data_clusters * SECTORS_PER_CLUSTER
        );
    }

    #[test]
    fn fat_space_is_accounted_for() {
        let g = Geometry::plan(8_000_000, 512).unwrap();
        // One 32-bit entry per cluster plus the two dummies, rounded up
        // to whole sectors.
        let expected = align((g.data_clusters as u64 + 2) * 4, 512) / 512;
        assert_eq!(g.fat_sectors as u64, expected);
        assert!(g.total_sectors <= 8_000_000);
        assert_eq!(g.data_start(), g.fat_start() + g.fat_bytes());
    }

    #[test]
    fn align_rounds_up() {
        assert_eq!(align(0, 512), 0);
        assert_eq!(align(1, 512), 512);
        assert_eq!(align(512, 512), 512);
        assert_eq!(align(513, 512), 1024);
    }
}
