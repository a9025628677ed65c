//! Extent-compressed File Allocation Table.
//!
//! The FAT is a dense array of 32-bit entries, four bytes per data
//! cluster. Storing it literally for a large volume would cost tens of
//! megabytes, so it is kept as a sorted list of extents instead: runs of
//! entries that either all hold the same value or form an ascending
//! chain where each entry points at its neighbour. The list stays near
//! one extent per allocated file or directory.
//!
//! The table has two stages. During construction, directories are
//! allocated from the low end and mapped files reserved from the high
//! end. [`Fat::finalize`] fills the gap with free and unusable markers
//! and splices the high-end reservations in; after that the table
//! answers fills and absorbs client writes.

use crate::error::{Error, Result};
use crate::geometry::{
    align, CLUSTER_SIZE, RESERVED_FAT_ENTRIES, RESERVED_SECTORS, SECTOR_SIZE,
};

/// End-of-chain marker, also used for unset `prev` hints.
pub const END_OF_CHAIN: u32 = 0x0fff_ffff;
/// Marks a cluster the filesystem must not allocate.
pub const BAD_CLUSTER: u32 = 0x0fff_fff7;
/// A free FAT entry.
pub const UNALLOCATED: u32 = 0;
/// Entry 0 carries the media descriptor in its low byte, matching the
/// boot sector.
const MEDIA_DESCRIPTOR: u32 = 0x0fff_fff8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtentKind {
    /// Every entry in the run holds `value`; not part of any chain.
    Literal { value: u32 },
    /// Entries point at their successor; the last one holds `next`.
    /// `prev` is the last cluster of the upstream extent, or
    /// `END_OF_CHAIN` when the extent starts a chain or the hint has
    /// been invalidated.
    Chain { next: u32, prev: u32 },
}

/// A contiguous run of FAT entries `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Extent {
    start: u32,
    end: u32,
    kind: ExtentKind,
}

impl Extent {
    fn literal(start: u32, end: u32, value: u32) -> Extent {
        Extent {
            start,
            end,
            kind: ExtentKind::Literal { value },
        }
    }

    fn chain(start: u32, end: u32, next: u32, prev: u32) -> Extent {
        Extent {
            start,
            end,
            kind: ExtentKind::Chain { next, prev },
        }
    }
}

/// The extent-compressed FAT of one volume.
pub struct Fat {
    data_clusters: u32,
    fat_bytes: u64,
    /// During construction: the reserved entries and the directories,
    /// ascending. After finalize: the whole cluster range.
    extents: Vec<Extent>,
    /// File reservations ordered high to low for cheap appending;
    /// spliced onto `extents` by finalize.
    extents_from_end: Vec<Extent>,
}

impl Fat {
    pub fn new(data_clusters: u32) -> Fat {
        let entries = data_clusters as u64 + RESERVED_FAT_ENTRIES as u64;
        Fat {
            data_clusters,
            fat_bytes: align(entries * 4, SECTOR_SIZE as u64),
            extents: vec![
                Extent::literal(0, 0, MEDIA_DESCRIPTOR),
                Extent::literal(1, 1, END_OF_CHAIN),
            ],
            extents_from_end: Vec::new(),
        }
    }

    pub fn data_clusters(&self) -> u32 {
        self.data_clusters
    }

    /// Byte length of the FAT, including sector-alignment padding.
    pub fn fat_bytes(&self) -> u64 {
        self.fat_bytes
    }

    /// Number of FAT entries, including the two reserved ones.
    fn entry_count(&self) -> u32 {
        self.data_clusters + RESERVED_FAT_ENTRIES
    }

    fn valid_chain_value(&self, value: u32) -> bool {
        value == END_OF_CHAIN
            || (value >= RESERVED_FAT_ENTRIES && value < self.entry_count())
    }

    /// Only valid during the construction stage.
    fn first_free_cluster(&self) -> u32 {
        self.extents.last().map_or(RESERVED_FAT_ENTRIES, |e| e.end + 1)
    }

    /// Only valid during the construction stage.
    fn last_free_cluster(&self) -> u32 {
        match self.extents_from_end.last() {
            Some(e) => e.start - 1,
            None => self.entry_count() - 1,
        }
    }

    fn find_extent(&self, cluster: u32) -> Option<usize> {
        self.extents
            .binary_search_by(|e| {
                if cluster < e.start {
                    std::cmp::Ordering::Greater
                } else if cluster > e.end {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .ok()
    }

    /// Byte position of a data cluster in the image.
    pub fn cluster_pos(&self, cluster: u32) -> u64 {
        (RESERVED_SECTORS * SECTOR_SIZE) as u64
            + self.fat_bytes
            + (cluster - RESERVED_FAT_ENTRIES) as u64 * CLUSTER_SIZE as u64
    }

    /// Append a chain of `clusters` clusters at the lowest free index.
    /// Used for directories. Returns the starting cluster.
    pub fn alloc_beginning(&mut self, clusters: u32) -> Result<u32> {
        debug_assert!(clusters > 0);
        let start = self.first_free_cluster();
        let end = start + clusters - 1;
        if end > self.last_free_cluster() {
            return Err(Error::VolumeFull);
        }
        self.extents
            .push(Extent::chain(start, end, END_OF_CHAIN, END_OF_CHAIN));
        Ok(start)
    }

    /// Reserve a chain of `clusters` clusters at the highest free index.
    /// Used for mapped files. Returns the starting cluster.
    pub fn alloc_end(&mut self, clusters: u32) -> Result<u32> {
        debug_assert!(clusters > 0);
        let end = self.last_free_cluster();
        let start = end
            .checked_sub(clusters - 1)
            .filter(|&start| start >= self.first_free_cluster())
            .ok_or(Error::VolumeFull)?;
        self.extents_from_end
            .push(Extent::chain(start, end, END_OF_CHAIN, END_OF_CHAIN));
        Ok(start)
    }

    /// Walk the chain containing `cluster` to its end and append one
    /// cluster. Returns the new last cluster, or `None` if the cluster
    /// is not part of a chain or the volume is full.
    pub fn extend_chain(&mut self, cluster: u32) -> Option<u32> {
        let mut idx = self.find_extent(cluster)?;
        loop {
            match self.extents[idx].kind {
                ExtentKind::Literal { .. } => return None,
                ExtentKind::Chain { next, .. } => {
                    if next == END_OF_CHAIN {
                        break;
                    }
                    idx = self.find_extent(next)?;
                }
            }
        }

        if idx == self.extents.len() - 1 {
            // The chain's tail is still the newest low extent, so it can
            // grow in place.
            if self.extents[idx].end >= self.last_free_cluster() {
                return None;
            }
            self.extents[idx].end += 1;
            return Some(self.extents[idx].end);
        }

        let start = self.first_free_cluster();
        if start > self.last_free_cluster() {
            return None;
        }
        let tail_end = self.extents[idx].end;
        if let ExtentKind::Chain { next, .. } = &mut self.extents[idx].kind {
            *next = start;
        }
        self.extents
            .push(Extent::chain(start, start, END_OF_CHAIN, tail_end));
        Some(start)
    }

    /// Transition from construction to service.
    ///
    /// The gap between the directories and the mapped files becomes an
    /// unallocated extent of at most `max_free_clusters` clusters
    /// followed by a bad-cluster extent, so the volume never reports
    /// more free space than the host filesystem actually has.
    pub fn finalize(&mut self, max_free_clusters: u32) {
        let free_start = self.first_free_cluster();
        let last_free = self.last_free_cluster();
        let free_cap = free_start as u64 + max_free_clusters as u64;
        let free_end = (last_free as u64).min(free_cap.saturating_sub(1)) as u32;

        let mut bad_start = free_start;
        if free_end >= free_start {
            self.extents
                .push(Extent::literal(free_start, free_end, UNALLOCATED));
            bad_start = free_end + 1;
        }
        if last_free >= bad_start {
            self.extents
                .push(Extent::literal(bad_start, last_free, BAD_CLUSTER));
        }

        self.extents.extend(self.extents_from_end.drain(..).rev());
    }

    /// Synthesize FAT entries in host byte order starting at
    /// `first_entry`. Entries past the data clusters read as
    /// `BAD_CLUSTER`: the tail of the last FAT sector has no defined
    /// contents and unusable markers are the safe choice.
    pub fn fill_entries(&self, out: &mut [u32], first_entry: u32) {
        let mut i = 0usize;
        let mut idx = self
            .find_extent(first_entry)
            .unwrap_or(self.extents.len());
        while i < out.len() && idx < self.extents.len() {
            let fe = self.extents[idx];
            match fe.kind {
                ExtentKind::Literal { value } => {
                    while i < out.len() && first_entry + i as u32 <= fe.end {
                        out[i] = value;
                        i += 1;
                    }
                }
                ExtentKind::Chain { next, .. } => {
                    while i < out.len() && first_entry + (i as u32) < fe.end {
                        out[i] = first_entry + i as u32 + 1;
                        i += 1;
                    }
                    if i < out.len() {
                        out[i] = next;
                        i += 1;
                    }
                }
            }
            idx += 1;
        }
        for slot in &mut out[i..] {
            *slot = BAD_CLUSTER;
        }
    }

    /// Byte-level rendering of [`Fat::fill_entries`], little-endian.
    ///
    /// The image map slices ranges at arbitrary positions, so partial
    /// leading and trailing entries are handled here.
    pub fn fill_bytes(&self, buf: &mut [u8], offset: u64) {
        let mut pos = 0usize;
        let mut entry = (offset / 4) as u32;

        let head = (offset % 4) as usize;
        if head != 0 {
            let mut one = [0u32; 1];
            self.fill_entries(&mut one, entry);
            let bytes = one[0].to_le_bytes();
            let take = (4 - head).min(buf.len());
            buf[..take].copy_from_slice(&bytes[head..head + take]);
            pos = take;
            entry += 1;
        }

        let mut window = [0u32; 512];
        while buf.len() - pos >= 4 {
            let entries = ((buf.len() - pos) / 4).min(window.len());
            self.fill_entries(&mut window[..entries], entry);
            for value in &window[..entries] {
                buf[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
                pos += 4;
            }
            entry += entries as u32;
        }

        if pos < buf.len() {
            let mut one = [0u32; 1];
            self.fill_entries(&mut one, entry);
            let take = buf.len() - pos;
            buf[pos..].copy_from_slice(&one[0].to_le_bytes()[..take]);
        }
    }

    /// Accept a client write into the FAT and interpret it back into
    /// extent changes.
    ///
    /// The write is diffed against a freshly synthesized copy of the
    /// same region, so unchanged entries cost nothing. A rejected entry
    /// aborts the call but leaves edits from earlier entries of the same
    /// call applied.
    pub fn receive(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        if offset % 4 != 0 || buf.len() % 4 != 0 {
            return Err(Error::Misaligned);
        }
        let first_entry = (offset / 4) as u32;

        let mut orig = vec![0u32; buf.len() / 4];
        self.fill_entries(&mut orig, first_entry);

        for (i, word) in buf.chunks_exact(4).enumerate() {
            let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            if value == orig[i] {
                continue;
            }
            let entry = first_entry + i as u32;
            if entry < RESERVED_FAT_ENTRIES {
                return Err(Error::FatMutation("write to a reserved entry"));
            }
            if orig[i] == BAD_CLUSTER {
                return Err(Error::FatMutation("write over a bad-cluster marker"));
            }
            let idx = match self.find_extent(entry) {
                Some(idx) if idx > 0 => idx,
                _ => return Err(Error::FatMutation("entry not tracked by any extent")),
            };

            if self.extents[idx].start == entry && self.try_inc_extent(idx - 1, value) {
                // The previous extent absorbed this entry.
                self.bump_extent(idx);
                continue;
            }
            if self.extents[idx].end == entry && self.try_renext_extent(idx, value) {
                continue;
            }
            self.punch_extent(idx, entry, value);
        }
        Ok(())
    }

    /// Try to grow the extent at `idx` by one entry holding `value`.
    ///
    /// A literal extent absorbs an entry of its own value. A chain
    /// extent absorbs one if its next pointer was pointing at the
    /// following entry anyway, which happens while a client lays down a
    /// freshly allocated chain one sector at a time.
    fn try_inc_extent(&mut self, idx: usize, value: u32) -> bool {
        let fe = self.extents[idx];
        match fe.kind {
            ExtentKind::Literal { value: lit } if lit == value => {
                self.extents[idx].end += 1;
                true
            }
            ExtentKind::Chain { next, prev }
                if next == fe.end + 1 && self.valid_chain_value(value) =>
            {
                self.extents[idx] = Extent::chain(fe.start, fe.end + 1, value, prev);
                true
            }
            _ => false,
        }
    }

    /// The extent at `idx` had its first entry stolen; adjust it.
    fn bump_extent(&mut self, idx: usize) {
        let fe = self.extents[idx];
        if fe.start == fe.end {
            self.extents.remove(idx);
            return;
        }
        self.extents[idx].start += 1;
        if let ExtentKind::Chain { prev, .. } = &mut self.extents[idx].kind {
            // The upstream entry no longer points at our first cluster.
            *prev = END_OF_CHAIN;
        }
    }

    /// Rewrite the terminal next pointer of a chain extent, if `value`
    /// makes sense as one.
    fn try_renext_extent(&mut self, idx: usize, value: u32) -> bool {
        if self.extents[idx].start < RESERVED_FAT_ENTRIES {
            return false;
        }
        if !self.valid_chain_value(value) {
            return false;
        }
        match &mut self.extents[idx].kind {
            ExtentKind::Chain { next, .. } => {
                *next = value;
                true
            }
            ExtentKind::Literal { .. } => false,
        }
    }

    /// Split or reuse the extent at `idx` so that `cluster` becomes a
    /// single-entry extent holding `value`.
    fn punch_extent(&mut self, idx: usize, cluster: u32, value: u32) {
        let new_ext = if value == UNALLOCATED || value == BAD_CLUSTER {
            Extent::literal(cluster, cluster, value)
        } else {
            Extent::chain(cluster, cluster, value, END_OF_CHAIN)
        };

        let fe = self.extents[idx];
        if fe.start == fe.end {
            self.extents[idx] = new_ext;
            return;
        }
        if fe.start == cluster {
            self.extents[idx].start += 1;
            self.extents.insert(idx, new_ext);
            return;
        }
        if fe.end == cluster {
            self.extents[idx].end -= 1;
            if let ExtentKind::Chain { next, .. } = &mut self.extents[idx].kind {
                // The truncated run still links to the punched cluster.
                *next = cluster;
            }
            self.extents.insert(idx + 1, new_ext);
            return;
        }

        // The extent splits in three.
        let mut post = fe;
        post.start = cluster + 1;
        self.extents[idx].end = cluster - 1;
        if let ExtentKind::Chain { next, .. } = &mut self.extents[idx].kind {
            *next = cluster;
        }
        if let ExtentKind::Chain { prev, .. } = &mut post.kind {
            // The chain is broken at the punched entry.
            *prev = END_OF_CHAIN;
        }
        self.extents.insert(idx + 1, new_ext);
        self.extents.insert(idx + 2, post);
    }

    /// Verify chain linkage across all extents.
    ///
    /// Scans chain extents in reverse; every next pointer must land on
    /// an existing chain extent's first cluster. Back pointers are
    /// reconstructed opportunistically along the way: an extent already
    /// claimed by another upstream extent is a conflict.
    pub fn is_consistent(&mut self) -> bool {
        for i in (0..self.extents.len()).rev() {
            let fe = self.extents[i];
            let next = match fe.kind {
                ExtentKind::Chain { next, .. } => next,
                ExtentKind::Literal { .. } => continue,
            };
            if next == END_OF_CHAIN {
                continue;
            }
            if !self.valid_chain_value(next) {
                return false;
            }
            let nidx = match self.find_extent(next) {
                Some(nidx) => nidx,
                None => return false,
            };
            let nfe = self.extents[nidx];
            if nfe.start != next {
                return false;
            }
            match nfe.kind {
                ExtentKind::Literal { .. } => return false,
                ExtentKind::Chain { prev, .. } => {
                    if prev == END_OF_CHAIN {
                        // Unclaimed; record the back-pointer now.
                        if let ExtentKind::Chain { prev, .. } =
                            &mut self.extents[nidx].kind
                        {
                            *prev = fe.end;
                        }
                    } else if prev != fe.end {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Structural diagnostics: the extents must partition the cluster
    /// range in ascending order and chain extents must carry chain
    /// values. Intended for tests.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        if self.extents.len() < RESERVED_FAT_ENTRIES as usize {
            return Err("reserved FAT entries missing".into());
        }
        if self.extents[0].start != 0 {
            return Err(format!(
                "extents do not start at 0 (first cluster {})",
                self.extents[0].start
            ));
        }
        let last = self.extents[self.extents.len() - 1].end;
        let expected = self.entry_count() - 1;
        if last != expected {
            return Err(format!(
                "last extent ends at {last}, expected {expected}"
            ));
        }
        let mut prev_end = None;
        for (i, fe) in self.extents.iter().enumerate() {
            if fe.start > fe.end {
                return Err(format!("inverted extent {i} ({}..{})", fe.start, fe.end));
            }
            if let Some(prev_end) = prev_end {
                if fe.start != prev_end + 1 {
                    return Err(format!(
                        "gap between extents (clusters {prev_end} and {})",
                        fe.start
                    ));
                }
            }
            if let ExtentKind::Chain { next, .. } = fe.kind {
                if next == UNALLOCATED || next == BAD_CLUSTER {
                    return Err(format!("extent {i} has bad next (0x{next:x})"));
                }
            }
            prev_end = Some(fe.end);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DATA_CLUSTERS: u32 = 1_000_000;

    fn entries(fat: &Fat, first: u32, count: usize) -> Vec<u32> {
        let mut out = vec![0u32; count];
        fat.fill_entries(&mut out, first);
        out
    }

    #[test]
    fn find_extent_hits_and_misses() {
        let mut fat = Fat::new(DATA_CLUSTERS);
        fat.alloc_beginning(3).unwrap();
        assert_eq!(fat.find_extent(0), Some(0));
        assert_eq!(fat.find_extent(1), Some(1));
        assert_eq!(fat.find_extent(2), Some(2));
        assert_eq!(fat.find_extent(4), Some(2));
        assert_eq!(fat.find_extent(5), None);
    }

    #[test]
    fn punch_reuses_single_cluster_extent() {
        let mut fat = Fat::new(DATA_CLUSTERS);
        fat.alloc_beginning(1).unwrap();
        fat.finalize(DATA_CLUSTERS);
        // Entry 2 is a single-cluster chain; punching it replaces it.
        let idx = fat.find_extent(2).unwrap();
        fat.punch_extent(idx, 2, UNALLOCATED);
        assert_eq!(entries(&fat, 2, 1), vec![UNALLOCATED]);
        fat.check_invariants().unwrap();
    }

    #[test]
    fn punch_splits_front_back_and_middle() {
        let mut fat = Fat::new(DATA_CLUSTERS);
        fat.finalize(DATA_CLUSTERS);

        // Front of the free extent.
        let idx = fat.find_extent(2).unwrap();
        fat.punch_extent(idx, 2, END_OF_CHAIN);
        assert_eq!(entries(&fat, 2, 2), vec![END_OF_CHAIN, UNALLOCATED]);
        fat.check_invariants().unwrap();

        // Middle of the free extent.
        let idx = fat.find_extent(100).unwrap();
        fat.punch_extent(idx, 100, END_OF_CHAIN);
        assert_eq!(
            entries(&fat, 99, 3),
            vec![UNALLOCATED, END_OF_CHAIN, UNALLOCATED]
        );
        fat.check_invariants().unwrap();

        // Back of the extent that now ends at 99.
        let idx = fat.find_extent(99).unwrap();
        fat.punch_extent(idx, 99, END_OF_CHAIN);
        assert_eq!(
            entries(&fat, 98, 3),
            vec![UNALLOCATED, END_OF_CHAIN, END_OF_CHAIN]
        );
        fat.check_invariants().unwrap();
    }

    #[test]
    fn punch_back_split_preserves_chain_tail_linkage() {
        let mut fat = Fat::new(DATA_CLUSTERS);
        fat.alloc_beginning(5).unwrap(); // clusters 2..=6
        fat.finalize(DATA_CLUSTERS);
        // Punch the last cluster of the chain; the truncated run must
        // still point at it.
        let idx = fat.find_extent(6).unwrap();
        fat.punch_extent(idx, 6, END_OF_CHAIN);
        assert_eq!(entries(&fat, 2, 5), vec![3, 4, 5, 6, END_OF_CHAIN]);
        fat.check_invariants().unwrap();
    }

    #[test]
    fn chain_values_are_validated() {
        let fat = Fat::new(DATA_CLUSTERS);
        assert!(fat.valid_chain_value(END_OF_CHAIN));
        assert!(fat.valid_chain_value(2));
        assert!(fat.valid_chain_value(DATA_CLUSTERS + 1));
        assert!(!fat.valid_chain_value(0));
        assert!(!fat.valid_chain_value(1));
        assert!(!fat.valid_chain_value(DATA_CLUSTERS + 2));
        assert!(!fat.valid_chain_value(BAD_CLUSTER));
    }
}
