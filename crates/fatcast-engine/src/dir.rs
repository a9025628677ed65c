//! FAT32 directory stream construction.
//!
//! Each directory owns the byte contents of its clusters: VFAT
//! long-filename records followed by a short record per entry, with
//! timestamps, attributes and cluster linkage encoded in the on-disk
//! layout. Short names are never real: every entry gets a unique but
//! deliberately invalid token so that only the long name is usable.

use std::collections::HashMap;

use chrono::{Datelike, Local, TimeZone, Timelike, Utc};

use crate::error::{Error, Result};

/// Attribute flags used in directory entries.
pub const ATTR_NONE: u8 = 0x00;
pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_LABEL: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
/// Marker value for long-filename records.
pub const ATTR_LFN: u8 = 0x0f;

pub const DIR_ENTRY_SIZE: usize = 32;
/// UTF-16 units carried per long-filename record.
const CHARS_PER_ENTRY: usize = 13;
/// A name plus its terminator may not exceed 255 + 1 UTF-16 units.
const MAX_NAME_UNITS: usize = 256;
/// Byte offsets of the 13 name units inside a long-filename record.
const LFN_CHAR_OFFSETS: [usize; CHARS_PER_ENTRY] =
    [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];

/// A filename as stored in directory entries: UTF-16 code units with the
/// terminating NUL included.
pub type Utf16Name = Vec<u16>;

/// Encode a string as a directory-entry filename.
pub fn utf16_name(name: &str) -> Utf16Name {
    let mut units: Vec<u16> = name.encode_utf16().collect();
    units.push(0);
    units
}

struct DirStream {
    /// First cluster of this directory in the FAT.
    start_cluster: u32,
    /// Most recently allocated cluster, where growth continues.
    last_cluster: u32,
    /// Clusters allocated so far.
    allocated: u32,
    data: Vec<u8>,
}

/// All directory streams of one volume.
pub struct DirTable {
    streams: Vec<DirStream>,
    by_cluster: HashMap<u32, usize>,
    /// Feeds the unique-but-invalid short name tokens. Reset with the
    /// table; collisions only become possible if one process session
    /// creates more entries than the token has bits for.
    name_counter: u32,
}

impl Default for DirTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DirTable {
    pub fn new() -> DirTable {
        DirTable {
            streams: Vec::new(),
            by_cluster: HashMap::new(),
            name_counter: 1,
        }
    }

    /// Track a new, empty directory starting at `cluster`.
    pub fn add_stream(&mut self, cluster: u32) -> usize {
        let index = self.streams.len();
        self.streams.push(DirStream {
            start_cluster: cluster,
            last_cluster: cluster,
            allocated: 1,
            data: Vec::new(),
        });
        self.by_cluster.insert(cluster, index);
        index
    }

    /// Index of the directory whose stream starts at `cluster`.
    pub fn index_of(&self, cluster: u32) -> Option<usize> {
        self.by_cluster.get(&cluster).copied()
    }

    pub fn start_cluster(&self, index: usize) -> u32 {
        self.streams[index].start_cluster
    }

    /// (allocated clusters, current byte length, last cluster).
    pub fn usage(&self, index: usize) -> (u32, usize, u32) {
        let stream = &self.streams[index];
        (stream.allocated, stream.data.len(), stream.last_cluster)
    }

    /// Record a cluster appended to the directory's chain.
    pub fn grow(&mut self, index: usize, new_last: u32) {
        let stream = &mut self.streams[index];
        stream.allocated += 1;
        stream.last_cluster = new_last;
    }

    /// Directory records needed for `name`, including the short entry.
    pub fn entry_count(name: &[u16]) -> Result<usize> {
        if name.len() > MAX_NAME_UNITS {
            return Err(Error::NameTooLong);
        }
        let num_entries = 1 + name.len().div_ceil(CHARS_PER_ENTRY);
        if num_entries > 32 {
            // Filesystem spec limitation.
            return Err(Error::NameTooLong);
        }
        Ok(num_entries)
    }

    /// Append the records for one entry to the directory's stream.
    ///
    /// The caller is responsible for having grown the underlying cluster
    /// chain first; see `Volume::add_entry`.
    pub fn append_entry(
        &mut self,
        index: usize,
        entry_cluster: u32,
        name: &[u16],
        file_size: u32,
        attrs: u8,
        mtime: i64,
        atime: i64,
    ) {
        let num_entries = 1 + name.len().div_ceil(CHARS_PER_ENTRY);

        let mut short = [0u8; DIR_ENTRY_SIZE];
        self.prep_short_name(&mut short);
        // Everything in the image is read-only to the client.
        let attrs = attrs | ATTR_READ_ONLY;
        let file_size = if attrs & ATTR_DIRECTORY != 0 { 0 } else { file_size };
        short[11] = attrs;
        short[12] = 0;
        // The timestamp format only encodes down to 2 seconds; this byte
        // adds the odd second back in 10ms units.
        short[13] = ((mtime & 1) * 100) as u8;
        // The field at 14 calls for creation time, which the host does
        // not reliably have; modification time substitutes.
        encode_datetime(&mut short[14..18], mtime);
        encode_date(&mut short[18..20], atime);
        short[20] = (entry_cluster >> 16) as u8;
        short[21] = (entry_cluster >> 24) as u8;
        encode_datetime(&mut short[22..26], mtime);
        short[26] = entry_cluster as u8;
        short[27] = (entry_cluster >> 8) as u8;
        short[28..32].copy_from_slice(&file_size.to_le_bytes());

        let checksum = shortname_checksum(&short[..11]);
        let stream = &mut self.streams[index];
        // Name parts are stored last-to-first, with decreasing sequence
        // numbers.
        for seq in (1..num_entries).rev() {
            let mut record = [0u8; DIR_ENTRY_SIZE];
            fill_name_record(&mut record, seq, seq == num_entries - 1, name, checksum);
            stream.data.extend_from_slice(&record);
        }
        stream.data.extend_from_slice(&short);
    }

    /// Fill `buf` from the directory's stream; bytes past the end of the
    /// stream read as zero.
    pub fn fill(&self, index: usize, buf: &mut [u8], offset: u64) {
        let data = &self.streams[index].data;
        let start = (offset.min(data.len() as u64)) as usize;
        let take = buf.len().min(data.len() - start);
        buf[..take].copy_from_slice(&data[start..start + take]);
        buf[take..].fill(0);
    }

    /// The first 11 bytes are the short name buffer. Fill it with an
    /// invalid but unique value; see <http://lkml.org/lkml/2009/6/26/313>
    /// for the scheme.
    fn prep_short_name(&mut self, entry: &mut [u8; DIR_ENTRY_SIZE]) {
        let mut uniq = self.name_counter;
        self.name_counter = self.name_counter.wrapping_add(1);
        entry[0] = b' ';
        entry[1] = 0;
        for slot in &mut entry[2..8] {
            *slot = (uniq & 0x1f) as u8;
            uniq >>= 5;
        }
        entry[8] = b'/';
        entry[9] = 0;
        entry[10] = 0;
    }
}

fn fill_name_record(
    record: &mut [u8; DIR_ENTRY_SIZE],
    seq: usize,
    is_last: bool,
    name: &[u16],
    checksum: u8,
) {
    record[0] = if is_last { seq as u8 | 0x40 } else { seq as u8 };
    record[11] = ATTR_LFN;
    record[12] = 0;
    record[13] = checksum;
    record[26] = 0; // cluster number, unused in LFN records
    record[27] = 0;

    let base = (seq - 1) * CHARS_PER_ENTRY;
    for (i, &at) in LFN_CHAR_OFFSETS.iter().enumerate() {
        // The terminating NUL is part of the name; positions past it pad
        // with 0xffff.
        let unit = name.get(base + i).copied().unwrap_or(0xffff);
        record[at..at + 2].copy_from_slice(&unit.to_le_bytes());
    }
}

/// The 8-bit checksum linking long-filename records to their short
/// entry, computed over the 11 short name bytes.
pub fn shortname_checksum(short_name: &[u8]) -> u8 {
    short_name
        .iter()
        .fold(0u8, |sum, &b| sum.rotate_right(1).wrapping_add(b))
}

/// Encode seconds-since-epoch as FAT time and date words, local time.
/// Consumer devices expect local time in directory entries.
fn encode_datetime(buf: &mut [u8], stamp: i64) {
    let (time_part, date_part) = match Local.timestamp_opt(stamp, 0).single() {
        Some(t) => (
            ((t.second() / 2) | (t.minute() << 5) | (t.hour() << 11)) as u16,
            fat_date(t.day(), t.month(), t.year()),
        ),
        None => (0, 0),
    };
    buf[0..2].copy_from_slice(&time_part.to_le_bytes());
    buf[2..4].copy_from_slice(&date_part.to_le_bytes());
}

/// Encode seconds-since-epoch as a FAT date word, UTC.
fn encode_date(buf: &mut [u8], stamp: i64) {
    let date_part = match Utc.timestamp_opt(stamp, 0).single() {
        Some(t) => fat_date(t.day(), t.month(), t.year()),
        None => 0,
    };
    buf[0..2].copy_from_slice(&date_part.to_le_bytes());
}

/// FAT dates count years from 1980.
fn fat_date(day: u32, month: u32, year: i32) -> u16 {
    (day | (month << 5) | ((year.wrapping_sub(1980) as u32) << 9)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_of_first_token() {
        // The token produced for the very first entry of a table.
        let name = [b' ', 0, 1, 0, 0, 0, 0, 0, b'/', 0, 0];
        assert_eq!(shortname_checksum(&name), 212);
        let name = [b' ', 0, 2, 0, 0, 0, 0, 0, b'/', 0, 0];
        assert_eq!(shortname_checksum(&name), 213);
    }

    #[test]
    fn utf16_names_carry_their_terminator() {
        assert_eq!(utf16_name("."), vec!['.' as u16, 0]);
        assert_eq!(utf16_name("ab"), vec!['a' as u16, 'b' as u16, 0]);
    }

    #[test]
    fn entry_counts_and_limits() {
        // 12 characters plus the terminator fit in one LFN record.
        assert_eq!(DirTable::entry_count(&utf16_name("testname.tst")).unwrap(), 2);
        // 26 characters need three records; the terminator gets its own.
        let alphabet: String = ('a'..='z').collect();
        assert_eq!(DirTable::entry_count(&utf16_name(&alphabet)).unwrap(), 4);
        // 255 characters is the limit, 256 is past it.
        let long = "a".repeat(255);
        assert!(DirTable::entry_count(&utf16_name(&long)).is_ok());
        let too_long = "a".repeat(256);
        assert!(matches!(
            DirTable::entry_count(&utf16_name(&too_long)),
            Err(Error::NameTooLong)
        ));
    }

    #[test]
    fn short_name_tokens_are_unique() {
        let mut table = DirTable::new();
        let mut a = [0u8; DIR_ENTRY_SIZE];
        let mut b = [0u8; DIR_ENTRY_SIZE];
        table.prep_short_name(&mut a);
        table.prep_short_name(&mut b);
        assert_ne!(a[..11], b[..11]);
        // Invalid lead byte keeps the token from colliding with real
        // short names.
        assert_eq!(a[0], b' ');
        assert_eq!(a[8], b'/');
    }
}
