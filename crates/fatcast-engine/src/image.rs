//! Image content routing.
//!
//! Most of the image is never stored literally: byte ranges are mapped
//! to providers that synthesize their data on demand. Data written by
//! the client is kept in overlay chunks that shadow the providers until
//! cleared. Both tables are keyed by image start offset and hold
//! non-overlapping ranges.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::rc::Rc;

use crate::error::Result;

/// A range of image bytes backed by on-demand synthesis.
///
/// Implementations serve a logical bytestream; the map translates image
/// offsets to logical offsets at call time, so one provider can back
/// several image ranges (a fragmented file, a grown directory). The map
/// holds one `Rc` per registered range: a provider lives exactly as long
/// as some part of the image still routes to it.
pub trait Provider {
    /// Fill `buf` from the logical bytestream starting at `offset`.
    fn fill(&self, buf: &mut [u8], offset: u64) -> Result<()>;

    /// Offer bytes the client wrote at logical `offset`.
    ///
    /// Returning an error rejects the write; the map will not store it.
    fn receive(&self, buf: &[u8], offset: u64) -> Result<()>;
}

struct SourceRange {
    length: u64,
    /// Logical offset of this range's first byte, from the provider's
    /// point of view.
    offset: u64,
    source: Rc<dyn Provider>,
}

/// Offset-indexed routing table for the virtual image.
///
/// Uncovered bytes read as zero. Overlay chunks take precedence over
/// providers on reads; a provider still sees every write that overlaps
/// its range before the overlay is installed.
#[derive(Default)]
pub struct ImageMap {
    sources: BTreeMap<u64, SourceRange>,
    chunks: BTreeMap<u64, Vec<u8>>,
}

impl ImageMap {
    pub fn new() -> ImageMap {
        ImageMap::default()
    }

    /// Route `[start, start+length)` to `source`, evicting anything
    /// previously registered there.
    pub fn register(&mut self, source: Rc<dyn Provider>, start: u64, length: u64, offset: u64) {
        if length == 0 {
            // Dropping `source` here releases the caller's handle.
            return;
        }
        self.clear_sources(start, length);
        self.sources.insert(
            start,
            SourceRange {
                length,
                offset,
                source,
            },
        );
    }

    /// Accept client-written data and store it for future fills.
    ///
    /// Every provider overlapping the range is offered its slice first,
    /// in ascending order; if any of them rejects, nothing is stored and
    /// the rejection is returned.
    pub fn receive(&mut self, buf: &[u8], start: u64) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.offer_to_sources(buf, start)?;
        self.clear_data(start, buf.len() as u64);
        self.chunks.insert(start, buf.to_vec());
        Ok(())
    }

    fn offer_to_sources(&self, buf: &[u8], start: u64) -> Result<()> {
        let end = start + buf.len() as u64;
        let first = match self.source_at(start) {
            Some((first, _)) => first,
            None => start,
        };
        for (&range_start, range) in self.sources.range(first..) {
            if range_start >= end {
                break;
            }
            // Clip the write to this range; `pos` is where the two
            // actually start overlapping.
            let off = start.saturating_sub(range_start);
            let pos = range_start + off;
            let len = (range.length - off).min(end - pos) as usize;
            let slice = &buf[(pos - start) as usize..][..len];
            range.source.receive(slice, range.offset + off)?;
        }
        Ok(())
    }

    /// Fill `buf` from overlay chunks, providers, and zeroes, in that
    /// order of preference. A provider failure aborts the whole fill.
    pub fn fill(&self, buf: &mut [u8], start: u64) -> Result<()> {
        let end = start + buf.len() as u64;
        let mut pos = start;
        while pos < end {
            let at = (pos - start) as usize;
            let mut limit = end;

            // Received data has priority.
            if let Some((chunk_start, chunk)) = self.chunk_at(pos) {
                let off = (pos - chunk_start) as usize;
                let take = (chunk.len() - off).min((end - pos) as usize);
                buf[at..at + take].copy_from_slice(&chunk[off..off + take]);
                pos += take as u64;
                continue;
            }
            if let Some(next) = self.next_chunk_start(pos) {
                limit = limit.min(next);
            }

            if let Some((range_start, range)) = self.source_at(pos) {
                let off = pos - range_start;
                let take = (range.length - off).min(limit - pos) as usize;
                range.source.fill(&mut buf[at..at + take], range.offset + off)?;
                pos += take as u64;
                continue;
            }
            if let Some(next) = self.next_source_start(pos) {
                limit = limit.min(next);
            }

            // Nothing defined here.
            let take = (limit - pos) as usize;
            buf[at..at + take].fill(0);
            pos += take as u64;
        }
        Ok(())
    }

    /// Throw away received data in the range; providers become visible
    /// to fills again. Chunks sticking out of the range are trimmed.
    pub fn clear_data(&mut self, start: u64, length: u64) {
        if length == 0 {
            return;
        }
        let end = start + length;
        let mut affected: Vec<u64> = Vec::new();
        if let Some((chunk_start, _)) = self.chunk_at(start) {
            affected.push(chunk_start);
        }
        affected.extend(
            self.chunks
                .range((Excluded(start), Excluded(end)))
                .map(|(&s, _)| s),
        );
        for chunk_start in affected {
            let data = match self.chunks.remove(&chunk_start) {
                Some(data) => data,
                None => continue,
            };
            let chunk_end = chunk_start + data.len() as u64;
            if chunk_end > end {
                self.chunks
                    .insert(end, data[(end - chunk_start) as usize..].to_vec());
            }
            if chunk_start < start {
                let mut head = data;
                head.truncate((start - chunk_start) as usize);
                self.chunks.insert(chunk_start, head);
            }
        }
    }

    /// Remove provider routing in the range. Ranges that only partly
    /// overlap keep their remainder; a range evicted entirely drops its
    /// provider reference.
    pub fn clear_sources(&mut self, start: u64, length: u64) {
        if length == 0 {
            return;
        }
        let end = start + length;
        let mut affected: Vec<u64> = Vec::new();
        if let Some((range_start, _)) = self.source_at(start) {
            affected.push(range_start);
        }
        affected.extend(
            self.sources
                .range((Excluded(start), Excluded(end)))
                .map(|(&s, _)| s),
        );
        for range_start in affected {
            let range = match self.sources.remove(&range_start) {
                Some(range) => range,
                None => continue,
            };
            let range_end = range_start + range.length;
            if range_end > end {
                self.sources.insert(
                    end,
                    SourceRange {
                        length: range_end - end,
                        offset: range.offset + (end - range_start),
                        source: Rc::clone(&range.source),
                    },
                );
            }
            if range_start < start {
                self.sources.insert(
                    range_start,
                    SourceRange {
                        length: start - range_start,
                        offset: range.offset,
                        source: range.source,
                    },
                );
            }
        }
    }

    fn chunk_at(&self, pos: u64) -> Option<(u64, &Vec<u8>)> {
        match self.chunks.range(..=pos).next_back() {
            Some((&start, chunk)) if start + chunk.len() as u64 > pos => {
                Some((start, chunk))
            }
            _ => None,
        }
    }

    fn next_chunk_start(&self, pos: u64) -> Option<u64> {
        self.chunks
            .range((Excluded(pos), Unbounded))
            .next()
            .map(|(&start, _)| start)
    }

    fn source_at(&self, pos: u64) -> Option<(u64, &SourceRange)> {
        match self.sources.range(..=pos).next_back() {
            Some((&start, range)) if start + range.length > pos => Some((start, range)),
            _ => None,
        }
    }

    fn next_source_start(&self, pos: u64) -> Option<u64> {
        self.sources
            .range((Excluded(pos), Unbounded))
            .next()
            .map(|(&start, _)| start)
    }
}
