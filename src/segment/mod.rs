// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod binary_index;
pub mod block;
pub mod filter;
pub mod footer;
pub mod hash_index;
pub mod sorted_index;
pub mod writer;

use crate::{
    cache::{BlockCache, CacheKey},
    coding::Decode,
    config::MmapPolicy,
    entry::{Entry, Value},
    key_range::KeyRange,
    order::KeyOrder,
    retry::retry,
    time::Time,
    Direction, Slice, UserKey,
};
use self::footer::{BlockHandle, Footer, FORMAT_VERSION, MAGIC_BYTES, TRAILER_SIZE};
use self::sorted_index::IndexReader;
use std::collections::VecDeque;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering::Acquire, Ordering::Release},
    Arc,
};

/// Monotonically increasing segment file id
pub type SegmentId = u64;

/// File extension of segment files
pub const SEGMENT_EXT: &str = "seg";

const BLOCK_RETRY_LIMIT: usize = 3;

pub(crate) enum FileReader {
    Mmap(memmap2::Mmap),
    File(std::fs::File),
}

impl FileReader {
    fn open(path: &Path, mmap: MmapPolicy) -> crate::Result<(Self, u64)> {
        let file = std::fs::File::open(path)?;
        let len = file.metadata()?.len();

        Ok(match mmap {
            MmapPolicy::Disabled => (Self::File(file), len),
            MmapPolicy::ReadOnly | MmapPolicy::WriteAndRead => {
                // SAFETY: segments are immutable after publication and only
                // unlinked once the last reader handle is dropped
                #[allow(unsafe_code)]
                let map = unsafe { memmap2::Mmap::map(&file)? };
                (Self::Mmap(map), len)
            }
        })
    }

    fn read(&self, offset: u64, len: usize) -> crate::Result<Vec<u8>> {
        match self {
            Self::Mmap(map) => map
                .get(offset as usize..offset as usize + len)
                .map(<[u8]>::to_vec)
                .ok_or(crate::Error::CorruptedBlock("read beyond end of file")),
            Self::File(file) => {
                let mut buf = vec![0; len];

                #[cfg(unix)]
                {
                    use std::os::unix::fs::FileExt;
                    file.read_exact_at(&mut buf, offset)?;
                }

                #[cfg(windows)]
                {
                    use std::os::windows::fs::FileExt;

                    let mut pos = 0;
                    while pos < buf.len() {
                        let n = file.seek_read(&mut buf[pos..], offset + pos as u64)?;
                        if n == 0 {
                            return Err(crate::Error::CorruptedBlock(
                                "read beyond end of file",
                            ));
                        }
                        pos += n;
                    }
                }

                #[cfg(not(any(unix, windows)))]
                {
                    compile_error!("unsupported OS");
                }

                Ok(buf)
            }
        }
    }
}

/// An immutable sorted run of entries persisted as one file
///
/// Addressed by path, never mutated. Lookups go bloom filter → hash index →
/// binary search → restart scan; blocks are fetched lazily through the
/// shared block cache.
pub struct Segment {
    id: SegmentId,
    path: PathBuf,
    footer: Footer,
    file_size: u64,
    reader: FileReader,
    cache: Arc<BlockCache>,
    order: KeyOrder,
    removed: AtomicBool,
    poisoned: AtomicBool,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Segment:{}({})", self.id, self.path.display())
    }
}

impl Segment {
    /// Opens a segment file, validating magic, version and footer CRC.
    pub fn open(
        path: &Path,
        cache: Arc<BlockCache>,
        order: KeyOrder,
        mmap: MmapPolicy,
    ) -> crate::Result<Self> {
        let id = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse::<SegmentId>().ok())
            .ok_or(crate::Error::InvalidInput("invalid segment file name"))?;

        let (reader, file_size) = FileReader::open(path, mmap)?;

        if file_size < (MAGIC_BYTES.len() + 1 + TRAILER_SIZE) as u64 {
            return Err(crate::Error::CorruptedBlock("segment file too short"));
        }

        let head = reader.read(0, MAGIC_BYTES.len() + 1)?;
        if head.get(..MAGIC_BYTES.len()) != Some(&MAGIC_BYTES[..]) {
            return Err(crate::Error::CorruptedBlock("bad segment magic"));
        }

        let version = head.get(MAGIC_BYTES.len()).copied().unwrap_or_default();
        if version != FORMAT_VERSION {
            return Err(crate::Error::InvalidVersion(version));
        }

        let trailer = reader.read(file_size - TRAILER_SIZE as u64, TRAILER_SIZE)?;
        let footer_offset = u64::from_be_bytes(
            trailer
                .get(0..8)
                .and_then(|b| b.try_into().ok())
                .ok_or(crate::Error::CorruptedBlock("bad segment trailer"))?,
        );
        let footer_size = u32::from_be_bytes(
            trailer
                .get(8..12)
                .and_then(|b| b.try_into().ok())
                .ok_or(crate::Error::CorruptedBlock("bad segment trailer"))?,
        );

        let footer_raw = reader.read(footer_offset, footer_size as usize)?;
        let footer_payload = block::read_block(&footer_raw)?;
        let footer = Footer::decode_from(&mut &footer_payload[..])?;

        log::trace!(
            "opened segment {id} at {path:?}: {} points, {} ranges, range {:?}",
            footer.point_count,
            footer.range_count,
            footer.key_range,
        );

        Ok(Self {
            id,
            path: path.into(),
            footer,
            file_size,
            reader,
            cache,
            order,
            removed: AtomicBool::default(),
            poisoned: AtomicBool::default(),
        })
    }

    /// Returns the segment id.
    #[must_use]
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Returns the authoritative key range.
    #[must_use]
    pub fn key_range(&self) -> &KeyRange {
        &self.footer.key_range
    }

    /// Returns the highest time token stored in the segment.
    #[must_use]
    pub fn max_time(&self) -> &Time {
        &self.footer.max_time
    }

    /// Returns the on-disk size in bytes.
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Returns the number of point entries.
    #[must_use]
    pub fn point_count(&self) -> u64 {
        self.footer.point_count
    }

    /// Returns the number of range entries.
    #[must_use]
    pub fn range_count(&self) -> u64 {
        self.footer.range_count
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Release);
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.removed.load(Acquire)
    }

    fn block(&self, handle: BlockHandle) -> crate::Result<Slice> {
        if self.poisoned.load(Acquire) {
            return Err(crate::Error::CorruptedBlock("segment is poisoned"));
        }

        let resource = format!("{}#{}", self.path.display(), handle.offset);

        let result = retry(
            &resource,
            BLOCK_RETRY_LIMIT,
            |_| self.is_removed(),
            || {
                self.cache
                    .get_or_load(CacheKey(self.id, handle.offset), || {
                        let raw = self.reader.read(handle.offset, handle.size as usize)?;
                        block::read_block(&raw)
                    })
            },
        );

        if let Err(e @ (crate::Error::CorruptedBlock(_) | crate::Error::Decompress(_))) = &result {
            log::error!("segment {} is poisoned: {e:?}", self.id);
            self.poisoned.store(true, Release);
        }

        result
    }

    fn index_blocks(&self) -> crate::Result<(Slice, Slice)> {
        let index = self.block(self.footer.sorted_index)?;
        let values = self.block(self.footer.values)?;
        Ok((index, values))
    }

    /// Restart point offsets, from the binary index or a full scan.
    fn sections(&self, index: &[u8], values: &[u8]) -> crate::Result<Vec<u32>> {
        if let Some(handle) = self.footer.binary_index {
            let payload = self.block(handle)?;
            return Ok(binary_index::Reader::new(&payload)?.offsets());
        }

        let interval = usize::from(self.footer.restart_interval);
        let mut reader = IndexReader::new(index, values, interval, 0, index.len());
        let mut offsets = vec![];
        let mut i = 0;

        while let Some((offset, _)) = reader.next_entry()? {
            if i % interval == 0 {
                offsets.push(offset as u32);
            }
            i += 1;
        }

        Ok(offsets)
    }

    fn section_bounds(&self, sections: &[u32], idx: usize, index_len: usize) -> (usize, usize) {
        let start = sections.get(idx).copied().unwrap_or_default() as usize;
        let end = sections
            .get(idx + 1)
            .copied()
            .map_or(index_len, |offset| offset as usize);
        (start, end)
    }

    /// First key of a restart section.
    fn section_first_key(
        &self,
        index: &[u8],
        values: &[u8],
        sections: &[u32],
        idx: usize,
    ) -> crate::Result<Option<UserKey>> {
        let (start, end) = self.section_bounds(sections, idx, index.len());
        let interval = usize::from(self.footer.restart_interval);

        let mut reader = IndexReader::new(index, values, interval, start, end);
        Ok(reader.next_entry()?.map(|(_, entry)| entry.start_key().clone()))
    }

    /// Greatest section whose first key is at or below `key`.
    fn find_section(
        &self,
        index: &[u8],
        values: &[u8],
        sections: &[u32],
        key: &[u8],
    ) -> crate::Result<Option<usize>> {
        let mut lo = 0usize;
        let mut hi = sections.len();

        // invariant: sections below lo start at or below key
        while lo < hi {
            let mid = (lo + hi) / 2;

            let Some(first_key) = self.section_first_key(index, values, sections, mid)? else {
                hi = mid;
                continue;
            };

            if self.order.le(&first_key, key) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        Ok(lo.checked_sub(1))
    }

    /// Returns the merged payload visible for `key` within this segment:
    /// the exact point entry, or the edge of a covering range.
    pub fn fetch(&self, key: &[u8]) -> crate::Result<Option<Value>> {
        if !self.footer.key_range.contains_key(key, &self.order) {
            return Ok(None);
        }

        if let Some(handle) = self.footer.bloom_filter {
            let payload = self.block(handle)?;
            if !filter::FilterReader::new(&payload)?.contains(key) {
                return Ok(None);
            }
        }

        let (index, values) = self.index_blocks()?;
        let sections = self.sections(&index, &values)?;
        let interval = usize::from(self.footer.restart_interval);

        // Hash index probe
        let mut hash_was_definitive = false;
        if let Some(handle) = self.footer.hash_index {
            let payload = self.block(handle)?;

            match hash_index::Reader::new(&payload)?.probe(key) {
                hash_index::Probe::Miss => hash_was_definitive = true,
                hash_index::Probe::Candidates(candidates) => {
                    for section in candidates {
                        let (start, end) = self.section_bounds(&sections, section as usize, index.len());
                        let mut reader = IndexReader::new(&index, &values, interval, start, end);

                        while let Some((_, entry)) = reader.next_entry()? {
                            if let Entry::Point { key: entry_key, value } = entry {
                                // Fingerprint collisions fall through
                                if self.order.eq(&entry_key, key) {
                                    return Ok(Some(value));
                                }
                            }
                        }
                    }
                }
                hash_index::Probe::Inconclusive => {}
            }
        }

        // Binary search, then scan forward from the restart
        let located = self.find_section(&index, &values, &sections, key)?;
        let mut floor_range: Option<Entry> = None;

        if let Some(section) = located {
            if !hash_was_definitive {
                let (start, end) = self.section_bounds(&sections, section, index.len());
                let mut reader = IndexReader::new(&index, &values, interval, start, end);

                while let Some((_, entry)) = reader.next_entry()? {
                    if self.order.gt(entry.start_key(), key) {
                        break;
                    }

                    if self.order.eq(entry.start_key(), key) {
                        match entry {
                            Entry::Point { value, .. } => return Ok(Some(value)),
                            range @ Entry::Range { .. } => {
                                return Ok(range.range_edge(key, &self.order));
                            }
                        }
                    }

                    if entry.is_range() {
                        floor_range = Some(entry);
                    }
                }
            }
        }

        // No exact entry; a range may still cover the key
        if self.footer.range_count == 0 {
            return Ok(None);
        }

        if floor_range.is_none() {
            floor_range = self.nearest_range_before(&index, &values, &sections, key, located)?;
        }

        Ok(floor_range
            .filter(|range| range.covers(key, &self.order))
            .and_then(|range| range.range_edge(key, &self.order)))
    }

    /// Scans sections backward for the nearest range entry starting at or
    /// below `key`.
    fn nearest_range_before(
        &self,
        index: &[u8],
        values: &[u8],
        sections: &[u32],
        key: &[u8],
        located: Option<usize>,
    ) -> crate::Result<Option<Entry>> {
        let Some(located) = located else {
            return Ok(None);
        };
        let interval = usize::from(self.footer.restart_interval);

        for section in (0..=located).rev() {
            let (start, end) = self.section_bounds(sections, section, index.len());
            let mut reader = IndexReader::new(index, values, interval, start, end);
            let mut last_range = None;

            while let Some((_, entry)) = reader.next_entry()? {
                if self.order.gt(entry.start_key(), key) {
                    break;
                }
                if entry.is_range() {
                    last_range = Some(entry);
                }
            }

            if last_range.is_some() {
                return Ok(last_range);
            }
        }

        Ok(None)
    }

    /// Returns the greatest entry whose start key is at or below `key`.
    pub fn floor_entry(&self, key: &[u8]) -> crate::Result<Option<Entry>> {
        let (index, values) = self.index_blocks()?;
        let sections = self.sections(&index, &values)?;
        let interval = usize::from(self.footer.restart_interval);

        let Some(section) = self.find_section(&index, &values, &sections, key)? else {
            return Ok(None);
        };

        let (start, end) = self.section_bounds(&sections, section, index.len());
        let mut reader = IndexReader::new(&index, &values, interval, start, end);
        let mut floor = None;

        while let Some((_, entry)) = reader.next_entry()? {
            if self.order.gt(entry.start_key(), key) {
                break;
            }
            floor = Some(entry);
        }

        Ok(floor)
    }

    /// Returns the smallest entry whose start key is at or above `key`.
    pub fn ceiling_entry(&self, key: &[u8]) -> crate::Result<Option<Entry>> {
        let (index, values) = self.index_blocks()?;
        let sections = self.sections(&index, &values)?;
        let interval = usize::from(self.footer.restart_interval);

        let start_section = self
            .find_section(&index, &values, &sections, key)?
            .unwrap_or_default();

        let (start, _) = self.section_bounds(&sections, start_section, index.len());
        let mut reader = IndexReader::new(&index, &values, interval, start, index.len());

        while let Some((_, entry)) = reader.next_entry()? {
            if self.order.ge(entry.start_key(), key) {
                return Ok(Some(entry));
            }
        }

        Ok(None)
    }

    /// Decodes all entries, in key order.
    pub fn entries(&self) -> crate::Result<Vec<Entry>> {
        let (index, values) = self.index_blocks()?;
        let interval = usize::from(self.footer.restart_interval);

        IndexReader::new(&index, &values, interval, 0, index.len()).collect_entries()
    }

    /// Iterates entries whose start keys fall within `bounds`.
    pub fn iter(
        &self,
        bounds: (Bound<UserKey>, Bound<UserKey>),
        direction: Direction,
    ) -> crate::Result<SegmentIter> {
        let (index, values) = self.index_blocks()?;
        let sections = self.sections(&index, &values)?;

        // Skip ahead to the section containing the lower bound
        let first_section = match (&direction, &bounds.0) {
            (Direction::Forward, Bound::Included(key) | Bound::Excluded(key)) => self
                .find_section(&index, &values, &sections, key)?
                .unwrap_or_default(),
            _ => 0,
        };

        Ok(SegmentIter {
            index,
            values,
            interval: usize::from(self.footer.restart_interval),
            sections,
            direction,
            next_forward: first_section,
            next_backward: None,
            started_backward: false,
            buffer: VecDeque::new(),
            bounds,
            order: self.order.clone(),
            done: false,
        })
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.is_removed() {
            self.cache.invalidate_segment(self.id);

            if let Err(e) = std::fs::remove_file(&self.path) {
                log::warn!("failed to unlink removed segment {:?}: {e}", self.path);
            } else {
                log::trace!("unlinked removed segment {:?}", self.path);
            }
        }
    }
}

/// Directional iterator over a segment's entries
///
/// Decodes one restart section at a time.
pub struct SegmentIter {
    index: Slice,
    values: Slice,
    interval: usize,
    sections: Vec<u32>,

    direction: Direction,
    next_forward: usize,
    next_backward: Option<usize>,
    started_backward: bool,
    buffer: VecDeque<Entry>,

    bounds: (Bound<UserKey>, Bound<UserKey>),
    order: KeyOrder,
    done: bool,
}

impl SegmentIter {
    fn below_lower_bound(&self, key: &[u8]) -> bool {
        match &self.bounds.0 {
            Bound::Included(lo) => self.order.lt(key, lo),
            Bound::Excluded(lo) => self.order.le(key, lo),
            Bound::Unbounded => false,
        }
    }

    fn above_upper_bound(&self, key: &[u8]) -> bool {
        match &self.bounds.1 {
            Bound::Included(hi) => self.order.gt(key, hi),
            Bound::Excluded(hi) => self.order.ge(key, hi),
            Bound::Unbounded => false,
        }
    }

    fn refill(&mut self) -> crate::Result<bool> {
        let section = match self.direction {
            Direction::Forward => {
                if self.next_forward >= self.sections.len() {
                    return Ok(false);
                }
                let section = self.next_forward;
                self.next_forward += 1;
                section
            }
            Direction::Backward => {
                let next = if self.started_backward {
                    match self.next_backward {
                        Some(section) => Some(section),
                        None => return Ok(false),
                    }
                } else {
                    self.started_backward = true;
                    self.sections.len().checked_sub(1)
                };

                let Some(section) = next else {
                    return Ok(false);
                };
                self.next_backward = section.checked_sub(1);
                section
            }
        };

        let start = self.sections.get(section).copied().unwrap_or_default() as usize;
        let end = self
            .sections
            .get(section + 1)
            .copied()
            .map_or(self.index.len(), |offset| offset as usize);

        let mut reader = IndexReader::new(&self.index, &self.values, self.interval, start, end);
        let mut entries = reader.collect_entries()?;

        if matches!(self.direction, Direction::Backward) {
            entries.reverse();
        }

        self.buffer = entries.into();
        Ok(true)
    }
}

impl Iterator for SegmentIter {
    type Item = crate::Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            let Some(entry) = self.buffer.pop_front() else {
                match self.refill() {
                    Ok(true) => continue,
                    Ok(false) => {
                        self.done = true;
                        return None;
                    }
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            };

            let key = entry.start_key();

            match self.direction {
                Direction::Forward => {
                    if self.below_lower_bound(key) {
                        continue;
                    }
                    if self.above_upper_bound(key) {
                        self.done = true;
                        return None;
                    }
                }
                Direction::Backward => {
                    if self.above_upper_bound(key) {
                        continue;
                    }
                    if self.below_lower_bound(key) {
                        self.done = true;
                        return None;
                    }
                }
            }

            return Some(Ok(entry));
        }
    }
}

#[cfg(test)]
mod tests;
