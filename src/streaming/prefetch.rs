//! Prefetch work queue.
//!
//! Two priority classes share one deque: look-ahead ranges queued after a
//! served miss go to the front, full-file prefetches go to the back. Ranges
//! are consumed in increasing block order and dropped once exhausted.

use crate::streaming::protocol::FileId;
use std::collections::{HashSet, VecDeque};

/// Blocks `[next, end)` of one file still to be offered to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchRange {
    pub file_id: FileId,
    pub next: usize,
    pub end: usize,
}

impl PrefetchRange {
    /// Every block of a file.
    pub fn whole_file(file_id: FileId, blocks: usize) -> Self {
        Self {
            file_id,
            next: 0,
            end: blocks,
        }
    }

    /// Up to `count` blocks starting at `start`, clipped to the file.
    pub fn bounded(file_id: FileId, start: usize, count: usize, blocks: usize) -> Self {
        Self {
            file_id,
            next: start,
            end: start.saturating_add(count).min(blocks),
        }
    }

    pub fn is_done(&self) -> bool {
        self.next >= self.end
    }

    pub fn remaining(&self) -> usize {
        self.end.saturating_sub(self.next)
    }
}

/// Why a full-file prefetch was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchRejected {
    /// The file was already queued on this connection
    Duplicate,
}

#[derive(Debug, Default)]
pub struct PrefetchQueue {
    ranges: VecDeque<PrefetchRange>,
    prefetched_files: HashSet<FileId>,
}

impl PrefetchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue every block of a file behind all pending work.
    ///
    /// A file is accepted once per connection. `file_id` must already be
    /// known to the registry.
    pub fn push_file(
        &mut self,
        file_id: FileId,
        blocks: usize,
    ) -> Result<(), PrefetchRejected> {
        if !self.prefetched_files.insert(file_id) {
            return Err(PrefetchRejected::Duplicate);
        }
        let range = PrefetchRange::whole_file(file_id, blocks);
        if !range.is_done() {
            self.ranges.push_back(range);
        }
        Ok(())
    }

    /// Queue the blocks right after a served miss ahead of everything else.
    pub fn push_lookahead(&mut self, file_id: FileId, start: usize, count: usize, blocks: usize) {
        let range = PrefetchRange::bounded(file_id, start, count, blocks);
        if !range.is_done() {
            self.ranges.push_front(range);
        }
    }

    /// Take the next block to offer, dropping ranges as they run out.
    pub fn next_block(&mut self) -> Option<(FileId, usize)> {
        while let Some(front) = self.ranges.front_mut() {
            if front.is_done() {
                self.ranges.pop_front();
                continue;
            }
            let block = (front.file_id, front.next);
            front.next += 1;
            if front.is_done() {
                self.ranges.pop_front();
            }
            return Some(block);
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn front(&self) -> Option<&PrefetchRange> {
        self.ranges.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PrefetchRange> {
        self.ranges.iter()
    }
}
