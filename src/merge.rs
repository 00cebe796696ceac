//! Module implement a virtual merged view over a stack of tables.
//!
//! A [MergedReader] presents a chronologically ordered list of readers,
//! oldest first, as one logical table for reads. Conflicting reference
//! records resolve to the highest update-index, ties broken by stack
//! position with later tables winning. Tombstones in a newer table hide
//! the key, unless deletes are requested explicitly.

use std::{cmp, collections::BinaryHeap};

use crate::{
    cursor::{LogCursor, RefCursor},
    reader::Reader,
    record::{LogRecord, RefRecord, RefValue},
    source::BlockSource,
    Result, MAX_SYMREF_DEPTH,
};

/// A stack of tables read as one logical table.
pub struct MergedReader<S>
where
    S: BlockSource,
{
    // oldest first; every reader surfaces tombstones to the merge, the
    // merged cursors filter them according to `include_deletes`.
    readers: Vec<Reader<S>>,
    include_deletes: bool,
}

impl<S> MergedReader<S>
where
    S: BlockSource,
{
    /// Create a merged view over `readers`, ordered oldest to newest.
    pub fn new(readers: Vec<Reader<S>>) -> Result<MergedReader<S>> {
        let readers = readers
            .into_iter()
            .map(|mut r| {
                r.set_include_deletes(true);
                r
            })
            .collect();

        Ok(MergedReader {
            readers,
            include_deletes: false,
        })
    }

    /// When false, the default, merged cursors hide keys whose winning
    /// record is a tombstone; when true tombstones are yielded.
    pub fn set_include_deletes(&mut self, include_deletes: bool) -> &mut Self {
        self.include_deletes = include_deletes;
        self
    }

    pub fn len_tables(&self) -> usize {
        self.readers.len()
    }

    /// Smallest min-update-index across the stack.
    pub fn to_min_update_index(&self) -> Option<u64> {
        self.readers.iter().map(Reader::to_min_update_index).min()
    }

    /// Largest max-update-index across the stack.
    pub fn to_max_update_index(&self) -> Option<u64> {
        self.readers.iter().map(Reader::to_max_update_index).max()
    }

    /// Merged cursor over every surviving ref, in name order.
    pub fn all_refs(&self) -> Result<MergedRefCursor<S>> {
        let mut cursors = Vec::with_capacity(self.readers.len());
        for reader in self.readers.iter() {
            cursors.push(reader.all_refs()?);
        }
        MergedRefCursor::new(cursors, self.include_deletes)
    }

    /// Merged cursor positioned at the first surviving ref whose name is
    /// `>= name`.
    pub fn seek_ref(&self, name: &str) -> Result<MergedRefCursor<S>> {
        let mut cursors = Vec::with_capacity(self.readers.len());
        for reader in self.readers.iter() {
            cursors.push(reader.seek_ref(name)?);
        }
        MergedRefCursor::new(cursors, self.include_deletes)
    }

    /// Merged prefix scan across the stack.
    pub fn refs_with_prefix(&self, prefix: &str) -> Result<MergedRefCursor<S>> {
        let mut cursors = Vec::with_capacity(self.readers.len());
        for reader in self.readers.iter() {
            cursors.push(reader.refs_with_prefix(prefix)?);
        }
        MergedRefCursor::new(cursors, self.include_deletes)
    }

    /// Merged point read for `name`.
    pub fn exact_ref(&self, name: &str) -> Result<Option<RefRecord>> {
        let mut cursor = self.seek_ref(name)?;
        match cursor.next() {
            Some(Ok(r)) if r.name == name => Ok(Some(r)),
            Some(Ok(_)) | None => Ok(None),
            Some(Err(err)) => Err(err),
        }
    }

    /// Merged cursor over every surviving log record, name ascending and
    /// update-index descending within a name.
    pub fn all_logs(&self) -> Result<MergedLogCursor<S>> {
        let mut cursors = Vec::with_capacity(self.readers.len());
        for reader in self.readers.iter() {
            cursors.push(reader.all_logs()?);
        }
        MergedLogCursor::new(cursors, self.include_deletes)
    }

    /// Merged cursor at the newest log entry for `name` with update-index
    /// `<= max_update_index`.
    pub fn seek_log(&self, name: &str, max_update_index: u64) -> Result<MergedLogCursor<S>> {
        let mut cursors = Vec::with_capacity(self.readers.len());
        for reader in self.readers.iter() {
            cursors.push(reader.seek_log(name, max_update_index)?);
        }
        MergedLogCursor::new(cursors, self.include_deletes)
    }

    /// Follow a chain of symbolic references starting at `name`, up to
    /// [MAX_SYMREF_DEPTH] hops. Longer chains, cycles included, yield an
    /// absent value rather than erroring.
    pub fn resolve(&self, name: &str) -> Result<Option<RefRecord>> {
        let mut name = name.to_string();
        for _hop in 0..MAX_SYMREF_DEPTH {
            match self.exact_ref(&name)? {
                Some(r) => match &r.value {
                    RefValue::Symref(target) => name = target.clone(),
                    _ => return Ok(Some(r)),
                },
                None => return Ok(None),
            }
        }
        Ok(None)
    }
}

// heap item ordered so that the smallest key pops first, and within a key
// the latest table pops first.
struct HeapItem<T> {
    key: Vec<u8>,
    pos: usize,
    rec: T,
}

impl<T> PartialEq for HeapItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.pos == other.pos
    }
}

impl<T> Eq for HeapItem<T> {}

impl<T> PartialOrd for HeapItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for HeapItem<T> {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        other
            .key
            .cmp(&self.key)
            .then_with(|| self.pos.cmp(&other.pos))
    }
}

/// Merged cursor over the ref sections of a table stack.
pub struct MergedRefCursor<'a, S>
where
    S: BlockSource,
{
    cursors: Vec<RefCursor<'a, S>>,
    heap: BinaryHeap<HeapItem<RefRecord>>,
    include_deletes: bool,
    n_pulled: u64,
    done: bool,
}

impl<'a, S> MergedRefCursor<'a, S>
where
    S: BlockSource,
{
    fn new(
        cursors: Vec<RefCursor<'a, S>>,
        include_deletes: bool,
    ) -> Result<MergedRefCursor<'a, S>> {
        let mut cursor = MergedRefCursor {
            cursors,
            heap: BinaryHeap::new(),
            include_deletes,
            n_pulled: 0,
            done: false,
        };
        for pos in 0..cursor.cursors.len() {
            cursor.pull(pos)?;
        }
        Ok(cursor)
    }

    // refill the heap from table `pos`.
    fn pull(&mut self, pos: usize) -> Result<()> {
        if let Some(res) = self.cursors[pos].next() {
            let rec = res?;
            self.n_pulled += 1;
            let key = rec.name.as_bytes().to_vec();
            self.heap.push(HeapItem { key, pos, rec });
        }
        Ok(())
    }

    // number of records consumed from the underlying tables.
    pub(crate) fn to_n_pulled(&self) -> u64 {
        self.n_pulled
    }
}

impl<'a, S> Iterator for MergedRefCursor<'a, S>
where
    S: BlockSource,
{
    type Item = Result<RefRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            let mut winner = match self.heap.pop() {
                Some(item) => item,
                None => {
                    self.done = true;
                    return None;
                }
            };
            if let Err(err) = self.pull(winner.pos) {
                self.done = true;
                return Some(Err(err));
            }

            // shadowed duplicates; the first pop is the latest table, so
            // equal update-indexes keep it.
            while self.heap.peek().map_or(false, |item| item.key == winner.key) {
                let item = self.heap.pop().unwrap();
                if let Err(err) = self.pull(item.pos) {
                    self.done = true;
                    return Some(Err(err));
                }
                if item.rec.update_index > winner.rec.update_index {
                    winner = item;
                }
            }

            if winner.rec.is_deletion() && !self.include_deletes {
                continue;
            }
            return Some(Ok(winner.rec));
        }
    }
}

/// Merged cursor over the log sections of a table stack.
pub struct MergedLogCursor<'a, S>
where
    S: BlockSource,
{
    cursors: Vec<LogCursor<'a, S>>,
    heap: BinaryHeap<HeapItem<LogRecord>>,
    include_deletes: bool,
    n_pulled: u64,
    done: bool,
}

impl<'a, S> MergedLogCursor<'a, S>
where
    S: BlockSource,
{
    fn new(
        cursors: Vec<LogCursor<'a, S>>,
        include_deletes: bool,
    ) -> Result<MergedLogCursor<'a, S>> {
        let mut cursor = MergedLogCursor {
            cursors,
            heap: BinaryHeap::new(),
            include_deletes,
            n_pulled: 0,
            done: false,
        };
        for pos in 0..cursor.cursors.len() {
            cursor.pull(pos)?;
        }
        Ok(cursor)
    }

    fn pull(&mut self, pos: usize) -> Result<()> {
        if let Some(res) = self.cursors[pos].next() {
            let rec = res?;
            self.n_pulled += 1;
            let key = rec.to_key();
            self.heap.push(HeapItem { key, pos, rec });
        }
        Ok(())
    }

    pub(crate) fn to_n_pulled(&self) -> u64 {
        self.n_pulled
    }
}

impl<'a, S> Iterator for MergedLogCursor<'a, S>
where
    S: BlockSource,
{
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            let winner = match self.heap.pop() {
                Some(item) => item,
                None => {
                    self.done = true;
                    return None;
                }
            };
            if let Err(err) = self.pull(winner.pos) {
                self.done = true;
                return Some(Err(err));
            }

            // entries at the same composite key; the latest table masks
            // the rest.
            while self.heap.peek().map_or(false, |item| item.key == winner.key) {
                let item = self.heap.pop().unwrap();
                if let Err(err) = self.pull(item.pos) {
                    self.done = true;
                    return Some(Err(err));
                }
            }

            if winner.rec.is_deletion() && !self.include_deletes {
                continue;
            }
            return Some(Ok(winner.rec));
        }
    }
}

#[cfg(test)]
#[path = "merge_test.rs"]
mod merge_test;
