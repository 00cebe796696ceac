//! Module implement stateful iteration over a table's blocks.
//!
//! Cursors hold a borrowed reader, the current block, and the position
//! inside it; sibling cursors from the same reader share nothing but the
//! block cache. Once a cursor reports exhaustion it stays exhausted.

use std::{convert::TryFrom, sync::Arc};

use crate::{
    block::{Block, BLOCK_HEADER_SIZE, BLOCK_LOG, BLOCK_REF},
    reader::Reader,
    record::{LogRecord, Oid, Payload, RefRecord},
    source::BlockSource,
    util, Error, Result, HEADER_SIZE,
};

macro_rules! iter_result {
    ($self:ident, $res:expr) => {{
        match $res {
            Ok(res) => res,
            Err(err) => {
                $self.scan = None;
                return Some(Err(err));
            }
        }
    }};
}

// position inside one decoded block.
struct Scan {
    block: Arc<Block>,
    block_off: u64,
    pos: usize,
    key: Vec<u8>,
}

impl Scan {
    fn start(block_off: u64, block: Arc<Block>) -> Scan {
        Scan {
            block,
            block_off,
            pos: BLOCK_HEADER_SIZE,
            key: Vec::default(),
        }
    }

    fn seek(block_off: u64, block: Arc<Block>, target: &[u8]) -> Result<Scan> {
        let (pos, key) = block.seek(target)?;
        Ok(Scan {
            block,
            block_off,
            pos,
            key,
        })
    }
}

// land a scan on the leaf covering `target`; for the ref section, which
// always starts right after the file header, fall back to a linear block
// walk when the table has no ref index.
fn seek_scan<S>(
    reader: &Reader<S>,
    root: u64,
    section: u8,
    target: &[u8],
) -> Result<Option<Scan>>
where
    S: BlockSource,
{
    if root != 0 {
        let leaf = match reader.descend(root, target)? {
            Some(leaf) => leaf,
            None => return Ok(None),
        };
        let block = reader.load_block(leaf)?;
        return Ok(Some(Scan::seek(leaf, block, target)?));
    }
    if section != BLOCK_REF {
        return Ok(None);
    }

    let mut off = u64::try_from(HEADER_SIZE).unwrap();
    loop {
        let (off2, block) = match reader.next_block(off, BLOCK_REF)? {
            Some(val) => val,
            None => return Ok(None),
        };
        if block.last_key()?.as_slice() < target {
            off = off2 + u64::try_from(block.disk_len()).unwrap();
            continue;
        }
        return Ok(Some(Scan::seek(off2, block, target)?));
    }
}

/// Cursor over the reference section. Yields records in strict name
/// order; tombstones are skipped unless the reader was configured with
/// [Reader::set_include_deletes].
pub struct RefCursor<'a, S>
where
    S: BlockSource,
{
    reader: &'a Reader<S>,
    scan: Option<Scan>,
    prefix: Option<Vec<u8>>,
    include_deletes: bool,
}

impl<'a, S> RefCursor<'a, S>
where
    S: BlockSource,
{
    pub(crate) fn all(reader: &'a Reader<S>) -> Result<RefCursor<'a, S>> {
        let start = u64::try_from(HEADER_SIZE).unwrap();
        let scan = reader
            .next_block(start, BLOCK_REF)?
            .map(|(off, block)| Scan::start(off, block));
        Ok(RefCursor {
            reader,
            scan,
            prefix: None,
            include_deletes: reader.to_include_deletes(),
        })
    }

    pub(crate) fn seek(
        reader: &'a Reader<S>,
        target: &[u8],
        prefix: Option<Vec<u8>>,
    ) -> Result<RefCursor<'a, S>> {
        let scan = seek_scan(reader, reader.to_ref_root(), BLOCK_REF, target)?;
        Ok(RefCursor {
            reader,
            scan,
            prefix,
            include_deletes: reader.to_include_deletes(),
        })
    }

    /// Reposition this cursor to the first key strictly greater than any
    /// key starting with `prefix`, keeping whatever prefix bound the
    /// cursor already carries. The cursor never moves backwards in key
    /// order.
    pub fn seek_past_prefix(&mut self, prefix: &str) -> Result<()> {
        match util::prefix_successor(prefix.as_bytes()) {
            Some(target) => {
                self.scan =
                    seek_scan(self.reader, self.reader.to_ref_root(), BLOCK_REF, &target)?;
                Ok(())
            }
            None => {
                self.scan = None;
                Ok(())
            }
        }
    }
}

impl<'a, S> Iterator for RefCursor<'a, S>
where
    S: BlockSource,
{
    type Item = Result<RefRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let scan = self.scan.as_mut()?;

            match iter_result!(self, scan.block.decode_entry(scan.pos, &mut scan.key)) {
                Some((payload, pos)) => {
                    scan.pos = pos;
                    if let Some(prefix) = &self.prefix {
                        if !scan.key.starts_with(prefix) {
                            self.scan = None;
                            return None;
                        }
                    }
                    let r = match payload {
                        Payload::Ref { delta, value } => {
                            let min = self.reader.to_min_update_index();
                            iter_result!(
                                self,
                                RefRecord::from_parts(&scan.key, min, delta, value)
                            )
                        }
                        _ => iter_result!(
                            self,
                            err_at!(FormatError, msg: "non-ref record in ref block")
                        ),
                    };
                    if r.is_deletion() && !self.include_deletes {
                        continue;
                    }
                    return Some(Ok(r));
                }
                None => {
                    let off = scan.block_off + u64::try_from(scan.block.disk_len()).unwrap();
                    match iter_result!(self, self.reader.next_block(off, BLOCK_REF)) {
                        Some((off, block)) => *scan = Scan::start(off, block),
                        None => {
                            self.scan = None;
                            return None;
                        }
                    }
                }
            }
        }
    }
}

/// Cursor over the log section. Yields records sorted by name ascending,
/// then update-index descending. A cursor obtained from
/// [Reader::seek_log] never crosses into entries of a different name.
pub struct LogCursor<'a, S>
where
    S: BlockSource,
{
    reader: &'a Reader<S>,
    scan: Option<Scan>,
    name: Option<String>,
    include_deletes: bool,
}

impl<'a, S> LogCursor<'a, S>
where
    S: BlockSource,
{
    pub(crate) fn seek(
        reader: &'a Reader<S>,
        target: &[u8],
        name: Option<String>,
    ) -> Result<LogCursor<'a, S>> {
        let scan = seek_scan(reader, reader.to_log_root(), BLOCK_LOG, target)?;
        Ok(LogCursor {
            reader,
            scan,
            name,
            include_deletes: reader.to_include_deletes(),
        })
    }
}

impl<'a, S> Iterator for LogCursor<'a, S>
where
    S: BlockSource,
{
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let scan = self.scan.as_mut()?;

            match iter_result!(self, scan.block.decode_entry(scan.pos, &mut scan.key)) {
                Some((payload, pos)) => {
                    scan.pos = pos;
                    let l = match payload {
                        Payload::Log {
                            old_id,
                            new_id,
                            who,
                            message,
                        } => iter_result!(
                            self,
                            LogRecord::from_parts(&scan.key, old_id, new_id, who, message)
                        ),
                        _ => iter_result!(
                            self,
                            err_at!(FormatError, msg: "non-log record in log block")
                        ),
                    };
                    if let Some(name) = &self.name {
                        if &l.name != name {
                            self.scan = None;
                            return None;
                        }
                    }
                    if l.is_deletion() && !self.include_deletes {
                        continue;
                    }
                    return Some(Ok(l));
                }
                None => {
                    let off = scan.block_off + u64::try_from(scan.block.disk_len()).unwrap();
                    match iter_result!(self, self.reader.next_block(off, BLOCK_LOG)) {
                        Some((off, block)) => *scan = Scan::start(off, block),
                        None => {
                            self.scan = None;
                            return None;
                        }
                    }
                }
            }
        }
    }
}

/// Cursor over refs naming one object, in file order. Backed by the
/// object back-index when the table has one, otherwise by a full ref
/// scan.
pub struct ObjCursor<'a, S>
where
    S: BlockSource,
{
    reader: &'a Reader<S>,
    id: Oid,
    // ref-block offsets still to visit; None means full scan.
    positions: Option<Vec<u64>>,
    next_position: usize,
    // full scan resumes its block walk here.
    resume_off: u64,
    scan: Option<Scan>,
    done: bool,
}

impl<'a, S> ObjCursor<'a, S>
where
    S: BlockSource,
{
    pub(crate) fn from_positions(
        reader: &'a Reader<S>,
        positions: Vec<u64>,
        id: Oid,
    ) -> Result<ObjCursor<'a, S>> {
        Ok(ObjCursor {
            reader,
            id,
            positions: Some(positions),
            next_position: 0,
            resume_off: 0,
            scan: None,
            done: false,
        })
    }

    pub(crate) fn full_scan(reader: &'a Reader<S>, id: Oid) -> Result<ObjCursor<'a, S>> {
        Ok(ObjCursor {
            reader,
            id,
            positions: None,
            next_position: 0,
            resume_off: u64::try_from(HEADER_SIZE).unwrap(),
            scan: None,
            done: false,
        })
    }

    /// Prefix jumps are meaningless on an object cursor.
    pub fn seek_past_prefix(&mut self, _prefix: &str) -> Result<()> {
        err_at!(Unsupported, msg: "seek_past_prefix on obj cursor")
    }

    // line up the next ref block to scan, None once every candidate block
    // is exhausted.
    fn next_scan(&mut self) -> Result<Option<Scan>> {
        match &self.positions {
            Some(positions) => match positions.get(self.next_position) {
                Some(off) => {
                    let off = *off;
                    self.next_position += 1;
                    let block = self.reader.load_block(off)?;
                    if block.block_type() != BLOCK_REF {
                        err_at!(FormatError, msg: "obj position {} not a ref block", off)?
                    }
                    Ok(Some(Scan::start(off, block)))
                }
                None => Ok(None),
            },
            None => match self.reader.next_block(self.resume_off, BLOCK_REF)? {
                Some((off, block)) => {
                    self.resume_off = off + u64::try_from(block.disk_len()).unwrap();
                    Ok(Some(Scan::start(off, block)))
                }
                None => Ok(None),
            },
        }
    }
}

impl<'a, S> Iterator for ObjCursor<'a, S>
where
    S: BlockSource,
{
    type Item = Result<RefRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if self.scan.is_none() {
                match self.next_scan() {
                    Ok(Some(scan)) => self.scan = Some(scan),
                    Ok(None) => {
                        self.done = true;
                        return None;
                    }
                    Err(err) => {
                        self.done = true;
                        return Some(Err(err));
                    }
                }
            }

            let scan = self.scan.as_mut().unwrap();
            match scan.block.decode_entry(scan.pos, &mut scan.key) {
                Ok(Some((Payload::Ref { delta, value }, pos))) => {
                    scan.pos = pos;
                    let named = value.to_id() == Some(self.id)
                        || value.to_peeled() == Some(self.id);
                    if !named {
                        continue;
                    }
                    let min = self.reader.to_min_update_index();
                    match RefRecord::from_parts(&scan.key, min, delta, value) {
                        Ok(r) => return Some(Ok(r)),
                        Err(err) => {
                            self.done = true;
                            return Some(Err(err));
                        }
                    }
                }
                Ok(Some(_)) => {
                    self.done = true;
                    return Some(err_at!(FormatError, msg: "non-ref record in ref block"));
                }
                Ok(None) => self.scan = None,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "cursor_test.rs"]
mod cursor_test;
