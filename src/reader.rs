//! Module implement random-access interpretation of a sealed table.

use log::debug;

use std::{
    convert::TryFrom,
    sync::{Arc, Mutex},
};

use crate::{
    check_remaining,
    block::{self, Block, BLOCK_INDEX, BLOCK_REF},
    cache::{BlockCache, CACHE_BLOCKS},
    cursor::{LogCursor, ObjCursor, RefCursor},
    record::{self, Oid, Payload, RefRecord},
    source::BlockSource,
    util, Error, Result, FOOTER_SIZE, HEADER_SIZE, MAGIC, VERSION,
};

/// Cheap facts a reader can state about its table without a full scan.
#[derive(Clone, Default, Debug)]
pub struct TableInfo {
    pub version: u8,
    pub block_size: usize,
    pub min_update_index: u64,
    pub max_update_index: u64,
    /// Number of reference records, tombstones included.
    pub n_refs: u64,
    /// Number of reflog records, tombstones included.
    pub n_logs: u64,
    pub has_ref_index: bool,
    pub has_obj_index: bool,
    pub has_log_index: bool,
    pub obj_id_len: usize,
}

/// Read-only handle over one sealed table.
///
/// Readers hold a borrowed block source and never load the table into
/// memory. Clone a reader to obtain independent cursors on other threads;
/// clones share the block source and the block cache.
pub struct Reader<S>
where
    S: BlockSource,
{
    source: Arc<S>,
    cache: Arc<Mutex<BlockCache>>,

    size: u64,
    version: u8,
    block_size: usize,
    min_update_index: u64,
    max_update_index: u64,
    ref_root: u64,
    obj_root: u64,
    log_root: u64,
    obj_id_len: usize,

    include_deletes: bool,
}

impl<S> Clone for Reader<S>
where
    S: BlockSource,
{
    fn clone(&self) -> Self {
        Reader {
            source: Arc::clone(&self.source),
            cache: Arc::clone(&self.cache),

            size: self.size,
            version: self.version,
            block_size: self.block_size,
            min_update_index: self.min_update_index,
            max_update_index: self.max_update_index,
            ref_root: self.ref_root,
            obj_root: self.obj_root,
            log_root: self.log_root,
            obj_id_len: self.obj_id_len,

            include_deletes: self.include_deletes,
        }
    }
}

impl<S> Reader<S>
where
    S: BlockSource,
{
    /// Open a table over `source`, validating the header and footer.
    pub fn new(source: S) -> Result<Reader<S>> {
        let size = source.size()?;
        let floor = u64::try_from(HEADER_SIZE + FOOTER_SIZE).unwrap();
        if size < floor {
            err_at!(IntegrityError, msg: "table of {} bytes, minimum {}", size, floor)?
        }

        let header = source.read(0, HEADER_SIZE)?;
        check_remaining!(header, HEADER_SIZE, "table header")?;
        if header[..4] != MAGIC {
            err_at!(IntegrityError, msg: "bad header magic {:?}", &header[..4])?
        }

        let footer = source.read(size - u64::try_from(FOOTER_SIZE).unwrap(), FOOTER_SIZE)?;
        check_remaining!(footer, FOOTER_SIZE, "table footer")?;
        if footer[..4] != MAGIC {
            err_at!(IntegrityError, msg: "bad footer magic {:?}", &footer[..4])?
        }
        let version = footer[4];
        if version != VERSION {
            err_at!(IntegrityError, msg: "version {} not supported", version)?
        }

        let crc = {
            let mut bytes = [0; 4];
            bytes.copy_from_slice(&footer[64..]);
            u32::from_be_bytes(bytes)
        };
        let computed = block::CRC32.checksum(&footer[..64]);
        if crc != computed {
            err_at!(IntegrityError, msg: "footer crc {:x} != {:x}", computed, crc)?
        }

        let block_size = usize::try_from(util::decode_u24(&footer[5..8])?).unwrap();
        let min_update_index = decode_u64(&footer[8..16]);
        let max_update_index = decode_u64(&footer[16..24]);
        if min_update_index > max_update_index {
            err_at!(
                IntegrityError, msg: "update-index range {} > {}",
                min_update_index, max_update_index
            )?
        }

        let ref_root = decode_u64(&footer[24..32]);
        let packed = decode_u64(&footer[32..40]);
        let (obj_root, obj_id_len) = match packed {
            0 => (0, 0),
            packed => (packed >> 5, usize::try_from(packed & 0x1f).unwrap()),
        };
        let log_root = decode_u64(&footer[40..48]);

        let blocks_end = size - u64::try_from(FOOTER_SIZE).unwrap();
        for root in [ref_root, obj_root, log_root].iter() {
            let valid = *root == 0
                || (*root >= u64::try_from(HEADER_SIZE).unwrap() && *root < blocks_end);
            if !valid {
                err_at!(IntegrityError, msg: "index root {} out of bounds", root)?
            }
        }
        if obj_root != 0 && (obj_id_len < 1 || obj_id_len > crate::ID_LENGTH) {
            err_at!(IntegrityError, msg: "obj-id prefix length {}", obj_id_len)?
        }

        debug!(
            target: "reftable",
            "opened table of {} bytes, update-indexes [{}, {}]",
            size, min_update_index, max_update_index
        );

        Ok(Reader {
            source: Arc::new(source),
            cache: Arc::new(Mutex::new(BlockCache::new(CACHE_BLOCKS))),

            size,
            version,
            block_size,
            min_update_index,
            max_update_index,
            ref_root,
            obj_root,
            log_root,
            obj_id_len,

            include_deletes: false,
        })
    }

    /// When false, the default, ref cursors skip tombstones; when true
    /// tombstones are yielded and [RefRecord::is_deletion] reports them.
    pub fn set_include_deletes(&mut self, include_deletes: bool) -> &mut Self {
        self.include_deletes = include_deletes;
        self
    }

    #[inline]
    pub fn to_version(&self) -> u8 {
        self.version
    }

    #[inline]
    pub fn to_block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub fn to_min_update_index(&self) -> u64 {
        self.min_update_index
    }

    #[inline]
    pub fn to_max_update_index(&self) -> u64 {
        self.max_update_index
    }

    /// Return a cursor streaming every ref record in name order.
    pub fn all_refs(&self) -> Result<RefCursor<S>> {
        RefCursor::all(self)
    }

    /// Return a cursor positioned at the first ref whose name is `>= name`.
    pub fn seek_ref(&self, name: &str) -> Result<RefCursor<S>> {
        RefCursor::seek(self, name.as_bytes(), None)
    }

    /// Return a cursor yielding refs whose name starts with `prefix`,
    /// stopping at the first name that does not. An empty prefix yields
    /// every ref.
    pub fn refs_with_prefix(&self, prefix: &str) -> Result<RefCursor<S>> {
        match prefix.is_empty() {
            true => self.all_refs(),
            false => {
                RefCursor::seek(self, prefix.as_bytes(), Some(prefix.as_bytes().to_vec()))
            }
        }
    }

    /// Return the ref named exactly `name`, if present.
    pub fn exact_ref(&self, name: &str) -> Result<Option<RefRecord>> {
        let mut cursor = self.seek_ref(name)?;
        match cursor.next() {
            Some(Ok(r)) if r.name == name => Ok(Some(r)),
            Some(Ok(_)) | None => Ok(None),
            Some(Err(err)) => Err(err),
        }
    }

    /// Return a cursor over the refs whose target or peeled id equals
    /// `id`, in file order. Tables without an object index fall back to a
    /// full ref scan.
    pub fn by_object_id(&self, id: &Oid) -> Result<ObjCursor<S>> {
        if self.obj_root == 0 {
            return ObjCursor::full_scan(self, *id);
        }

        let prefix = &id.as_bytes()[..self.obj_id_len];
        let positions = match self.descend(self.obj_root, prefix)? {
            Some(leaf) => {
                let block = self.load_block(leaf)?;
                let (pos, mut key) = block.seek(prefix)?;
                match block.decode_entry(pos, &mut key)? {
                    Some((Payload::Obj { positions }, _)) if key == prefix => positions,
                    Some(_) | None => Vec::default(),
                }
            }
            None => Vec::default(),
        };
        ObjCursor::from_positions(self, positions, *id)
    }

    /// Return true iff the table carries an object back-index, or has no
    /// refs at all.
    pub fn has_object_map(&self) -> Result<bool> {
        match self.obj_root {
            0 => Ok(self.next_block(u64::try_from(HEADER_SIZE).unwrap(), BLOCK_REF)?.is_none()),
            _ => Ok(true),
        }
    }

    /// Return a cursor over every log record, name ascending and
    /// update-index descending within a name.
    pub fn all_logs(&self) -> Result<LogCursor<S>> {
        LogCursor::seek(self, &[], None)
    }

    /// Return a cursor positioned at the newest log entry for `name` with
    /// update-index `<= max_update_index`. The cursor never crosses into
    /// entries of a different name.
    pub fn seek_log(&self, name: &str, max_update_index: u64) -> Result<LogCursor<S>> {
        let key = record::log_key(name, max_update_index);
        LogCursor::seek(self, &key, Some(name.to_string()))
    }

    /// Full-table scan asserting key ordering, update-index containment
    /// and block integrity. Return the table facts gathered on the way.
    pub fn validate(&self) -> Result<TableInfo> {
        let mut info = TableInfo {
            version: self.version,
            block_size: self.block_size,
            min_update_index: self.min_update_index,
            max_update_index: self.max_update_index,
            has_ref_index: self.ref_root != 0,
            has_obj_index: self.obj_root != 0,
            has_log_index: self.log_root != 0,
            obj_id_len: self.obj_id_len,
            ..TableInfo::default()
        };

        let mut within = self.clone();
        within.set_include_deletes(true);

        let mut prev: Option<RefRecord> = None;
        for r in within.all_refs()? {
            let r = r?;
            if let Some(prev) = prev.as_ref() {
                if prev.name >= r.name {
                    err_at!(IntegrityError, msg: "refs unordered at {}", r.name)?
                }
            }
            if r.update_index < self.min_update_index
                || r.update_index > self.max_update_index
            {
                err_at!(IntegrityError, msg: "ref {} update-index {}", r.name, r.update_index)?
            }
            info.n_refs += 1;
            prev = Some(r);
        }

        let mut prev: Option<Vec<u8>> = None;
        for l in within.all_logs()? {
            let l = l?;
            let key = l.to_key();
            if let Some(prev) = prev.as_ref() {
                if prev.as_slice() >= key.as_slice() {
                    err_at!(IntegrityError, msg: "logs unordered at {}", l.name)?
                }
            }
            info.n_logs += 1;
            prev = Some(key);
        }

        debug!(
            target: "reftable",
            "validated table, {} refs {} logs", info.n_refs, info.n_logs
        );

        Ok(info)
    }
}

// block plumbing shared with the cursor layer.
impl<S> Reader<S>
where
    S: BlockSource,
{
    #[inline]
    pub(crate) fn to_include_deletes(&self) -> bool {
        self.include_deletes
    }

    #[inline]
    pub(crate) fn to_ref_root(&self) -> u64 {
        self.ref_root
    }

    #[inline]
    pub(crate) fn to_log_root(&self) -> u64 {
        self.log_root
    }

    // read chunk size; tables recording block size zero fall back to the
    // default.
    fn chunk(&self) -> usize {
        match self.block_size {
            0 => crate::BLOCK_SIZE,
            size => size,
        }
    }

    // decode the block at `off`, through the shared cache.
    pub(crate) fn load_block(&self, off: u64) -> Result<Arc<Block>> {
        if let Some(block) = self.lock_cache()?.get(off) {
            return Ok(block);
        }

        let mut data = self.source.read(off, self.chunk())?;
        if data.len() >= 4 {
            let want = usize::try_from(util::decode_u24(&data[1..])?).unwrap();
            if want > data.len() {
                data = self.source.read(off, want)?;
            }
        }
        let block = Arc::new(Block::decode(&data)?);

        self.lock_cache()?.set(off, Arc::clone(&block));
        Ok(block)
    }

    // next data block of type `expect` at or after `off`, skipping
    // alignment padding. None once the section, or the file, ends.
    pub(crate) fn next_block(
        &self,
        off: u64,
        expect: u8,
    ) -> Result<Option<(u64, Arc<Block>)>> {
        let blocks_end = self.size - u64::try_from(FOOTER_SIZE).unwrap();

        let mut off = off;
        for _attempt in 0..2 {
            if off >= blocks_end {
                return Ok(None);
            }

            let head = self.source.read(off, 1)?;
            match head.first() {
                None => return Ok(None),
                // alignment padding; snap to the next block boundary.
                Some(0) if self.block_size > 0 => {
                    let aligned = util::align_up(off + 1, self.block_size)?;
                    off = aligned;
                }
                Some(t) if *t == expect => {
                    let block = self.load_block(off)?;
                    return Ok(Some((off, block)));
                }
                Some(_) => return Ok(None),
            }
        }
        Ok(None)
    }

    // walk an index pyramid from `root` down to the leaf block whose key
    // range covers `target`. None when target is past every key.
    pub(crate) fn descend(&self, root: u64, target: &[u8]) -> Result<Option<u64>> {
        let mut off = root;
        loop {
            let block = self.load_block(off)?;
            if block.block_type() != BLOCK_INDEX {
                return Ok(Some(off));
            }

            let (pos, mut key) = block.seek(target)?;
            match block.decode_entry(pos, &mut key)? {
                Some((Payload::Index { offset }, _)) => off = offset,
                Some(_) => err_at!(FormatError, msg: "non-index record in index block")?,
                None => return Ok(None),
            }
        }
    }

    fn lock_cache(&self) -> Result<std::sync::MutexGuard<BlockCache>> {
        match self.cache.lock() {
            Ok(guard) => Ok(guard),
            Err(err) => err_at!(Fatal, msg: "poisoned block cache: {}", err),
        }
    }
}

fn decode_u64(buf: &[u8]) -> u64 {
    let mut bytes = [0; 8];
    bytes.copy_from_slice(&buf[..8]);
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
#[path = "reader_test.rs"]
mod reader_test;
