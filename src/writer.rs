//! Module implement the table writer.
//!
//! A [Writer] streams records through the block codec into ordered
//! sections (refs, then the optional object back-index, then logs),
//! builds a multi-level index pyramid per section and seals the table
//! with a footer carrying file-wide metadata and its CRC.

use log::info;

use std::{cmp, collections::BTreeMap, convert::TryFrom, ffi, mem};

use crate::{
    block::{BlockBuilder, BLOCK_INDEX, BLOCK_LOG, BLOCK_OBJ, BLOCK_REF, RESTART_INTERVAL},
    flush::{Flusher, FLUSH_QUEUE_SIZE},
    record::{self, IndexEntry, LogRecord, ObjRecord, Oid, RefRecord},
    util, Error, Result, FOOTER_SIZE, HEADER_SIZE, MAGIC, VERSION,
};

/// Default target block size, 4 * 1024 bytes.
pub const BLOCK_SIZE: usize = 4 * 1024;

/// Default ceiling on index pyramid depth, per section. When a pyramid
/// would grow deeper, its top level is left as an oversized flat index.
pub const MAX_INDEX_LEVELS: usize = 4;

// object-id prefixes are at least this long, even when shorter prefixes
// would be unique.
const MIN_OBJ_PREFIX: usize = 2;

/// Configuration for building a table.
///
/// Configuration is used only while writing; everything a reader needs
/// travels in the table's header and footer.
#[derive(Clone, Debug)]
pub struct Config {
    /// Target block size for data and index blocks.
    ///
    /// Default: [BLOCK_SIZE]
    pub block_size: usize,
    /// Number of records between restart points within a block.
    ///
    /// Default: [RESTART_INTERVAL]
    pub restart_interval: usize,
    /// Ceiling on index pyramid depth, must be at least 1.
    ///
    /// Default: [MAX_INDEX_LEVELS]
    pub max_index_levels: usize,
    /// Zero-pad every data block to the target block size.
    ///
    /// Default: false
    pub align_blocks: bool,
    /// Deflate log block payloads with zlib.
    ///
    /// Default: true
    pub compress_logs: bool,
    /// Maintain the object-id to reference back-index.
    ///
    /// Default: true
    pub index_objects: bool,
    /// Flush queue size, for file backed writers.
    ///
    /// Default: [FLUSH_QUEUE_SIZE]
    pub flush_queue_size: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config::new()
    }
}

impl Config {
    /// Create a new configuration value, use the `set_*` methods to add
    /// more configuration.
    pub fn new() -> Config {
        Config {
            block_size: BLOCK_SIZE,
            restart_interval: RESTART_INTERVAL,
            max_index_levels: MAX_INDEX_LEVELS,
            align_blocks: false,
            compress_logs: true,
            index_objects: true,
            flush_queue_size: FLUSH_QUEUE_SIZE,
        }
    }

    /// Configure target block size.
    pub fn set_block_size(&mut self, block_size: usize) -> &mut Self {
        self.block_size = block_size;
        self
    }

    /// Configure the restart interval for prefix compression.
    pub fn set_restart_interval(&mut self, restart_interval: usize) -> &mut Self {
        self.restart_interval = restart_interval;
        self
    }

    /// Configure the index pyramid depth ceiling.
    pub fn set_max_index_levels(&mut self, levels: usize) -> &mut Self {
        self.max_index_levels = levels;
        self
    }

    /// Zero-pad data blocks to the block size.
    pub fn set_align_blocks(&mut self, align: bool) -> &mut Self {
        self.align_blocks = align;
        self
    }

    /// Enable/disable zlib compression of log blocks.
    pub fn set_compress_logs(&mut self, compress: bool) -> &mut Self {
        self.compress_logs = compress;
        self
    }

    /// Enable/disable the object-id back-index.
    pub fn set_index_objects(&mut self, index: bool) -> &mut Self {
        self.index_objects = index;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.block_size > 0x00ff_ffff {
            err_at!(ContractError, msg: "block size {} overflows u24", self.block_size)
        } else if self.restart_interval == 0 {
            err_at!(ContractError, msg: "restart interval must be positive")
        } else if self.max_index_levels == 0 {
            err_at!(ContractError, msg: "max index levels must be at least 1")
        } else {
            Ok(())
        }
    }
}

/// Statistics for a sealed table, published by [Writer::finish].
#[derive(Clone, Default, Debug)]
pub struct Stats {
    /// Comes from [Config] type.
    pub block_size: usize,
    /// Comes from [Config] type.
    pub restart_interval: usize,

    /// Update-index range covered by this table.
    pub min_update_index: u64,
    pub max_update_index: u64,

    /// Number of reference records written.
    pub n_refs: u64,
    /// Number of object back-index records written.
    pub n_objs: u64,
    /// Number of reflog records written.
    pub n_logs: u64,

    /// Bytes in the ref section, excluding its index.
    pub ref_bytes: u64,
    /// Bytes in the obj section, excluding its index.
    pub obj_bytes: u64,
    /// Bytes in the log section, excluding its index.
    pub log_bytes: u64,
    /// Bytes across all index pyramids.
    pub index_bytes: u64,
    /// Zero bytes spent on block alignment.
    pub padding_bytes: u64,

    /// Index pyramid depth per section.
    pub ref_index_levels: usize,
    pub obj_index_levels: usize,
    pub log_index_levels: usize,

    /// Object-id prefix width chosen for the obj section.
    pub obj_id_len: usize,

    /// Total file size, header and footer included.
    pub total_bytes: u64,
}

// Init -> Began -> (refs..) -> (logs..) -> Finished; the obj section is
// written internally when the ref section ends.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Phase {
    Init,
    Began,
    Refs,
    Logs,
    Finished,
}

/// Build a table from a monotonically increasing sequence of records.
///
/// Refer to package documentation for typical work-flow.
pub struct Writer {
    config: Config,
    flusher: Flusher,
    phase: Phase,
    fpos: u64,
    min_update_index: u64,
    max_update_index: u64,

    block: Option<BlockBuilder>,
    block_start: u64,

    ref_index: Vec<IndexEntry>,
    obj_index: Vec<IndexEntry>,
    log_index: Vec<IndexEntry>,
    objs: BTreeMap<Oid, Vec<u64>>,

    last_ref: Vec<u8>,
    last_log: Vec<u8>,

    ref_root: u64,
    obj_root: u64,
    log_root: u64,

    stats: Stats,
}

impl Writer {
    /// Create a writer sealing the table into a fresh file at `loc`.
    pub fn create(config: Config, loc: &ffi::OsStr) -> Result<Writer> {
        let flusher = Flusher::new(loc, config.flush_queue_size)?;
        Ok(Writer::new(config, flusher))
    }

    /// Create a writer sealing the table into memory; retrieve the bytes
    /// with [Writer::into_bytes] after [Writer::finish].
    pub fn in_memory(config: Config) -> Writer {
        Writer::new(config, Flusher::buffer())
    }

    pub fn new(config: Config, flusher: Flusher) -> Writer {
        let stats = Stats {
            block_size: config.block_size,
            restart_interval: config.restart_interval,
            ..Stats::default()
        };

        Writer {
            config,
            flusher,
            phase: Phase::Init,
            fpos: 0,
            min_update_index: 0,
            max_update_index: 0,

            block: None,
            block_start: 0,

            ref_index: Vec::default(),
            obj_index: Vec::default(),
            log_index: Vec::default(),
            objs: BTreeMap::new(),

            last_ref: Vec::default(),
            last_log: Vec::default(),

            ref_root: 0,
            obj_root: 0,
            log_root: 0,

            stats,
        }
    }

    /// Begin the table, fixing the inclusive update-index range it covers,
    /// and emit the file header.
    pub fn begin(&mut self, min_update_index: u64, max_update_index: u64) -> Result<()> {
        if self.phase != Phase::Init {
            err_at!(ContractError, msg: "begin called twice")?
        }
        self.config.validate()?;
        if min_update_index > max_update_index {
            err_at!(
                ContractError, msg: "update-index range {} > {}",
                min_update_index, max_update_index
            )?
        }

        self.min_update_index = min_update_index;
        self.max_update_index = max_update_index;
        self.stats.min_update_index = min_update_index;
        self.stats.max_update_index = max_update_index;

        let header = self.header_bytes()?;
        self.flusher.flush(header)?;
        self.fpos = u64::try_from(HEADER_SIZE).unwrap();
        self.phase = Phase::Began;

        Ok(())
    }

    /// Write one reference record. Names must arrive strictly increasing.
    pub fn write_ref(&mut self, r: &RefRecord) -> Result<()> {
        match self.phase {
            Phase::Began | Phase::Refs => (),
            Phase::Init => err_at!(ContractError, msg: "write_ref before begin")?,
            Phase::Logs => err_at!(ContractError, msg: "ref {} after log section", r.name)?,
            Phase::Finished => err_at!(ContractError, msg: "writer is finished")?,
        }

        record::validate_ref_name(&r.name)?;
        let kind = r.to_kind()?;
        self.check_update_index(r.update_index)?;
        if !self.last_ref.is_empty() && r.name.as_bytes() <= self.last_ref.as_slice() {
            err_at!(ContractError, msg: "ref {} out of order", r.name)?
        }

        let mut value = Vec::with_capacity(64);
        r.encode_value(self.min_update_index, &mut value)?;
        let pos = self.add_record(BLOCK_REF, r.name.as_bytes(), kind, &value)?;

        if self.config.index_objects {
            for id in [r.value.to_id(), r.value.to_peeled()].iter().flatten() {
                self.objs.entry(*id).or_insert_with(Vec::default).push(pos);
            }
        }

        self.last_ref = r.name.as_bytes().to_vec();
        self.stats.n_refs += 1;
        self.phase = Phase::Refs;

        Ok(())
    }

    /// Convenience to write a collection of refs, verifying that the
    /// collection is strictly increasing by name.
    pub fn sort_and_write_refs(&mut self, refs: &[RefRecord]) -> Result<()> {
        for pair in refs.windows(2) {
            if pair[0].name.as_bytes() >= pair[1].name.as_bytes() {
                err_at!(
                    ContractError, msg: "refs not sorted at {} {}", pair[0].name, pair[1].name
                )?
            }
        }
        for r in refs.iter() {
            self.write_ref(r)?
        }
        Ok(())
    }

    /// Write one reflog record. Composite `(name, update-index)` keys must
    /// arrive strictly increasing; update-index descends within a name.
    pub fn write_log(&mut self, l: &LogRecord) -> Result<()> {
        match self.phase {
            Phase::Began | Phase::Refs => {
                self.end_ref_section()?;
                self.phase = Phase::Logs;
            }
            Phase::Logs => (),
            Phase::Init => err_at!(ContractError, msg: "write_log before begin")?,
            Phase::Finished => err_at!(ContractError, msg: "writer is finished")?,
        }

        record::validate_ref_name(&l.name)?;
        self.check_update_index(l.update_index)?;

        let key = l.to_key();
        if !self.last_log.is_empty() && key.as_slice() <= self.last_log.as_slice() {
            err_at!(
                ContractError, msg: "log {} @{} out of order", l.name, l.update_index
            )?
        }

        let mut value = Vec::with_capacity(128);
        l.encode_value(&mut value);
        self.add_record(BLOCK_LOG, &key, 0, &value)?;

        self.last_log = key;
        self.stats.n_logs += 1;

        Ok(())
    }

    /// Convenience to write a collection of log records, verifying that
    /// their composite keys are strictly increasing.
    pub fn write_logs(&mut self, logs: &[LogRecord]) -> Result<()> {
        for pair in logs.windows(2) {
            if pair[0].to_key() >= pair[1].to_key() {
                err_at!(
                    ContractError, msg: "logs not sorted at {} {}", pair[0].name, pair[1].name
                )?
            }
        }
        for l in logs.iter() {
            self.write_log(l)?
        }
        Ok(())
    }

    /// Seal the table: close the open section, write the index pyramids
    /// and the footer. Idempotent once the writer is finished.
    pub fn finish(&mut self) -> Result<Stats> {
        match self.phase {
            Phase::Finished => return Ok(self.stats.clone()),
            Phase::Init => err_at!(ContractError, msg: "finish before begin")?,
            Phase::Began | Phase::Refs => self.end_ref_section()?,
            Phase::Logs => self.close_block()?,
        }

        if !self.obj_index.is_empty() {
            let entries = std::mem::take(&mut self.obj_index);
            let (root, levels) = self.build_index(entries)?;
            self.obj_root = root;
            self.stats.obj_index_levels = levels;
        }
        if !self.log_index.is_empty() {
            let entries = std::mem::take(&mut self.log_index);
            let (root, levels) = self.build_index(entries)?;
            self.log_root = root;
            self.stats.log_index_levels = levels;
        }
        if self.ref_index.len() > 1 {
            let entries = std::mem::take(&mut self.ref_index);
            let (root, levels) = self.build_index(entries)?;
            self.ref_root = root;
            self.stats.ref_index_levels = levels;
        }

        let footer = self.footer_bytes()?;
        self.flusher.flush(footer)?;
        self.fpos += u64::try_from(FOOTER_SIZE).unwrap();
        self.stats.total_bytes = self.fpos;

        self.flusher.close()?;
        self.phase = Phase::Finished;

        info!(
            target: "reftable",
            "sealed table, {} refs {} logs {} bytes, indexes {}/{}/{}",
            self.stats.n_refs, self.stats.n_logs, self.stats.total_bytes,
            self.stats.ref_index_levels, self.stats.obj_index_levels,
            self.stats.log_index_levels
        );

        Ok(self.stats.clone())
    }

    /// Take the sealed table out of an in-memory writer. Return None for
    /// file backed writers, and before [Writer::finish].
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self.phase {
            Phase::Finished => self.flusher.into_bytes(),
            _ => None,
        }
    }

    pub fn to_stats(&self) -> Stats {
        self.stats.clone()
    }
}

impl Writer {
    fn check_update_index(&self, index: u64) -> Result<()> {
        if index < self.min_update_index || index > self.max_update_index {
            err_at!(
                ContractError, msg: "update-index {} outside [{}, {}]",
                index, self.min_update_index, self.max_update_index
            )
        } else {
            Ok(())
        }
    }

    // append a record to the current block, closing it and opening a
    // fresh one on overflow. Return the file offset of the block that
    // received the record.
    fn add_record(
        &mut self,
        block_type: u8,
        key: &[u8],
        kind: u8,
        value: &[u8],
    ) -> Result<u64> {
        loop {
            if self.block.is_none() {
                // the first block of the file shares its budget with the
                // 24-byte file header so aligned tables stay uniform.
                let mut size = self.config.block_size;
                if self.fpos == u64::try_from(HEADER_SIZE).unwrap() {
                    size = size.saturating_sub(HEADER_SIZE);
                }
                self.block = Some(BlockBuilder::new(
                    block_type,
                    size,
                    self.config.restart_interval,
                ));
                self.block_start = self.fpos;
            }

            let first = self.block_start == u64::try_from(HEADER_SIZE).unwrap();
            match self.block.as_mut().unwrap().append(key, kind, value) {
                Ok(true) => break Ok(self.block_start),
                Ok(false) => self.close_block()?,
                Err(Error::BlockSizeTooSmall(prefix, min)) if first => {
                    break Err(Error::BlockSizeTooSmall(prefix, min + HEADER_SIZE))
                }
                Err(err) => break Err(err),
            }
        }
    }

    // close and flush the current data block, recording it in its
    // section's level-0 index.
    fn close_block(&mut self) -> Result<()> {
        let builder = match self.block.take() {
            Some(builder) if !builder.is_empty() => builder,
            _ => return Ok(()),
        };

        let block_type = builder.block_type();
        let last_key = builder.as_last_key().to_vec();
        let compress = block_type == BLOCK_LOG && self.config.compress_logs;
        let bytes = builder.finish(compress)?;
        let len = u64::try_from(bytes.len()).unwrap();

        self.flusher.flush(bytes)?;
        self.fpos += len;

        let entry = IndexEntry {
            key: last_key,
            offset: self.block_start,
        };
        match block_type {
            BLOCK_REF => {
                self.stats.ref_bytes += len;
                self.ref_index.push(entry);
            }
            BLOCK_OBJ => {
                self.stats.obj_bytes += len;
                self.obj_index.push(entry);
            }
            BLOCK_LOG => {
                self.stats.log_bytes += len;
                self.log_index.push(entry);
            }
            _ => err_at!(Fatal, msg: "data block of type {}", block_type)?,
        }

        if self.config.align_blocks {
            let aligned = util::align_up(self.fpos, self.config.block_size)?;
            let pad = usize::try_from(aligned - self.fpos).unwrap();
            if pad > 0 {
                self.flusher.flush(vec![0; pad])?;
                self.fpos = aligned;
                self.stats.padding_bytes += u64::try_from(pad).unwrap();
            }
        }

        Ok(())
    }

    // close the ref section and flush the object back-index section
    // derived from it.
    fn end_ref_section(&mut self) -> Result<()> {
        self.close_block()?;

        if !self.config.index_objects || self.objs.is_empty() {
            return Ok(());
        }

        let obj_id_len = {
            let oids: Vec<&Oid> = self.objs.keys().collect();
            let mut len = MIN_OBJ_PREFIX;
            for pair in oids.windows(2) {
                let shared =
                    util::common_prefix(pair[0].as_bytes(), pair[1].as_bytes());
                len = cmp::max(len, shared + 1);
            }
            cmp::min(len, crate::ID_LENGTH)
        };
        self.stats.obj_id_len = obj_id_len;

        let objs = std::mem::take(&mut self.objs);
        for (oid, mut positions) in objs.into_iter() {
            positions.dedup();
            let obj = ObjRecord {
                prefix: oid.as_bytes()[..obj_id_len].to_vec(),
                positions,
            };
            let mut value = Vec::with_capacity(16);
            obj.encode_value(&mut value);
            self.add_record(BLOCK_OBJ, &obj.prefix, 0, &value)?;
            self.stats.n_objs += 1;
        }
        self.close_block()
    }

    // build one index pyramid bottom up; return its root offset and the
    // number of levels written.
    fn build_index(&mut self, entries: Vec<IndexEntry>) -> Result<(u64, usize)> {
        let mut entries = entries;
        let mut levels = 0;

        loop {
            levels += 1;
            let unbounded = levels >= self.config.max_index_levels;
            let out = self.write_index_level(mem::take(&mut entries), unbounded)?;
            match out.len() {
                0 => err_at!(Fatal, msg: "index level {} without blocks", levels)?,
                1 => break Ok((out[0].offset, levels)),
                _ => entries = out,
            }
        }
    }

    fn write_index_level(
        &mut self,
        entries: Vec<IndexEntry>,
        unbounded: bool,
    ) -> Result<Vec<IndexEntry>> {
        let new_builder = |config: &Config| match unbounded {
            true => BlockBuilder::new_unbounded(BLOCK_INDEX, config.restart_interval),
            false => BlockBuilder::new(
                BLOCK_INDEX,
                config.block_size,
                config.restart_interval,
            ),
        };

        let mut out = Vec::default();
        let mut builder = new_builder(&self.config);
        let mut start = self.fpos;

        for entry in entries.into_iter() {
            let mut value = Vec::with_capacity(8);
            util::encode_varint(entry.offset, &mut value);
            if !builder.append(&entry.key, 0, &value)? {
                let done = std::mem::replace(&mut builder, new_builder(&self.config));
                start = self.flush_index_block(done, start, &mut out)?;
                builder.append(&entry.key, 0, &value)?;
            }
        }
        if !builder.is_empty() {
            self.flush_index_block(builder, start, &mut out)?;
        }

        Ok(out)
    }

    // flush a finished index block; return the offset for the next one.
    fn flush_index_block(
        &mut self,
        builder: BlockBuilder,
        start: u64,
        out: &mut Vec<IndexEntry>,
    ) -> Result<u64> {
        let last_key = builder.as_last_key().to_vec();
        let bytes = builder.finish(false)?;
        let len = u64::try_from(bytes.len()).unwrap();

        self.flusher.flush(bytes)?;
        self.fpos += len;
        self.stats.index_bytes += len;

        out.push(IndexEntry {
            key: last_key,
            offset: start,
        });
        Ok(self.fpos)
    }

    fn header_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(&MAGIC);
        buf.push(VERSION);
        util::encode_u24(u32::try_from(self.config.block_size).unwrap(), &mut buf)?;
        buf.extend_from_slice(&self.min_update_index.to_be_bytes());
        buf.extend_from_slice(&self.max_update_index.to_be_bytes());
        Ok(buf)
    }

    fn footer_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(FOOTER_SIZE);
        buf.extend_from_slice(&MAGIC);
        buf.push(VERSION);
        util::encode_u24(u32::try_from(self.config.block_size).unwrap(), &mut buf)?;
        buf.extend_from_slice(&self.min_update_index.to_be_bytes());
        buf.extend_from_slice(&self.max_update_index.to_be_bytes());

        buf.extend_from_slice(&self.ref_root.to_be_bytes());
        let packed = match self.obj_root {
            0 => 0,
            root if root > (u64::MAX >> 5) => {
                err_at!(Fatal, msg: "obj root {} overflows packing", root)?
            }
            root => (root << 5) | u64::try_from(self.stats.obj_id_len).unwrap(),
        };
        buf.extend_from_slice(&packed.to_be_bytes());
        buf.extend_from_slice(&self.log_root.to_be_bytes());
        buf.extend_from_slice(&[0; 16]);

        let crc = crate::block::CRC32.checksum(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());

        Ok(buf)
    }
}

#[cfg(test)]
#[path = "writer_test.rs"]
mod writer_test;
