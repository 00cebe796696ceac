//! Module implement the block codec: a typed, length-prefixed,
//! CRC-validated container of prefix-compressed records followed by a
//! restart-offset trailer.
//!
//! ## Block data structure:
//!
//! ```text
//!       + restart point                + restart point (every R records)
//!      /                              /
//!     +--------+----------+----------+----------+---------------+-------+
//!     | header | record 1 | record 2 |   ...    | restart table |  crc  |
//!     +--------+----------+----------+----------+---------------+-------+
//! ```
//!
//! The 4-byte header carries the block type tag and the total on-disk
//! length as big-endian u24. Each record shares a key prefix with its
//! predecessor, except at restart points where the key is stored in full:
//!
//! ```text
//!     +-----------------+---------------------------+--------+-------+
//!     | shared (varint) | suffix-len << 3 | kind    | suffix | value |
//!     +-----------------+---------------------------+--------+-------+
//! ```
//!
//! The restart table lists the block-relative offsets of the restart
//! records as big-endian u24, closed by a big-endian u16 count. The count
//! trails the offsets so a decoder can locate the table from the block
//! tail. The trailing CRC32 (IEEE) covers every on-disk byte before it.
//!
//! Log blocks deflate everything between the header and the CRC with
//! zlib; restart offsets there index the inflated image.

use crc::{Crc, CRC_32_ISO_HDLC};
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};

use std::{
    cmp,
    convert::TryFrom,
    io::{Read, Write},
};

use crate::{
    check_remaining,
    record::{self, Payload},
    util, Error, Result,
};

/// Block type tag for reference blocks.
pub const BLOCK_REF: u8 = b'r';
/// Block type tag for object back-index blocks.
pub const BLOCK_OBJ: u8 = b'o';
/// Block type tag for reflog blocks.
pub const BLOCK_LOG: u8 = b'g';
/// Block type tag for index blocks.
pub const BLOCK_INDEX: u8 = b'i';

/// Size of the per-block header, type tag and u24 length.
pub const BLOCK_HEADER_SIZE: usize = 4;

/// Size of the trailing CRC32.
pub const BLOCK_CRC_SIZE: usize = 4;

/// Default number of records between restart points.
pub const RESTART_INTERVAL: usize = 16;

pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

// restart table footprint for `n` restarts: u24 offsets plus u16 count.
#[inline]
fn restarts_footprint(n: usize) -> usize {
    (n * 3) + 2
}

pub(crate) fn is_block_type(block_type: u8) -> bool {
    matches!(block_type, BLOCK_REF | BLOCK_OBJ | BLOCK_LOG | BLOCK_INDEX)
}

/// Encode one block, appending records one by one until the target block
/// size is reached.
pub(crate) struct BlockBuilder {
    block_type: u8,
    block_size: usize,
    restart_interval: usize,
    // top level of an index pyramid that exceeded the configured depth is
    // written as a single oversized flat index.
    unbounded: bool,

    buf: Vec<u8>, // header placeholder + records
    restarts: Vec<u32>,
    last_key: Vec<u8>,
    n_records: usize,
}

impl BlockBuilder {
    pub(crate) fn new(
        block_type: u8,
        block_size: usize,
        restart_interval: usize,
    ) -> BlockBuilder {
        BlockBuilder {
            block_type,
            block_size,
            restart_interval,
            unbounded: false,

            buf: vec![0; BLOCK_HEADER_SIZE],
            restarts: Vec::default(),
            last_key: Vec::default(),
            n_records: 0,
        }
    }

    pub(crate) fn new_unbounded(block_type: u8, restart_interval: usize) -> BlockBuilder {
        let mut block = BlockBuilder::new(block_type, 0, restart_interval);
        block.unbounded = true;
        block
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.n_records == 0
    }

    #[inline]
    pub(crate) fn block_type(&self) -> u8 {
        self.block_type
    }

    #[inline]
    pub(crate) fn len_records(&self) -> usize {
        self.n_records
    }

    pub(crate) fn as_last_key(&self) -> &[u8] {
        &self.last_key
    }

    /// Append a record. Return false if the record does not fit the target
    /// block size, in which case the caller closes this block and retries
    /// on a fresh one. An empty block that cannot hold the record fails
    /// with [Error::BlockSizeTooSmall] carrying the minimum size.
    pub(crate) fn append(&mut self, key: &[u8], kind: u8, value: &[u8]) -> Result<bool> {
        let restart = (self.n_records % self.restart_interval) == 0;
        let shared = match restart {
            true => 0,
            false => util::common_prefix(&self.last_key, key),
        };
        let suffix = &key[shared..];

        let mut entry = Vec::with_capacity(suffix.len() + value.len() + 4);
        util::encode_varint(u64::try_from(shared).unwrap(), &mut entry);
        let tag = (u64::try_from(suffix.len()).unwrap() << 3) | (kind as u64);
        util::encode_varint(tag, &mut entry);
        entry.extend_from_slice(suffix);
        entry.extend_from_slice(value);

        if !self.unbounded {
            let n_restarts = self.restarts.len() + (restart as usize);
            let total = self.buf.len()
                + entry.len()
                + restarts_footprint(n_restarts)
                + BLOCK_CRC_SIZE;
            if total > self.block_size {
                if self.n_records > 0 {
                    return Ok(false);
                }
                // a full-key entry, one restart and the framing must fit.
                let min = BLOCK_HEADER_SIZE
                    + entry.len()
                    + restarts_footprint(1)
                    + BLOCK_CRC_SIZE;
                let prefix = format!("{}:{}", file!(), line!());
                return Err(Error::BlockSizeTooSmall(prefix, min));
            }
        }

        if restart {
            self.restarts.push(u32::try_from(self.buf.len()).unwrap());
        }
        self.buf.extend_from_slice(&entry);
        self.last_key = key.to_vec();
        self.n_records += 1;

        Ok(true)
    }

    /// Close the block: write the restart table, fix up the header length
    /// and seal with CRC32. With `compress`, deflate everything between
    /// header and CRC.
    pub(crate) fn finish(mut self, compress: bool) -> Result<Vec<u8>> {
        for off in self.restarts.iter() {
            util::encode_u24(*off, &mut self.buf)?;
        }
        let count = u16::try_from(self.restarts.len());
        self.buf
            .extend_from_slice(&err_at!(FailConvert, count)?.to_be_bytes());

        let mut out = match compress {
            false => self.buf,
            true => {
                let mut enc = ZlibEncoder::new(
                    self.buf[..BLOCK_HEADER_SIZE].to_vec(),
                    Compression::default(),
                );
                err_at!(IOError, enc.write_all(&self.buf[BLOCK_HEADER_SIZE..]))?;
                err_at!(IOError, enc.finish())?
            }
        };

        let disk_len = u32::try_from(out.len() + BLOCK_CRC_SIZE);
        let disk_len = err_at!(FailConvert, disk_len)?;
        out[0] = self.block_type;
        let mut header = Vec::with_capacity(3);
        util::encode_u24(disk_len, &mut header)?;
        out[1..BLOCK_HEADER_SIZE].copy_from_slice(&header);

        let crc = CRC32.checksum(&out);
        out.extend_from_slice(&crc.to_be_bytes());

        Ok(out)
    }
}

/// Decoded block, presenting ordered record iteration and binary search
/// over its restart points.
#[derive(Debug)]
pub(crate) struct Block {
    block_type: u8,
    // header + records + restart table, inflated for log blocks.
    data: Vec<u8>,
    // offset in `data` where the restart table begins.
    limit: usize,
    restarts: Vec<u32>,
    // stored on-disk length, before any alignment padding.
    disk_len: usize,
}

impl Block {
    /// Decode a block from `raw`, a slice starting at the block boundary
    /// and extending at least to the block's stored length.
    pub(crate) fn decode(raw: &[u8]) -> Result<Block> {
        let floor = BLOCK_HEADER_SIZE + restarts_footprint(0) + BLOCK_CRC_SIZE;
        check_remaining!(raw, floor, "block header")?;

        let block_type = raw[0];
        if !is_block_type(block_type) {
            err_at!(FormatError, msg: "bad block type {:#x}", block_type)?
        }
        let disk_len = err_at!(FailConvert, usize::try_from(util::decode_u24(&raw[1..])?))?;
        if disk_len < floor {
            err_at!(FormatError, msg: "block length {} below header", disk_len)?
        } else if disk_len > raw.len() {
            err_at!(FormatError, msg: "block length {}/{} truncated", disk_len, raw.len())?
        }
        let body = &raw[..disk_len];

        let crc = {
            let mut bytes = [0; 4];
            bytes.copy_from_slice(&body[disk_len - BLOCK_CRC_SIZE..]);
            u32::from_be_bytes(bytes)
        };
        let computed = CRC32.checksum(&body[..disk_len - BLOCK_CRC_SIZE]);
        if crc != computed {
            err_at!(IntegrityError, msg: "block crc {:x} != {:x}", computed, crc)?
        }

        // a raw log payload opens with the first record's zero shared-prefix
        // varint; a zlib stream never opens with 0x00.
        let payload = &body[BLOCK_HEADER_SIZE..disk_len - BLOCK_CRC_SIZE];
        let deflated = block_type == BLOCK_LOG && payload.first() != Some(&0);
        let data = match deflated {
            true => {
                let mut data = body[..BLOCK_HEADER_SIZE].to_vec();
                let mut dec = ZlibDecoder::new(payload);
                err_at!(FormatError, dec.read_to_end(&mut data), "inflate log block")?;
                data
            }
            false => body[..disk_len - BLOCK_CRC_SIZE].to_vec(),
        };

        check_remaining!(data, BLOCK_HEADER_SIZE + 2, "restart count")?;
        let count = {
            let mut bytes = [0; 2];
            bytes.copy_from_slice(&data[data.len() - 2..]);
            usize::from(u16::from_be_bytes(bytes))
        };
        let footprint = restarts_footprint(count);
        if BLOCK_HEADER_SIZE + footprint > data.len() {
            err_at!(FormatError, msg: "restart table {} overflows block", count)?
        }
        let limit = data.len() - footprint;

        let mut restarts = Vec::with_capacity(count);
        for i in 0..count {
            let off = util::decode_u24(&data[limit + (i * 3)..])?;
            let off_u = err_at!(FailConvert, usize::try_from(off))?;
            let ascending = restarts.last().map_or(true, |prev| *prev < off);
            if off_u < BLOCK_HEADER_SIZE || off_u >= limit || !ascending {
                err_at!(FormatError, msg: "bad restart offset {}", off)?
            }
            restarts.push(off);
        }
        if count == 0 && limit > BLOCK_HEADER_SIZE {
            err_at!(FormatError, msg: "records without restart point")?
        }

        Ok(Block {
            block_type,
            data,
            limit,
            restarts,
            disk_len,
        })
    }

    #[inline]
    pub(crate) fn block_type(&self) -> u8 {
        self.block_type
    }

    #[inline]
    pub(crate) fn disk_len(&self) -> usize {
        self.disk_len
    }

    /// Decode the record at `pos`, reconstructing its key into `key` from
    /// the shared-prefix field. Return the payload and the next position,
    /// or None at the end of the record region.
    pub(crate) fn decode_entry(
        &self,
        pos: usize,
        key: &mut Vec<u8>,
    ) -> Result<Option<(Payload, usize)>> {
        if pos >= self.limit {
            return Ok(None);
        }

        let (shared, pos) = util::decode_varint(&self.data[..self.limit], pos)?;
        let (tag, pos) = util::decode_varint(&self.data[..self.limit], pos)?;
        let shared = err_at!(FailConvert, usize::try_from(shared))?;
        let suffix = err_at!(FailConvert, usize::try_from(tag >> 3))?;
        let kind = (tag & 0x7) as u8;

        if shared > key.len() {
            err_at!(FormatError, msg: "shared prefix {}/{}", shared, key.len())?
        }
        check_remaining!(&self.data[pos..self.limit], suffix, "key suffix")?;
        key.truncate(shared);
        key.extend_from_slice(&self.data[pos..pos + suffix]);

        let (payload, pos) =
            record::decode_payload(self.block_type, kind, &self.data[..self.limit], pos + suffix)?;
        Ok(Some((payload, pos)))
    }

    // full key stored at restart `i`.
    fn restart_key(&self, i: usize) -> Result<Vec<u8>> {
        let pos = usize::try_from(self.restarts[i]).unwrap();
        let (_, pos) = util::decode_varint(&self.data[..self.limit], pos)?;
        let (tag, pos) = util::decode_varint(&self.data[..self.limit], pos)?;
        let suffix = err_at!(FailConvert, usize::try_from(tag >> 3))?;
        check_remaining!(&self.data[pos..self.limit], suffix, "restart key")?;
        Ok(self.data[pos..pos + suffix].to_vec())
    }

    /// Position a scan at the first record whose key is `>= target`.
    /// Return the `(pos, key-state)` pair to resume [Block::decode_entry]
    /// from; the pair lands on the record region's end when every key in
    /// the block is smaller.
    pub(crate) fn seek(&self, target: &[u8]) -> Result<(usize, Vec<u8>)> {
        if self.restarts.is_empty() {
            return Ok((self.limit, Vec::default()));
        }

        // greatest restart whose key is <= target.
        let (mut lo, mut hi) = (0, self.restarts.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.restart_key(mid)?.as_slice().cmp(target) {
                cmp::Ordering::Greater => hi = mid,
                _ => lo = mid + 1,
            }
        }
        let start = self.restarts[lo.saturating_sub(1)];

        let mut pos = usize::try_from(start).unwrap();
        let mut key = Vec::default();
        loop {
            let (prev_pos, prev_key) = (pos, key.clone());
            match self.decode_entry(pos, &mut key)? {
                Some((_, next)) if key.as_slice() < target => pos = next,
                Some(_) => break Ok((prev_pos, prev_key)),
                None => break Ok((pos, key)),
            }
        }
    }

    /// Key of the last record in this block.
    pub(crate) fn last_key(&self) -> Result<Vec<u8>> {
        let start = match self.restarts.last() {
            Some(off) => usize::try_from(*off).unwrap(),
            None => return Ok(Vec::default()),
        };

        let mut pos = start;
        let mut key = Vec::default();
        while let Some((_, next)) = self.decode_entry(pos, &mut key)? {
            pos = next;
        }
        Ok(key)
    }

    /// First record key in this block.
    pub(crate) fn first_key(&self) -> Result<Vec<u8>> {
        match self.restarts.first() {
            Some(_) => self.restart_key(0),
            None => Ok(Vec::default()),
        }
    }
}

#[cfg(test)]
#[path = "block_test.rs"]
mod block_test;
