//! Module implement the four record kinds stored in a reftable and their
//! canonical byte layouts.
//!
//! Records are split into a comparison key and a value. Keys are compared
//! byte-lexicographic; reference records key on the reference name, reflog
//! records key on `(name, bit-inverted update-index)` so that newer entries
//! for the same reference sort first.

use arbitrary::Arbitrary;

use std::{
    convert::TryFrom,
    fmt::{self, Display},
    result,
};

use crate::{block, check_remaining, util, Error, Result};

/// Width of an object identifier, in bytes. Version 1 tables carry SHA-1
/// sized identifiers.
pub const ID_LENGTH: usize = 20;

/// Fixed-width opaque object identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Arbitrary)]
pub struct Oid([u8; ID_LENGTH]);

impl Oid {
    /// All-zero identifier, reserved to mean "no object".
    pub fn zero() -> Oid {
        Oid([0; ID_LENGTH])
    }

    pub fn new(bytes: [u8; ID_LENGTH]) -> Oid {
        Oid(bytes)
    }

    /// Return true for the reserved all-zero identifier.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|byte| *byte == 0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub(crate) fn decode(buf: &[u8], pos: usize) -> Result<(Oid, usize)> {
        check_remaining!(&buf[pos..], ID_LENGTH, "object-id")?;
        let mut bytes = [0; ID_LENGTH];
        bytes.copy_from_slice(&buf[pos..pos + ID_LENGTH]);
        Ok((Oid(bytes), pos + ID_LENGTH))
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{:?}", self)
    }
}

/// Value held by a reference, modeled as a tagged sum. Exactly one of
/// object-id, symbolic target, or absence applies for each variant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefValue {
    /// Tombstone marking the reference as deleted.
    Deletion,
    /// Reference to an object, not an annotated tag.
    Id(Oid),
    /// Annotated tag, along with the identifier the tag peels to.
    Tag { id: Oid, peeled: Oid },
    /// Annotated tag whose peeled identifier is not known. Such references
    /// cannot be stored; the writer refuses them.
    Unpeeled(Oid),
    /// Symbolic reference naming its target reference.
    Symref(String),
}

impl RefValue {
    /// Return the object identifier this value points to, if any.
    pub fn to_id(&self) -> Option<Oid> {
        match self {
            RefValue::Deletion | RefValue::Symref(_) => None,
            RefValue::Id(id) | RefValue::Unpeeled(id) => Some(*id),
            RefValue::Tag { id, .. } => Some(*id),
        }
    }

    /// Return the peeled identifier, applicable only for annotated tags.
    pub fn to_peeled(&self) -> Option<Oid> {
        match self {
            RefValue::Tag { peeled, .. } => Some(*peeled),
            _ => None,
        }
    }
}

/// Single reference record, the unit of the table's ref section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefRecord {
    /// Reference name, non-empty, free of NUL, not ending with `/`.
    pub name: String,
    /// Transaction that produced this record.
    pub update_index: u64,
    pub value: RefValue,
}

impl Display for RefRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "ref<{} @{}>", self.name, self.update_index)
    }
}

impl RefRecord {
    pub fn new(name: &str, update_index: u64, value: RefValue) -> RefRecord {
        RefRecord {
            name: name.to_string(),
            update_index,
            value,
        }
    }

    /// Construct a tombstone for `name`.
    pub fn deletion(name: &str, update_index: u64) -> RefRecord {
        RefRecord::new(name, update_index, RefValue::Deletion)
    }

    /// Return true if this record is a tombstone.
    pub fn is_deletion(&self) -> bool {
        matches!(self.value, RefValue::Deletion)
    }

    #[inline]
    pub fn to_update_index(&self) -> u64 {
        self.update_index
    }

    pub fn as_key(&self) -> &[u8] {
        self.name.as_bytes()
    }

    // value flavor stored in the low 3 bits of the suffix varint.
    pub(crate) fn to_kind(&self) -> Result<u8> {
        match &self.value {
            RefValue::Deletion => Ok(0),
            RefValue::Id(_) => Ok(1),
            RefValue::Tag { .. } => Ok(2),
            RefValue::Symref(_) => Ok(3),
            RefValue::Unpeeled(_) => {
                let prefix = format!("{}:{}", file!(), line!());
                let msg = format!("unpeeled annotated tag {}", self.name);
                Err(Error::PeeledRefRequired(prefix, msg))
            }
        }
    }

    pub(crate) fn encode_value(&self, min: u64, buf: &mut Vec<u8>) -> Result<()> {
        let delta = match self.update_index.checked_sub(min) {
            Some(delta) => delta,
            None => err_at!(
                Fatal, msg: "update-index {} below minimum {}", self.update_index, min
            )?,
        };
        util::encode_varint(delta, buf);

        match &self.value {
            RefValue::Deletion => (),
            RefValue::Id(id) => buf.extend_from_slice(id.as_bytes()),
            RefValue::Tag { id, peeled } => {
                buf.extend_from_slice(id.as_bytes());
                buf.extend_from_slice(peeled.as_bytes());
            }
            RefValue::Symref(target) => {
                util::encode_varint(u64::try_from(target.len()).unwrap(), buf);
                buf.extend_from_slice(target.as_bytes());
            }
            RefValue::Unpeeled(_) => self.to_kind().map(|_| ())?,
        }

        Ok(())
    }

    pub(crate) fn from_parts(
        key: &[u8],
        min: u64,
        delta: u64,
        value: RefValue,
    ) -> Result<RefRecord> {
        let name = match String::from_utf8(key.to_vec()) {
            Ok(name) => name,
            Err(err) => err_at!(FormatError, Err(err), "ref name not utf8")?,
        };
        let update_index = match min.checked_add(delta) {
            Some(val) => val,
            None => err_at!(FormatError, msg: "update-index delta {} overflows", delta)?,
        };

        Ok(RefRecord {
            name,
            update_index,
            value,
        })
    }
}

/// Identity stamped on each reflog entry.
#[derive(Clone, Debug, PartialEq, Eq, Default, Arbitrary)]
pub struct Committer {
    pub name: String,
    pub email: String,
    /// Seconds since UNIX epoch.
    pub time: u64,
    /// Timezone offset, in minutes east of UTC.
    pub tz_offset: i16,
}

impl Committer {
    pub fn new(name: &str, email: &str, time: u64, tz_offset: i16) -> Committer {
        Committer {
            name: name.to_string(),
            email: email.to_string(),
            time,
            tz_offset,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        encode_string(&self.name, buf);
        encode_string(&self.email, buf);
        util::encode_varint(self.time, buf);
        buf.extend_from_slice(&self.tz_offset.to_be_bytes());
    }

    fn decode(buf: &[u8], pos: usize) -> Result<(Committer, usize)> {
        let (name, pos) = decode_string(buf, pos)?;
        let (email, pos) = decode_string(buf, pos)?;
        let (time, pos) = util::decode_varint(buf, pos)?;
        check_remaining!(&buf[pos..], 2, "committer tz")?;
        let tz_offset = i16::from_be_bytes([buf[pos], buf[pos + 1]]);

        let val = Committer {
            name,
            email,
            time,
            tz_offset,
        };
        Ok((val, pos + 2))
    }
}

/// Single reflog record, the unit of the table's log section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    /// Reference this entry belongs to.
    pub name: String,
    /// Transaction that produced this entry.
    pub update_index: u64,
    pub old_id: Oid,
    pub new_id: Oid,
    pub who: Committer,
    pub message: String,
}

impl Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "log<{} @{}>", self.name, self.update_index)
    }
}

impl LogRecord {
    pub fn new(
        name: &str,
        update_index: u64,
        who: Committer,
        old_id: Oid,
        new_id: Oid,
        message: &str,
    ) -> LogRecord {
        LogRecord {
            name: name.to_string(),
            update_index,
            old_id,
            new_id,
            who,
            message: message.to_string(),
        }
    }

    /// Construct a tombstone marking deletion of the entry at
    /// `(name, update_index)`.
    pub fn deletion(name: &str, update_index: u64) -> LogRecord {
        LogRecord {
            name: name.to_string(),
            update_index,
            old_id: Oid::zero(),
            new_id: Oid::zero(),
            who: Committer::default(),
            message: String::default(),
        }
    }

    /// Return true if this entry is a log tombstone.
    pub fn is_deletion(&self) -> bool {
        self.old_id.is_zero() && self.new_id.is_zero() && self.message.is_empty()
    }

    #[inline]
    pub fn to_update_index(&self) -> u64 {
        self.update_index
    }

    pub fn to_key(&self) -> Vec<u8> {
        log_key(&self.name, self.update_index)
    }

    pub(crate) fn encode_value(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.old_id.as_bytes());
        buf.extend_from_slice(self.new_id.as_bytes());
        self.who.encode(buf);
        encode_string(&self.message, buf);
    }

    pub(crate) fn from_parts(
        key: &[u8],
        old_id: Oid,
        new_id: Oid,
        who: Committer,
        message: String,
    ) -> Result<LogRecord> {
        let (name, update_index) = split_log_key(key)?;
        let val = LogRecord {
            name,
            update_index,
            old_id,
            new_id,
            who,
            message,
        };
        Ok(val)
    }
}

/// Compose the composite reflog key for `(name, update_index)`. The
/// update-index is stored bit-inverted so that newer entries sort first
/// within a name, and a NUL separates the parts so that a short name's
/// entries sort ahead of a longer name sharing it as a prefix.
pub fn log_key(name: &str, update_index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(name.len() + 9);
    key.extend_from_slice(name.as_bytes());
    key.push(0);
    key.extend_from_slice(&(!update_index).to_be_bytes());
    key
}

pub(crate) fn split_log_key(key: &[u8]) -> Result<(String, u64)> {
    let sep = match key.iter().position(|byte| *byte == 0) {
        Some(sep) => sep,
        None => err_at!(FormatError, msg: "log key without separator")?,
    };
    if key.len() != sep + 9 {
        err_at!(FormatError, msg: "log key length {} for name {}", key.len(), sep)?
    }

    let name = match String::from_utf8(key[..sep].to_vec()) {
        Ok(name) => name,
        Err(err) => err_at!(FormatError, Err(err), "log name not utf8")?,
    };
    let mut bytes = [0; 8];
    bytes.copy_from_slice(&key[sep + 1..]);
    Ok((name, !u64::from_be_bytes(bytes)))
}

// Object-id back-index record; key is a unique prefix of an object-id,
// value is the sorted list of ref-block positions referring to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ObjRecord {
    pub(crate) prefix: Vec<u8>,
    pub(crate) positions: Vec<u64>,
}

impl ObjRecord {
    pub(crate) fn encode_value(&self, buf: &mut Vec<u8>) {
        encode_positions(&self.positions, buf)
    }
}

// Index-pointer record; key is the last record key of the pointed subtree,
// value is the absolute file offset of the pointed block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct IndexEntry {
    pub(crate) key: Vec<u8>,
    pub(crate) offset: u64,
}

// Decoded value portion of a record, discriminated by the section it was
// read from.
#[derive(Clone, Debug)]
pub(crate) enum Payload {
    Ref { delta: u64, value: RefValue },
    Log {
        old_id: Oid,
        new_id: Oid,
        who: Committer,
        message: String,
    },
    Obj { positions: Vec<u64> },
    Index { offset: u64 },
}

// Decode the value portion of a record, returning the payload and the
// position immediately after it. The value length is implied by the
// section's layout, there is no stored length.
pub(crate) fn decode_payload(
    block_type: u8,
    kind: u8,
    buf: &[u8],
    pos: usize,
) -> Result<(Payload, usize)> {
    match block_type {
        block::BLOCK_REF => {
            let (delta, pos) = util::decode_varint(buf, pos)?;
            let (value, pos) = match kind {
                0 => (RefValue::Deletion, pos),
                1 => {
                    let (id, pos) = Oid::decode(buf, pos)?;
                    (RefValue::Id(id), pos)
                }
                2 => {
                    let (id, pos) = Oid::decode(buf, pos)?;
                    let (peeled, pos) = Oid::decode(buf, pos)?;
                    (RefValue::Tag { id, peeled }, pos)
                }
                3 => {
                    let (target, pos) = decode_string(buf, pos)?;
                    (RefValue::Symref(target), pos)
                }
                kind => err_at!(FormatError, msg: "bad ref value kind {}", kind)?,
            };
            Ok((Payload::Ref { delta, value }, pos))
        }
        block::BLOCK_LOG => {
            let (old_id, pos) = Oid::decode(buf, pos)?;
            let (new_id, pos) = Oid::decode(buf, pos)?;
            let (who, pos) = Committer::decode(buf, pos)?;
            let (message, pos) = decode_string(buf, pos)?;
            let val = Payload::Log {
                old_id,
                new_id,
                who,
                message,
            };
            Ok((val, pos))
        }
        block::BLOCK_OBJ => {
            let (positions, pos) = decode_positions(buf, pos)?;
            Ok((Payload::Obj { positions }, pos))
        }
        block::BLOCK_INDEX => {
            let (offset, pos) = util::decode_varint(buf, pos)?;
            Ok((Payload::Index { offset }, pos))
        }
        block_type => err_at!(FormatError, msg: "bad block type {}", block_type),
    }
}

/// Verify a reference name at the API boundary: non-empty, free of NUL and
/// not ending with `/`.
pub fn validate_ref_name(name: &str) -> Result<()> {
    if name.is_empty() {
        err_at!(ContractError, msg: "empty ref name")
    } else if name.as_bytes().contains(&0) {
        err_at!(ContractError, msg: "ref name {:?} embeds NUL", name)
    } else if name.ends_with('/') {
        err_at!(ContractError, msg: "ref name {:?} ends with /", name)
    } else {
        Ok(())
    }
}

fn encode_string(val: &str, buf: &mut Vec<u8>) {
    util::encode_varint(u64::try_from(val.len()).unwrap(), buf);
    buf.extend_from_slice(val.as_bytes());
}

fn decode_string(buf: &[u8], pos: usize) -> Result<(String, usize)> {
    let (len, pos) = util::decode_varint(buf, pos)?;
    let len = err_at!(FailConvert, usize::try_from(len))?;
    check_remaining!(&buf[pos..], len, "string")?;
    match String::from_utf8(buf[pos..pos + len].to_vec()) {
        Ok(val) => Ok((val, pos + len)),
        Err(err) => err_at!(FormatError, Err(err), "string not utf8"),
    }
}

// positions are stored as a varint count followed by delta-encoded varints.
fn encode_positions(positions: &[u64], buf: &mut Vec<u8>) {
    util::encode_varint(u64::try_from(positions.len()).unwrap(), buf);
    let mut prev = 0;
    for pos in positions.iter() {
        util::encode_varint(pos - prev, buf);
        prev = *pos;
    }
}

fn decode_positions(buf: &[u8], mut pos: usize) -> Result<(Vec<u64>, usize)> {
    let (count, p) = util::decode_varint(buf, pos)?;
    pos = p;

    let count = err_at!(FailConvert, usize::try_from(count))?;
    let mut positions = Vec::with_capacity(count);
    let mut prev = 0;
    for _ in 0..count {
        let (delta, p) = util::decode_varint(buf, pos)?;
        pos = p;
        prev += delta;
        positions.push(prev);
    }
    Ok((positions, pos))
}

#[cfg(test)]
#[path = "record_test.rs"]
mod record_test;
