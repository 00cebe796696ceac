//! Reftable is an immutable, seekable, append-friendly table format for
//! storing a reference database (named pointers to object identifiers)
//! together with its reflog (per-reference history of updates).
//!
//! Use [Writer] type to build a new table from a sorted stream of records.
//! And subsequently load the table using the [Reader] type. Reader can be
//! concurrently accessed by cloning the `Reader` instance. Once a table is
//! sealed by [Writer::finish] it is not possible to modify it. While strict
//! immutability might seem like an inconvenience, they have certain
//! advantages,
//!
//! * Tables are fully packed, hence less overhead and lesser index depth.
//! * Easy and efficient caching of blocks.
//! * Friendly for concurrent access.
//!
//! **Inventory of features**
//!
//! * Ordered full scans, exact lookups and prefix scans over references.
//! * Reverse lookups from an object identifier to the references naming it.
//! * Time-bounded reflog scans, newest entry first.
//! * Multi-level index pyramid for O(log N) seeks.
//! * Every block is CRC32 protected; reflog blocks are zlib compressed.
//! * A stack of tables can be read as one logical table via [MergedReader].
//! * A stack of tables can be physically merged into one via [Compactor],
//!   applying last-writer-wins semantics and optional tombstone pruning.
//!
//! **Building a table**
//!
//! Unlike mutable data-structures, that support `set()`, `update()` etc..
//! reftables are built from pre-sorted records. In a way each table can be
//! seen as an immutable snapshot of the reference database covering an
//! inclusive range of update-indexes. Typical workflow is,
//!
//! ```ignore
//! let mut config = Config::new();
//! config.set_block_size(4096);
//! let mut writer = Writer::in_memory(config);
//! writer.begin(1, 1)?;
//! writer.write_ref(&ref_record)?; // over and over, in name order
//! writer.write_log(&log_record)?; // over and over, in key order
//! let stats = writer.finish()?;
//! let table: Vec<u8> = writer.into_bytes().unwrap();
//! ```
//!
//! Subsequently open the table as,
//!
//! ```ignore
//! let reader = Reader::new(BufSource::new(table))?;
//! // create another concurrent reader
//! let reader2 = reader.clone();
//! ```

use std::{error, fmt, result};

/// Type alias for Result return type, used by this package.
pub type Result<T> = result::Result<T, Error>;

/// Error variants that are returned by this package's API.
///
/// Each variant carries a prefix, typically identifying the error location.
#[derive(Clone, Debug)]
pub enum Error {
    /// Malformed block or record bytes, fatal to the operation.
    FormatError(String, String),
    /// CRC or magic mismatch, the table is unusable.
    IntegrityError(String, String),
    /// Block-source failure, fatal to the current cursor or writer.
    IOError(String, String),
    /// Caller broke ordering, section or naming rules; nothing was published.
    ContractError(String, String),
    /// Configured block size cannot hold some record; carries the minimum
    /// acceptable block size.
    BlockSizeTooSmall(String, usize),
    /// Annotated-tag reference supplied without its peeled identifier.
    PeeledRefRequired(String, String),
    /// Operation is meaningless for this cursor.
    Unsupported(String, String),
    InvalidFile(String, String),
    FailConvert(String, String),
    ThreadFail(String, String),
    IPCFail(String, String),
    Fatal(String, String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        use Error::*;

        match self {
            FormatError(p, msg) => write!(f, "FormatError:{} {}", p, msg),
            IntegrityError(p, msg) => write!(f, "IntegrityError:{} {}", p, msg),
            IOError(p, msg) => write!(f, "IOError:{} {}", p, msg),
            ContractError(p, msg) => write!(f, "ContractError:{} {}", p, msg),
            BlockSizeTooSmall(p, min) => {
                write!(f, "BlockSizeTooSmall:{} minimum {}", p, min)
            }
            PeeledRefRequired(p, msg) => write!(f, "PeeledRefRequired:{} {}", p, msg),
            Unsupported(p, msg) => write!(f, "Unsupported:{} {}", p, msg),
            InvalidFile(p, msg) => write!(f, "InvalidFile:{} {}", p, msg),
            FailConvert(p, msg) => write!(f, "FailConvert:{} {}", p, msg),
            ThreadFail(p, msg) => write!(f, "ThreadFail:{} {}", p, msg),
            IPCFail(p, msg) => write!(f, "IPCFail:{} {}", p, msg),
            Fatal(p, msg) => write!(f, "Fatal:{} {}", p, msg),
        }
    }
}

impl error::Error for Error {}

#[macro_export]
macro_rules! err_at {
    ($v:ident, msg: $($arg:expr),+) => {{
        let prefix = format!("{}:{}", file!(), line!());
        Err(Error::$v(prefix, format!($($arg),+)))
    }};
    ($v:ident, $e:expr) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                Err(Error::$v(prefix, format!("{}", err)))
            }
        }
    }};
    ($v:ident, $e:expr, $($arg:expr),+) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                let msg = format!($($arg),+);
                Err(Error::$v(prefix, format!("{} {}", err, msg)))
            }
        }
    }};
}

mod util;

mod block;
mod cache;
mod compact;
mod cursor;
mod flush;
mod merge;
mod reader;
mod record;
mod source;
mod writer;

pub use crate::block::RESTART_INTERVAL;
pub use crate::compact::{CompactStats, Compactor};
pub use crate::cursor::{LogCursor, ObjCursor, RefCursor};
pub use crate::flush::{Flusher, FLUSH_QUEUE_SIZE};
pub use crate::merge::{MergedLogCursor, MergedRefCursor, MergedReader};
pub use crate::reader::{Reader, TableInfo};
pub use crate::record::{Committer, LogRecord, Oid, RefRecord, RefValue, ID_LENGTH};
pub use crate::source::{BlockSource, BufSource, FileSource};
pub use crate::writer::{Config, Stats, Writer, BLOCK_SIZE, MAX_INDEX_LEVELS};

/// Magic bytes opening the file header and the footer.
pub const MAGIC: [u8; 4] = [b'R', b'E', b'F', b'T'];

/// On-disk format version implemented by this package.
pub const VERSION: u8 = 1;

/// Size of the file header, in bytes.
pub const HEADER_SIZE: usize = 24;

/// Size of the file footer, in bytes.
pub const FOOTER_SIZE: usize = 68;

/// Number of symbolic-reference hops [MergedReader::resolve] shall follow
/// before giving up and returning an absent value.
pub const MAX_SYMREF_DEPTH: usize = 5;
