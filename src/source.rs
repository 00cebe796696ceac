//! Module implement random access over the bytes of a sealed table.

use fs2::FileExt;

use std::{
    cmp,
    convert::TryFrom,
    ffi, fs,
    io::{self, Read, Seek},
    sync::Mutex,
};

use crate::{read_file, Error, Result};

/// Random access over a byte range with an effective size. Implementations
/// must be safe for concurrent reads; distinct cursors over the same table
/// may be advanced from different threads.
pub trait BlockSource {
    /// Effective size of the table, in bytes.
    fn size(&self) -> Result<u64>;

    /// Read `n` bytes starting at `pos`. Reads past the effective size are
    /// clamped; a read entirely past it returns an empty buffer.
    fn read(&self, pos: u64, n: usize) -> Result<Vec<u8>>;
}

/// Block source backed by an in-memory buffer, the canonical source for
/// tables sealed via [crate::Writer::into_bytes].
pub struct BufSource {
    data: Vec<u8>,
}

impl From<Vec<u8>> for BufSource {
    fn from(data: Vec<u8>) -> BufSource {
        BufSource { data }
    }
}

impl BufSource {
    pub fn new(data: Vec<u8>) -> BufSource {
        BufSource { data }
    }
}

impl BlockSource for BufSource {
    fn size(&self) -> Result<u64> {
        Ok(err_at!(FailConvert, u64::try_from(self.data.len()))?)
    }

    fn read(&self, pos: u64, n: usize) -> Result<Vec<u8>> {
        let pos = err_at!(FailConvert, usize::try_from(pos))?;
        let till = cmp::min(pos.saturating_add(n), self.data.len());
        match pos <= self.data.len() {
            true => Ok(self.data[pos..till].to_vec()),
            false => Ok(Vec::default()),
        }
    }
}

/// Block source backed by a file, shared-locked for the lifetime of this
/// value.
pub struct FileSource {
    loc: ffi::OsString,
    fd: Mutex<fs::File>,
    size: u64,
}

impl Drop for FileSource {
    fn drop(&mut self) {
        let fd = self.fd.get_mut().unwrap();
        if let Err(err) = fd.unlock() {
            panic!("fail to unlock read lock for {:?}: {}", self.loc, err)
        }
    }
}

impl FileSource {
    /// Open table file `loc` for reading, holding a shared lock on it.
    pub fn open(loc: &ffi::OsStr) -> Result<FileSource> {
        let fd = crate::util::open_file_r(loc)?;
        err_at!(IOError, fd.lock_shared(), "fail read lock for {:?}", loc)?;
        let size = err_at!(IOError, fd.metadata())?.len();

        Ok(FileSource {
            loc: loc.to_os_string(),
            fd: Mutex::new(fd),
            size,
        })
    }

    pub fn to_location(&self) -> ffi::OsString {
        self.loc.clone()
    }
}

impl BlockSource for FileSource {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn read(&self, pos: u64, n: usize) -> Result<Vec<u8>> {
        let till = cmp::min(pos.saturating_add(u64::try_from(n).unwrap()), self.size);
        let n = usize::try_from(till.saturating_sub(pos)).unwrap();
        if n == 0 {
            return Ok(Vec::default());
        }

        let mut fd = match self.fd.lock() {
            Ok(fd) => fd,
            Err(err) => err_at!(Fatal, msg: "poisoned file lock: {}", err)?,
        };
        read_file!(fd, io::SeekFrom::Start(pos), n, "reading table block")
    }
}

#[cfg(test)]
#[path = "source_test.rs"]
mod source_test;
