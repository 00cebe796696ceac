//! Module implement the writer's output sink.

use fs2::FileExt;

use std::{convert::TryFrom, ffi, fs, mem};

use crate::{util, write_file, Error, Result};

/// Default channel queue size holding blocks on their way to disk.
pub const FLUSH_QUEUE_SIZE: usize = 64;

/// Output sink for a [crate::Writer]. The `File` variant owns an
/// append-only file fed through a background flush thread; the `Buffer`
/// variant accumulates the table in memory so callers can seal to bytes
/// and write-then-rename on their own terms.
pub enum Flusher {
    File {
        loc: ffi::OsString,
        fpos: u64,
        th: Option<util::Thread<Vec<u8>, u64, Result<u64>>>,
        tx: Option<util::thread::Tx<Vec<u8>, u64>>,
    },
    Buffer {
        buf: Vec<u8>,
    },
    None,
}

impl Drop for Flusher {
    fn drop(&mut self) {
        match self {
            Flusher::None | Flusher::Buffer { .. } => (),
            Flusher::File { tx, .. } => mem::drop(tx.take()),
        }
    }
}

impl Flusher {
    /// Create a flusher thread appending to a fresh file at `loc`.
    pub fn new(loc: &ffi::OsStr, chan_size: usize) -> Result<Flusher> {
        let fd = util::create_file_a(loc)?;

        let ffpp = loc.to_os_string();
        let (th, tx) = {
            let th = util::Thread::new_sync(
                "reftable-flusher",
                chan_size,
                move |rx: util::thread::Rx<Vec<u8>, u64>| move || thread_flush(ffpp, fd, rx),
            );
            let tx = th.to_tx();
            (th, tx)
        };

        let val = Flusher::File {
            loc: loc.to_os_string(),
            fpos: 0,
            th: Some(th),
            tx: Some(tx),
        };

        Ok(val)
    }

    /// Create a flusher accumulating the table in memory.
    pub fn buffer() -> Flusher {
        Flusher::Buffer {
            buf: Vec::default(),
        }
    }

    /// Create an empty flusher, for writers that shall never be driven.
    pub fn empty() -> Flusher {
        Flusher::None
    }

    pub fn to_location(&self) -> Option<ffi::OsString> {
        match self {
            Flusher::File { loc, .. } => Some(loc.clone()),
            Flusher::Buffer { .. } | Flusher::None => None,
        }
    }

    // return the latest file position.
    pub fn to_fpos(&self) -> Option<u64> {
        match self {
            Flusher::File { fpos, .. } => Some(*fpos),
            Flusher::Buffer { buf } => Some(u64::try_from(buf.len()).unwrap()),
            Flusher::None => None,
        }
    }

    // flush data, the file variant only batches data.
    pub fn flush(&mut self, data: Vec<u8>) -> Result<()> {
        match self {
            Flusher::File { fpos, tx, .. } => {
                *fpos = tx.as_ref().unwrap().request(data)?
            }
            Flusher::Buffer { buf } => buf.extend_from_slice(&data),
            Flusher::None => (),
        };
        Ok(())
    }

    // close this flusher, after syncing data to disk, and return the
    // number of bytes sealed.
    pub fn close(&mut self) -> Result<u64> {
        match self {
            Flusher::File { tx, th, .. } => {
                mem::drop(tx.take());
                match th.take() {
                    Some(th) => th.join()?,
                    None => Ok(0),
                }
            }
            Flusher::Buffer { buf } => Ok(err_at!(FailConvert, u64::try_from(buf.len()))?),
            Flusher::None => Ok(0),
        }
    }

    // take the in-memory table, applicable for the buffer variant.
    pub(crate) fn into_bytes(mut self) -> Option<Vec<u8>> {
        match &mut self {
            Flusher::Buffer { buf } => Some(mem::take(buf)),
            Flusher::File { .. } | Flusher::None => None,
        }
    }
}

fn thread_flush(
    loc: ffi::OsString,
    mut fd: fs::File,
    rx: util::thread::Rx<Vec<u8>, u64>,
) -> Result<u64> {
    err_at!(IOError, fd.lock_shared(), "fail read lock for {:?}", loc)?;

    let mut fpos = 0;
    for (data, res_tx) in rx {
        write_file!(fd, &data, &loc, "flushing table")?;

        fpos += u64::try_from(data.len()).unwrap();
        if let Some(tx) = res_tx {
            tx.send(fpos).ok();
        }
    }

    err_at!(IOError, fd.sync_all(), "fail sync_all {:?}", loc)?;
    err_at!(IOError, fd.unlock(), "fail read unlock {:?}", loc)?;

    Ok(fpos)
}

#[cfg(test)]
#[path = "flush_test.rs"]
mod flush_test;
