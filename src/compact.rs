//! Module implement compaction: merging a chronologically ordered stack
//! of tables into one physical table.

use log::info;

use std::ffi;

use crate::{
    merge::MergedReader,
    reader::Reader,
    source::BlockSource,
    writer::{Config, Stats, Writer},
    Error, Result,
};

/// Statistics published after a compaction, the sealed table's writer
/// statistics along with input/output record counts.
#[derive(Clone, Default, Debug)]
pub struct CompactStats {
    /// Writer statistics of the compacted table.
    pub stats: Stats,
    /// Number of input tables merged.
    pub n_tables: usize,
    /// Reference records consumed across the inputs.
    pub n_input_refs: u64,
    /// Log records consumed across the inputs.
    pub n_input_logs: u64,
    /// Reference tombstones pruned from the output.
    pub n_dropped_refs: u64,
    /// Log tombstones pruned from the output.
    pub n_dropped_logs: u64,
}

/// Merge N readers into one table, applying last-writer-wins semantics.
///
/// The output covers the update-index range `[min over inputs, max over
/// inputs]`. By default tombstones, and the log entries marking deleted
/// history, are pruned; enable [Compactor::set_include_deletes] to carry
/// them into the output, which matters when the compacted table does not
/// reach to the bottom of a stack.
pub struct Compactor {
    config: Config,
    include_deletes: bool,
}

impl Compactor {
    pub fn new(config: Config) -> Compactor {
        Compactor {
            config,
            include_deletes: false,
        }
    }

    /// Keep tombstones in the compacted output.
    pub fn set_include_deletes(&mut self, include_deletes: bool) -> &mut Self {
        self.include_deletes = include_deletes;
        self
    }

    /// Compact `readers`, ordered oldest to newest, into a fresh table
    /// file at `loc`.
    pub fn compact<S>(&self, readers: Vec<Reader<S>>, loc: &ffi::OsStr) -> Result<CompactStats>
    where
        S: BlockSource,
    {
        let mut writer = Writer::create(self.config.clone(), loc)?;
        self.run(readers, &mut writer)
    }

    /// Compact `readers`, ordered oldest to newest, into an in-memory
    /// table.
    pub fn compact_to_bytes<S>(
        &self,
        readers: Vec<Reader<S>>,
    ) -> Result<(Vec<u8>, CompactStats)>
    where
        S: BlockSource,
    {
        let mut writer = Writer::in_memory(self.config.clone());
        let stats = self.run(readers, &mut writer)?;
        match writer.into_bytes() {
            Some(data) => Ok((data, stats)),
            None => err_at!(Fatal, msg: "in-memory writer yielded no table"),
        }
    }

    // two sequential merge passes, refs then logs, through one writer.
    fn run<S>(&self, readers: Vec<Reader<S>>, writer: &mut Writer) -> Result<CompactStats>
    where
        S: BlockSource,
    {
        if readers.is_empty() {
            err_at!(ContractError, msg: "no tables to compact")?
        }
        let n_tables = readers.len();

        let mut merged = MergedReader::new(readers)?;
        merged.set_include_deletes(true);

        let min = merged.to_min_update_index().unwrap_or(0);
        let max = merged.to_max_update_index().unwrap_or(0);
        writer.begin(min, max)?;

        let mut val = CompactStats {
            n_tables,
            ..CompactStats::default()
        };

        {
            let mut cursor = merged.all_refs()?;
            while let Some(r) = cursor.next() {
                let r = r?;
                if r.is_deletion() && !self.include_deletes {
                    val.n_dropped_refs += 1;
                    continue;
                }
                writer.write_ref(&r)?;
            }
            val.n_input_refs = cursor.to_n_pulled();
        }

        {
            let mut cursor = merged.all_logs()?;
            while let Some(l) = cursor.next() {
                let l = l?;
                if l.is_deletion() && !self.include_deletes {
                    val.n_dropped_logs += 1;
                    continue;
                }
                writer.write_log(&l)?;
            }
            val.n_input_logs = cursor.to_n_pulled();
        }

        val.stats = writer.finish()?;

        info!(
            target: "reftable",
            "compacted {} tables into {} bytes, {}/{} refs {}/{} logs",
            val.n_tables, val.stats.total_bytes,
            val.stats.n_refs, val.n_input_refs,
            val.stats.n_logs, val.n_input_logs
        );

        Ok(val)
    }
}

#[cfg(test)]
#[path = "compact_test.rs"]
mod compact_test;
