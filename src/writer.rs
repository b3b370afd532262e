//! Chunked aggregation writer: buffer batches up to a byte budget, then append
//! each subreddit's rows to its partition in one operation per flush.

use crate::config::HarvestOptions;
use crate::fetch::{BatchSource, StreamState};
use crate::mem::is_low_memory;
use crate::record::{estimated_batch_bytes, Record, RecordBatch};
use crate::store::{KeyRegistry, PartitionKey, PartitionSink};
use anyhow::{anyhow, Result};
use rayon::prelude::*;
use std::collections::BTreeMap;

#[derive(Clone, Debug)]
pub struct WriterOptions {
    /// Flush once the buffered estimate is strictly above this.
    pub memory_budget_bytes: u64,
    pub drop_pinned: bool,
    pub parallel_flush: bool,
    /// Also flush when available system RAM drops below this fraction.
    pub low_memory_flush: Option<f64>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self::from(&HarvestOptions::default())
    }
}

impl From<&HarvestOptions> for WriterOptions {
    fn from(o: &HarvestOptions) -> Self {
        Self {
            memory_budget_bytes: o.memory_budget_bytes,
            drop_pinned: o.drop_pinned,
            parallel_flush: o.parallel_flush,
            low_memory_flush: o.low_memory_flush,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub batches: u64,
    pub records: u64,
    pub dropped_pinned: u64,
    pub flushes: u64,
    pub appends: u64,
}

/// What one flush wrote: `(subreddit, rows)` per partition, ordered by subreddit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlushReport {
    pub records: usize,
    pub partitions: Vec<(String, usize)>,
}

pub struct ChunkedWriter<'a, S: PartitionSink + ?Sized> {
    sink: &'a S,
    opts: WriterOptions,
    buffer: Vec<RecordBatch>,
    buffered_bytes: u64,
    registry: KeyRegistry,
    stats: WriterStats,
}

impl<'a, S: PartitionSink + ?Sized> ChunkedWriter<'a, S> {
    pub fn new(sink: &'a S, opts: WriterOptions) -> Result<Self> {
        let registry = KeyRegistry::from_existing(sink.existing_partitions()?);
        Ok(Self { sink, opts, buffer: Vec::new(), buffered_bytes: 0, registry, stats: WriterStats::default() })
    }

    /// Estimated size of what is waiting to be flushed.
    pub fn buffered_bytes(&self) -> u64 {
        self.buffered_bytes
    }

    pub fn buffered_records(&self) -> usize {
        self.buffer.iter().map(Vec::len).sum()
    }

    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }

    /// Buffer one batch; flushes when the budget is exceeded.
    pub fn push(&mut self, mut batch: RecordBatch) -> Result<Option<FlushReport>> {
        self.stats.batches += 1;
        if self.opts.drop_pinned {
            let before = batch.len();
            batch.retain(|r| !r.stickied);
            self.stats.dropped_pinned += (before - batch.len()) as u64;
        }
        if batch.is_empty() {
            return Ok(None);
        }
        self.stats.records += batch.len() as u64;
        self.buffered_bytes += estimated_batch_bytes(&batch);
        self.buffer.push(batch);

        let over_budget = self.buffered_bytes > self.opts.memory_budget_bytes;
        let low_mem = self.opts.low_memory_flush.is_some_and(is_low_memory);
        if over_budget || low_mem {
            if low_mem && !over_budget {
                tracing::warn!("system memory low, flushing {} buffered bytes early", self.buffered_bytes);
            }
            return self.flush();
        }
        Ok(None)
    }

    /// Drain the whole buffer: one append per subreddit present.
    ///
    /// Partitions that fail keep their rows in the buffer (the others are not
    /// written twice) and the call returns an error naming them.
    pub fn flush(&mut self) -> Result<Option<FlushReport>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let mut groups: BTreeMap<String, Vec<Record>> = BTreeMap::new();
        for batch in self.buffer.drain(..) {
            for r in batch {
                groups.entry(r.subreddit.clone()).or_default().push(r);
            }
        }

        let mut keyed: Vec<(PartitionKey, Vec<Record>)> = Vec::with_capacity(groups.len());
        let mut unresolved: Vec<Vec<Record>> = Vec::new();
        let mut collision = None;
        for (subreddit, rows) in groups {
            if collision.is_some() {
                unresolved.push(rows);
                continue;
            }
            match self.registry.resolve(&subreddit) {
                Ok(key) => keyed.push((key, rows)),
                Err(e) => {
                    collision = Some(e);
                    unresolved.push(rows);
                }
            }
        }
        if let Some(e) = collision {
            // Nothing has been appended yet; keep every row and abort.
            self.buffer.extend(keyed.into_iter().map(|(_, rows)| rows));
            self.buffer.extend(unresolved);
            self.buffered_bytes = self.buffer.iter().map(|b| estimated_batch_bytes(b)).sum();
            return Err(e.into());
        }

        let sink = self.sink;
        let results: Vec<Result<()>> = if self.opts.parallel_flush {
            keyed.par_iter().map(|(key, rows)| sink.append(key, rows)).collect()
        } else {
            keyed.iter().map(|(key, rows)| sink.append(key, rows)).collect()
        };

        let mut report = FlushReport { records: 0, partitions: Vec::with_capacity(keyed.len()) };
        let mut failed: Vec<String> = Vec::new();
        for ((key, rows), res) in keyed.into_iter().zip(results) {
            match res {
                Ok(()) => {
                    self.stats.appends += 1;
                    report.records += rows.len();
                    report.partitions.push((key.subreddit, rows.len()));
                }
                Err(e) => {
                    tracing::error!("r/{}: append of {} rows failed: {:#}", key.subreddit, rows.len(), e);
                    failed.push(key.subreddit);
                    self.buffer.push(rows);
                }
            }
        }
        self.buffered_bytes = self.buffer.iter().map(|b| estimated_batch_bytes(b)).sum();
        self.stats.flushes += 1;
        tracing::info!(
            "flushed {} records into {} partitions",
            report.records,
            report.partitions.len()
        );

        if !failed.is_empty() {
            return Err(anyhow!("flush failed for {} partition(s): {}", failed.len(), failed.join(", ")));
        }
        Ok(Some(report))
    }

    /// Flush whatever is left and return the run totals.
    pub fn finish(mut self) -> Result<WriterStats> {
        self.flush()?;
        Ok(self.stats)
    }
}

/// Drain `source` into `sink` through a [`ChunkedWriter`].
///
/// The tail is flushed when the source reports `Exhausted`. If the source fails
/// midway, what was buffered is still flushed before the error is returned.
pub fn write_stream<S: PartitionSink + ?Sized>(
    source: &mut dyn BatchSource,
    sink: &S,
    opts: WriterOptions,
) -> Result<WriterStats> {
    let mut writer = ChunkedWriter::new(sink, opts)?;
    loop {
        match source.next_batch() {
            Ok(StreamState::Active(batch)) => {
                writer.push(batch)?;
            }
            Ok(StreamState::Exhausted) => break,
            Err(e) => {
                if let Err(fe) = writer.flush() {
                    tracing::error!("could not flush buffered records after source failure: {:#}", fe);
                }
                return Err(e);
            }
        }
    }
    writer.finish()
}
