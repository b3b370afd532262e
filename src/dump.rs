//! JSON-lines submission dumps (plain or `.zst`) read as a batch stream.

use crate::fetch::{BatchSource, StreamState};
use crate::record::{Record, RecordBatch};
use crate::util::{create_with_backoff, open_with_backoff};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use zstd::stream::read::Decoder;

/// Reads a dump one line at a time and hands out typed batches of `chunk_size`.
/// Lines that are not JSON or do not fit [`Record`] are counted and skipped.
pub struct DumpReader {
    path: PathBuf,
    rdr: Box<dyn BufRead + Send>,
    chunk_size: usize,
    line_no: u64,
    quarantined: u64,
    records: u64,
    done: bool,
}

impl DumpReader {
    pub fn open(path: &Path, chunk_size: usize) -> Result<Self> {
        let file = open_with_backoff(path, 16, 50).with_context(|| format!("open {}", path.display()))?;
        let is_zst = path.extension().and_then(|e| e.to_str()).is_some_and(|e| e.eq_ignore_ascii_case("zst"));
        let rdr: Box<dyn BufRead + Send> = if is_zst {
            let mut decoder = Decoder::new(file)?;
            // Firehose dumps are compressed with long windows.
            decoder.window_log_max(31)?;
            Box::new(BufReader::with_capacity(1 << 20, decoder))
        } else {
            Box::new(BufReader::with_capacity(1 << 20, file))
        };
        Ok(Self {
            path: path.to_path_buf(),
            rdr,
            chunk_size: chunk_size.max(1),
            line_no: 0,
            quarantined: 0,
            records: 0,
            done: false,
        })
    }

    /// Lines skipped so far because they did not parse.
    pub fn quarantined(&self) -> u64 {
        self.quarantined
    }

    /// Records handed out so far.
    pub fn records(&self) -> u64 {
        self.records
    }
}

impl BatchSource for DumpReader {
    fn next_batch(&mut self) -> Result<StreamState> {
        if self.done {
            return Ok(StreamState::Exhausted);
        }
        let mut batch: RecordBatch = Vec::with_capacity(self.chunk_size);
        let mut buf = String::with_capacity(4 * 1024);
        while batch.len() < self.chunk_size {
            buf.clear();
            let n = self
                .rdr
                .read_line(&mut buf)
                .with_context(|| format!("{} line {}", self.path.display(), self.line_no + 1))?;
            if n == 0 {
                self.done = true;
                break;
            }
            self.line_no += 1;
            let line = buf.trim();
            if line.is_empty() {
                continue;
            }
            let parsed = serde_json::from_str::<serde_json::Value>(line)
                .map_err(|e| e.to_string())
                .and_then(|v| Record::from_value(&v).map_err(|e| e.to_string()));
            match parsed {
                Ok(r) => batch.push(r),
                Err(e) => {
                    self.quarantined += 1;
                    tracing::warn!("{} line {}: skipped ({})", self.path.display(), self.line_no, e);
                }
            }
        }
        if batch.is_empty() {
            tracing::info!(
                "{}: {} records read, {} lines quarantined",
                self.path.display(),
                self.records,
                self.quarantined
            );
            return Ok(StreamState::Exhausted);
        }
        self.records += batch.len() as u64;
        Ok(StreamState::Active(batch))
    }
}

/// Submissions per subreddit in a dump. When `savefile` is given the counts are
/// also written there as headerless `subreddit,count` rows.
pub fn count_subreddits(dump: &Path, chunk_size: usize, savefile: Option<&Path>) -> Result<BTreeMap<String, u64>> {
    let mut reader = DumpReader::open(dump, chunk_size)?;
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    while let StreamState::Active(batch) = reader.next_batch()? {
        for r in batch {
            *counts.entry(r.subreddit).or_insert(0) += 1;
        }
    }
    tracing::info!("{}: {} subreddits, {} submissions", dump.display(), counts.len(), reader.records());

    if let Some(out) = savefile {
        let f = create_with_backoff(out, 16, 50).with_context(|| format!("create {}", out.display()))?;
        let mut w = BufWriter::new(f);
        for (sub, n) in &counts {
            writeln!(w, "{sub},{n}")?;
        }
        w.flush()?;
    }
    Ok(counts)
}
