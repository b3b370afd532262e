//! End-to-end harvest operations built from the fetcher, the enricher, the flat
//! file writer and the chunked archive writer.

use crate::cancel::CancelToken;
use crate::config::HarvestOptions;
use crate::date::{format_day, year_bounds};
use crate::dump::DumpReader;
use crate::enrich::Enricher;
use crate::fetch::{BatchSource, CursorFetcher, StreamState};
use crate::flat::{append_records, read_flat_file, write_records};
use crate::lookup::LookupApi;
use crate::record::Record;
use crate::retry::{Sleeper, ThreadSleeper};
use crate::search::SearchApi;
use crate::store::PartitionSink;
use crate::util::init_tracing_once;
use crate::writer::{write_stream, WriterOptions, WriterStats};
use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Submissions between two operator log lines of a flat-file harvest.
const LOG_EVERY: u64 = 100_000;
/// Page size of the flat-file harvest, matching one lookup batch per page.
const CSV_PAGE_SIZE: usize = 100;

/// Entry point for harvest runs. Holds the remote endpoints by reference so a
/// caller (or a test) keeps ownership of its clients.
#[derive(Clone)]
pub struct Harvester<'a> {
    opts: HarvestOptions,
    search: &'a dyn SearchApi,
    lookup: Option<&'a dyn LookupApi>,
    sleeper: Arc<dyn Sleeper>,
    cancel: CancelToken,
}

impl<'a> Harvester<'a> {
    pub fn new(search: &'a dyn SearchApi) -> Self {
        Self {
            opts: HarvestOptions::default(),
            search,
            lookup: None,
            sleeper: Arc::new(ThreadSleeper),
            cancel: CancelToken::default(),
        }
    }

    // -------- Builder methods --------
    pub fn options(mut self, opts: HarvestOptions) -> Self { self.opts = opts; self }
    pub fn lookup(mut self, api: &'a dyn LookupApi) -> Self { self.lookup = Some(api); self }
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self { self.sleeper = sleeper; self }
    pub fn cancel_token(mut self, cancel: CancelToken) -> Self { self.cancel = cancel; self }
    pub fn page_size(mut self, n: usize) -> Self { self.opts = self.opts.with_page_size(n); self }
    pub fn memory_budget_mb(mut self, mb: f64) -> Self { self.opts = self.opts.with_memory_budget_mb(mb); self }
    pub fn drop_pinned(mut self, yes: bool) -> Self { self.opts = self.opts.with_drop_pinned(yes); self }
    pub fn parallel_flush(mut self, yes: bool) -> Self { self.opts = self.opts.with_parallel_flush(yes); self }
    pub fn backoff(mut self, d: Duration) -> Self { self.opts.retry.backoff = d; self }
    pub fn max_attempts(mut self, n: Option<u32>) -> Self { self.opts.retry.max_attempts = n; self }
    pub fn progress(mut self, yes: bool) -> Self { self.opts = self.opts.with_progress(yes); self }

    pub fn opts(&self) -> &HarvestOptions {
        &self.opts
    }

    /// A fetch session over `[lower, upper)` sharing this harvester's sleeper and cancel token.
    pub fn fetch(&self, subreddit: &str, lower: i64, upper: Option<i64>) -> Result<CursorFetcher<&'a dyn SearchApi>> {
        self.fetch_with(&self.opts, subreddit, lower, upper)
    }

    fn fetch_with(
        &self,
        opts: &HarvestOptions,
        subreddit: &str,
        lower: i64,
        upper: Option<i64>,
    ) -> Result<CursorFetcher<&'a dyn SearchApi>> {
        let fetcher = CursorFetcher::new(self.search, subreddit, lower, upper, opts)?
            .with_sleeper(self.sleeper.clone())
            .with_cancel(self.cancel.clone());
        Ok(fetcher)
    }

    /// `None` when no lookup endpoint was configured; records then keep crawl-time values.
    pub fn enricher(&self) -> Option<Enricher<&'a dyn LookupApi>> {
        self.lookup.map(|api| {
            Enricher::new(api, &self.opts).with_sleeper(self.sleeper.clone()).with_cancel(self.cancel.clone())
        })
    }

    /// Every record of `subreddit` in `[lower, upper)`, newest first, as crawled.
    pub fn download_posts(&self, subreddit: &str, lower: i64, upper: Option<i64>) -> Result<Vec<Record>> {
        init_tracing_once();
        let mut fetcher = self.fetch(subreddit, lower, upper)?;
        let mut out = Vec::new();
        while let StreamState::Active(mut batch) = fetcher.next_page()? {
            out.append(&mut batch);
        }
        tracing::info!("r/{}: downloaded {} submissions in {} requests", subreddit, out.len(), fetcher.requests());
        Ok(out)
    }

    /// Page-by-page harvest into a flat file: fetch, enrich, append, repeat.
    /// Returns the number of records written.
    pub fn download_csv(&self, subreddit: &str, save_file: &Path, lower: i64, upper: Option<i64>) -> Result<u64> {
        init_tracing_once();
        let opts = self.opts.clone().with_page_size(CSV_PAGE_SIZE);
        let mut fetcher = self.fetch_with(&opts, subreddit, lower, upper)?;
        let enricher = self.enricher();
        if enricher.is_none() {
            tracing::warn!("no lookup credentials configured; writing crawl-time scores");
        }

        let mut written: u64 = 0;
        let mut next_log = LOG_EVERY;
        while let StreamState::Active(mut batch) = fetcher.next_page()? {
            if let Some(e) = &enricher {
                e.enrich_page(&mut batch)?;
            }
            append_records(save_file, &batch)?;
            written += batch.len() as u64;
            if written >= next_log {
                tracing::info!(
                    "r/{}: {} submissions written, reached {}",
                    subreddit,
                    written,
                    format_day(fetcher.cursor())
                );
                next_log += LOG_EVERY;
            }
        }
        if let Some(e) = &enricher {
            e.finish();
        }
        tracing::info!("r/{}: {} submissions written to {}", subreddit, written, save_file.display());
        Ok(written)
    }

    /// One `<folder>/<subreddit>_<year>.csv` per subreddit and year, overwritten.
    pub fn save_posts_year(&self, subreddits: &[String], years: &[i32], folder: &Path) -> Result<Vec<PathBuf>> {
        init_tracing_once();
        std::fs::create_dir_all(folder).with_context(|| format!("create {}", folder.display()))?;
        let enricher = self.enricher();
        let mut out = Vec::with_capacity(subreddits.len() * years.len());
        for sub in subreddits {
            for &year in years {
                if self.cancel.is_cancelled() {
                    tracing::warn!("cancelled before r/{} {}", sub, year);
                    return Ok(out);
                }
                let (lower, upper) = year_bounds(year)?;
                let mut records = self.download_posts(sub, lower, Some(upper))?;
                if let Some(e) = &enricher {
                    e.enrich(&mut records)?;
                }
                let path = year_file(folder, sub, year);
                write_records(&path, &records)?;
                tracing::info!("r/{} {}: {} submissions -> {}", sub, year, records.len(), path.display());
                out.push(path);
            }
        }
        Ok(out)
    }

    /// Fetch (and enrich, when configured) every subreddit in turn into one shared writer.
    pub fn harvest<S: PartitionSink + ?Sized>(
        &self,
        subreddits: &[String],
        lower: i64,
        upper: Option<i64>,
        sink: &S,
    ) -> Result<WriterStats> {
        init_tracing_once();
        let mut source = HarvestSource {
            harvester: self,
            pending: subreddits.iter().cloned().collect(),
            current: None,
            enricher: self.enricher(),
            lower,
            upper,
        };
        let stats = write_stream(&mut source, sink, WriterOptions::from(&self.opts))?;
        if let Some(e) = &source.enricher {
            e.finish();
        }
        tracing::info!(
            "harvest done: {} records in {} flushes ({} appends)",
            stats.records,
            stats.flushes,
            stats.appends
        );
        Ok(stats)
    }
}

/// Chains one fetch session per subreddit and enriches each page on the way out.
struct HarvestSource<'h, 'a> {
    harvester: &'h Harvester<'a>,
    pending: VecDeque<String>,
    current: Option<CursorFetcher<&'a dyn SearchApi>>,
    enricher: Option<Enricher<&'a dyn LookupApi>>,
    lower: i64,
    upper: Option<i64>,
}

impl BatchSource for HarvestSource<'_, '_> {
    fn next_batch(&mut self) -> Result<StreamState> {
        loop {
            if let Some(fetcher) = self.current.as_mut() {
                match fetcher.next_page()? {
                    StreamState::Active(mut batch) => {
                        if let Some(e) = &self.enricher {
                            e.enrich_page(&mut batch)?;
                        }
                        return Ok(StreamState::Active(batch));
                    }
                    StreamState::Exhausted => {
                        tracing::info!("r/{}: fetch finished after {} requests", fetcher.subreddit(), fetcher.requests());
                        self.current = None;
                    }
                }
            }
            if self.harvester.cancel.is_cancelled() {
                return Ok(StreamState::Exhausted);
            }
            match self.pending.pop_front() {
                Some(sub) => {
                    self.current = Some(self.harvester.fetch(&sub, self.lower, self.upper)?);
                }
                None => return Ok(StreamState::Exhausted),
            }
        }
    }
}

pub fn year_file(folder: &Path, subreddit: &str, year: i32) -> PathBuf {
    folder.join(format!("{subreddit}_{year}.csv"))
}

/// Concatenate the yearly files of `subreddit`; missing years are skipped.
pub fn load_years(subreddit: &str, years: &[i32], folder: &Path) -> Result<Vec<Record>> {
    let mut out = Vec::new();
    for &year in years {
        let path = year_file(folder, subreddit, year);
        if !path.exists() {
            tracing::warn!("{} not found, skipping", path.display());
            continue;
        }
        out.extend(read_flat_file(&path)?);
    }
    Ok(out)
}

/// Convert a JSON-lines dump into the partition archive.
pub fn ingest_dump<S: PartitionSink + ?Sized>(
    dump: &Path,
    chunk_size: usize,
    sink: &S,
    opts: WriterOptions,
) -> Result<WriterStats> {
    init_tracing_once();
    let mut reader = DumpReader::open(dump, chunk_size)?;
    let stats = write_stream(&mut reader, sink, opts)?;
    tracing::info!(
        "{}: ingested {} records ({} quarantined lines)",
        dump.display(),
        stats.records,
        reader.quarantined()
    );
    Ok(stats)
}
