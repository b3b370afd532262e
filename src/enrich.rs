//! Refresh `score`/`num_comments` of crawled records from the authenticated API.
//!
//! Ids are looked up in batches of at most 100 and correlated back by id, never
//! by position. The merge is a left join: records the lookup does not return
//! keep their crawl-time values, and no record is ever added or removed.
//!
//! [`Enricher::enrich`] treats its input as a whole operation and reports
//! 25/50/75/100% milestones for it. Page-by-page harvests call
//! [`Enricher::enrich_page`] instead, which only advances one run-wide counter,
//! and close the run with [`Enricher::finish`].

use crate::cancel::CancelToken;
use crate::config::{HarvestOptions, RetryPolicy, MAX_LOOKUP_BATCH};
use crate::lookup::{LiveStats, LookupApi};
use crate::progress::{make_count_progress, make_running_count, Milestones};
use crate::record::{fullname, Record};
use crate::retry::{with_retry, Sleeper, ThreadSleeper};
use ahash::{AHashMap, AHashSet};
use anyhow::Result;
use indicatif::ProgressBar;
use parking_lot::Mutex;
use std::sync::Arc;

/// Ids looked up between two run-level log lines of a paged enrichment.
const LOG_EVERY_IDS: u64 = 10_000;

/// Running totals of a page-by-page enrichment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EnrichTotals {
    pub pages: u64,
    pub ids: u64,
    pub updated: u64,
}

#[derive(Default)]
struct RunProgress {
    totals: EnrichTotals,
    next_log: u64,
    bar: Option<ProgressBar>,
}

pub struct Enricher<L: LookupApi> {
    api: L,
    batch: usize,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    cancel: CancelToken,
    progress: bool,
    run: Mutex<RunProgress>,
}

impl<L: LookupApi> Enricher<L> {
    pub fn new(api: L, opts: &HarvestOptions) -> Self {
        Self {
            api,
            batch: opts.lookup_batch.clamp(1, MAX_LOOKUP_BATCH),
            retry: opts.retry,
            sleeper: Arc::new(ThreadSleeper),
            cancel: CancelToken::default(),
            progress: opts.progress,
            run: Mutex::new(RunProgress { next_log: LOG_EVERY_IDS, ..RunProgress::default() }),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Look up every distinct id of `records` and merge the answers in place.
    /// Returns the number of records that received live values.
    pub fn enrich(&self, records: &mut [Record]) -> Result<usize> {
        let ids = distinct_fullnames(records);
        if ids.is_empty() {
            return Ok(0);
        }

        // One authenticated round trip per batch, roughly two seconds each.
        let est_minutes = 2.0 * ids.len() as f64 / self.batch as f64 / 60.0;
        tracing::info!("updating {} entries, estimated {:.0} minutes", ids.len(), est_minutes);

        let mut milestones = Milestones::quarters("enrichment", ids.len() as u64);
        let pb = if self.progress { Some(make_count_progress(ids.len() as u64, "Enriching")) } else { None };
        let live = self.lookup(&ids, |n| {
            milestones.advance(n);
            if let Some(pb) = &pb {
                pb.inc(n);
            }
        })?;
        if let Some(pb) = pb {
            pb.finish_with_message("Enriching done");
        }
        Ok(merge_live(records, &live))
    }

    /// Owned convenience wrapper around [`Enricher::enrich`].
    pub fn enrich_batch(&self, mut records: Vec<Record>) -> Result<Vec<Record>> {
        self.enrich(&mut records)?;
        Ok(records)
    }

    /// Enrich one page of a longer run. Progress accumulates across calls
    /// instead of restarting per page.
    pub fn enrich_page(&self, records: &mut [Record]) -> Result<usize> {
        let ids = distinct_fullnames(records);
        let live = self.lookup(&ids, |n| {
            let run = self.run.lock();
            if let Some(pb) = &run.bar {
                pb.inc(n);
            }
        })?;
        let updated = merge_live(records, &live);

        let mut run = self.run.lock();
        if self.progress && run.bar.is_none() {
            let pb = make_running_count("Enriching");
            pb.inc(ids.len() as u64);
            run.bar = Some(pb);
        }
        run.totals.pages += 1;
        run.totals.ids += ids.len() as u64;
        run.totals.updated += updated as u64;
        if run.totals.ids >= run.next_log {
            tracing::info!(
                "enrichment: {} ids looked up so far, {} records updated",
                run.totals.ids,
                run.totals.updated
            );
            while run.next_log <= run.totals.ids {
                run.next_log += LOG_EVERY_IDS;
            }
        }
        Ok(updated)
    }

    /// Totals accumulated by [`Enricher::enrich_page`].
    pub fn totals(&self) -> EnrichTotals {
        self.run.lock().totals
    }

    /// Close a paged run: one summary line and the progress bar finished.
    pub fn finish(&self) -> EnrichTotals {
        let mut run = self.run.lock();
        if let Some(pb) = run.bar.take() {
            pb.finish_with_message("Enriching done");
        }
        let t = run.totals;
        tracing::info!("enrichment done: {} pages, {} ids looked up, {} records updated", t.pages, t.ids, t.updated);
        t
    }

    fn lookup(&self, ids: &[String], mut on_batch: impl FnMut(u64)) -> Result<Vec<LiveStats>> {
        let mut live = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(self.batch) {
            let op = format!("lookup {} ids", chunk.len());
            match with_retry(&op, &self.retry, self.sleeper.as_ref(), &self.cancel, || self.api.info(chunk)) {
                Ok(mut stats) => live.append(&mut stats),
                Err(e) if e.is_cancelled() => {
                    tracing::warn!("enrichment cancelled; remaining records keep crawl-time values");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
            on_batch(chunk.len() as u64);
        }
        Ok(live)
    }
}

fn distinct_fullnames(records: &[Record]) -> Vec<String> {
    let mut seen = AHashSet::with_capacity(records.len());
    records.iter().filter(|r| seen.insert(r.id.as_str())).map(|r| fullname(&r.id)).collect()
}

/// Left-join `live` onto `records` by id. Unmatched records are untouched.
/// Returns how many records were updated.
pub fn merge_live(records: &mut [Record], live: &[LiveStats]) -> usize {
    let index: AHashMap<&str, &LiveStats> = live
        .iter()
        .map(|s| (s.id.strip_prefix("t3_").unwrap_or(&s.id), s))
        .collect();
    let mut updated = 0usize;
    for r in records.iter_mut() {
        if let Some(s) = index.get(r.id.as_str()) {
            r.score = s.score;
            r.num_comments = s.num_comments;
            r.time_updated = Some(s.time_updated);
            updated += 1;
        }
    }
    updated
}
