//! Per-subreddit rollups computed straight from the partition archive.

use crate::store::ArchiveStore;
use crate::util::{create_with_backoff, open_with_backoff, replace_file_atomic_backoff};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;

pub const ROLLUP_FILE: &str = "_statistics.json";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubredditRollup {
    pub subreddit: String,
    pub submissions: u64,
    /// Sum of `num_comments` over the partition.
    pub comments: i64,
}

/// Submission and comment totals for every partition, most submissions first.
pub fn subreddit_rollup(store: &ArchiveStore) -> Result<Vec<SubredditRollup>> {
    let partitions = store.partitions();

    let known: BTreeSet<PathBuf> = partitions.iter().map(|p| store.partition_path(&p.key)).collect();
    for orphan in store.partition_files().into_iter().filter(|f| !known.contains(f)) {
        tracing::warn!("{} is not listed in the partition manifest; skipped", orphan.display());
    }

    let mut out = Vec::with_capacity(partitions.len());
    for pk in partitions {
        let mut row = SubredditRollup { subreddit: pk.subreddit.clone(), submissions: 0, comments: 0 };
        store.for_each_record(&pk.key, |r| {
            row.submissions += 1;
            row.comments += r.num_comments;
            Ok(())
        })?;
        out.push(row);
    }
    out.sort_by(|a, b| b.submissions.cmp(&a.submissions).then_with(|| a.subreddit.cmp(&b.subreddit)));
    Ok(out)
}

/// Compute the rollup and store it as `_statistics.json` in the archive root.
pub fn write_rollup(store: &ArchiveStore) -> Result<Vec<SubredditRollup>> {
    let rows = subreddit_rollup(store)?;
    let dest = store.root().join(ROLLUP_FILE);
    let tmp = store.root().join(format!("{ROLLUP_FILE}.inprogress"));
    let f = create_with_backoff(&tmp, 16, 50).with_context(|| format!("create {}", tmp.display()))?;
    let mut w = BufWriter::new(f);
    serde_json::to_writer_pretty(&mut w, &rows)?;
    w.flush()?;
    drop(w);
    replace_file_atomic_backoff(&tmp, &dest)?;
    tracing::info!("wrote rollup of {} subreddits to {}", rows.len(), dest.display());
    Ok(rows)
}

/// Read back the last materialized rollup; empty when none was written.
pub fn load_rollup(store: &ArchiveStore) -> Result<Vec<SubredditRollup>> {
    let path = store.root().join(ROLLUP_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let f = open_with_backoff(&path, 16, 50).with_context(|| format!("open {}", path.display()))?;
    serde_json::from_reader(BufReader::new(f)).with_context(|| format!("parse {}", path.display()))
}

/// `num_comments` of every stored submission of one subreddit.
pub fn num_comments(store: &ArchiveStore, subreddit: &str) -> Result<Vec<i64>> {
    let Some(pk) = store.find(subreddit) else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    store.for_each_record(&pk.key, |r| {
        out.push(r.num_comments);
        Ok(())
    })?;
    Ok(out)
}
