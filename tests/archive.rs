#[path = "common/mod.rs"]
mod common;

use common::*;
use serde_json::json;
use std::fs;
use subharvest::{
    count_subreddits, ingest_dump, load_rollup, num_comments, sanitize_key, subreddit_rollup, write_rollup,
    write_stream, ArchiveStore, BatchSource, ChunkedWriter, ConfigError, DumpReader, PartitionKey, PartitionSink,
    StreamState, SubredditRollup, WriterOptions, MANIFEST_FILE, ROLLUP_FILE,
};

fn unbounded() -> WriterOptions {
    WriterOptions { memory_budget_bytes: u64::MAX, drop_pinned: false, parallel_flush: false, low_memory_flush: None }
}

#[test]
fn partition_keys_are_sanitized() {
    assert_eq!(sanitize_key("AskReddit").as_deref(), Some("AskReddit"));
    assert_eq!(sanitize_key("2meirl4meirl").as_deref(), Some("r_2meirl4meirl"));
    assert_eq!(sanitize_key("a-b.c").as_deref(), Some("a_b_c"));
    assert_eq!(sanitize_key(" u_someone ").as_deref(), Some("u_someone"));
    assert_eq!(sanitize_key(""), None);
    assert_eq!(sanitize_key("..."), None);
}

/// Two flushes into one partition become two frames of one file; reading the
/// partition back yields every row in append order, with all field values intact.
#[test]
fn archive_round_trip_over_several_frames() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArchiveStore::open(dir.path(), 3).unwrap();

    let mut first = batch("a", "rust", 3);
    first[0].author = None;
    first[1].time_updated = Some(1_700_000_000);
    first[2].stickied = true;
    let second = batch("b", "rust", 2);

    let mut w = ChunkedWriter::new(&store, unbounded()).unwrap();
    w.push(first.clone()).unwrap();
    w.flush().unwrap();
    w.push(second.clone()).unwrap();
    w.finish().unwrap();

    let back = store.read_subreddit("rust").unwrap();
    let expected: Vec<_> = first.into_iter().chain(second).collect();
    assert_eq!(back, expected);

    assert!(store.partition_path("rust").exists());
    assert!(dir.path().join(MANIFEST_FILE).exists());
    assert_eq!(store.partition_files().len(), 1);
}

/// The manifest survives a reopen, so a later run still detects a colliding name.
#[test]
fn manifest_persists_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = ArchiveStore::open(dir.path(), 3).unwrap();
        write_stream(&mut Once(Some(batch("p", "a_b", 2))), &store, unbounded()).unwrap();
    }

    let store = ArchiveStore::open(dir.path(), 3).unwrap();
    let known = store.existing_partitions().unwrap();
    assert_eq!(known.len(), 1);
    assert_eq!(known[0].subreddit, "a_b");

    let err = write_stream(&mut Once(Some(batch("q", "a.b", 1))), &store, unbounded()).unwrap_err();
    assert!(matches!(err.downcast_ref::<ConfigError>(), Some(ConfigError::PartitionKeyCollision { .. })));
    // The original partition is untouched.
    assert_eq!(store.read_subreddit("a_b").unwrap().len(), 2);
    assert!(store.read_subreddit("a.b").unwrap().is_empty());
}

/// Lookups by name fall back to a case-insensitive match.
#[test]
fn find_is_case_insensitive() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArchiveStore::open(dir.path(), 3).unwrap();
    write_stream(&mut Once(Some(batch("p", "AskReddit", 2))), &store, unbounded()).unwrap();

    assert_eq!(store.read_subreddit("askreddit").unwrap().len(), 2);
    assert!(store.find("nope").is_none());
}

/// A later run bringing `pics` into an archive that already holds `Pics` is
/// refused: both would land in one file on a case-insensitive filesystem.
#[test]
fn case_variant_of_stored_partition_collides() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = ArchiveStore::open(dir.path(), 3).unwrap();
        write_stream(&mut Once(Some(batch("p", "Pics", 2))), &store, unbounded()).unwrap();
    }

    let store = ArchiveStore::open(dir.path(), 3).unwrap();
    let err = write_stream(&mut Once(Some(batch("q", "pics", 3))), &store, unbounded()).unwrap_err();
    assert!(matches!(err.downcast_ref::<ConfigError>(), Some(ConfigError::PartitionKeyCollision { .. })));
    assert_eq!(store.partitions().len(), 1);
    assert_eq!(store.read_subreddit("PICS").unwrap().len(), 2);

    // The store refuses it on its own as well, without a writer in front.
    let key = PartitionKey { key: "pics".into(), subreddit: "pics".into() };
    assert!(store.append(&key, &batch("r", "pics", 1)).is_err());
    assert_eq!(store.partition_files().len(), 1);
}

/// A tiny append buffer only changes how a frame is written, not what is read back.
#[test]
fn small_write_buffer_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArchiveStore::open(dir.path(), 3).unwrap().with_write_buffer(16);
    assert_eq!(store.write_buffer(), 16);

    let rows = batch("p", "rust", 200);
    write_stream(&mut Once(Some(rows.clone())), &store, unbounded()).unwrap();
    assert_eq!(store.read_subreddit("rust").unwrap(), rows);
}

/// Errors that will not go away (here a directory in place of the partition
/// file) fail the append at once instead of going through the I/O backoff.
#[cfg(unix)]
#[test]
fn permanent_io_errors_fail_fast() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArchiveStore::open(dir.path(), 3).unwrap();
    fs::create_dir(store.partition_path("rust")).unwrap();

    let started = std::time::Instant::now();
    let key = PartitionKey { key: "rust".into(), subreddit: "rust".into() };
    assert!(store.append(&key, &batch("p", "rust", 1)).is_err());
    assert!(started.elapsed() < std::time::Duration::from_secs(2), "took {:?}", started.elapsed());
}

/// A write that fails after the file is open is reported, and a rollback that
/// fails as well is logged rather than swallowed.
#[cfg(target_os = "linux")]
#[test]
fn failed_append_and_failed_rollback_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArchiveStore::open(dir.path(), 3).unwrap();
    // Every write to /dev/full fails with ENOSPC, and it cannot be truncated.
    std::os::unix::fs::symlink("/dev/full", store.partition_path("rust")).unwrap();

    let key = PartitionKey { key: "rust".into(), subreddit: "rust".into() };
    let (res, logs) = capture_logs(|| store.append(&key, &batch("p", "rust", 3)));
    assert!(res.is_err());
    assert!(logs.contains("could not truncate"), "{logs}");
}

/// Rollups sum submissions and comments per partition, most submissions first,
/// and survive a write/load cycle.
#[test]
fn rollup_over_the_archive() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArchiveStore::open(dir.path(), 3).unwrap();
    let mut a = batch("a", "alpha", 3);
    for (i, r) in a.iter_mut().enumerate() {
        r.num_comments = i as i64 + 1;
    }
    let mut b = batch("b", "beta", 1);
    b[0].num_comments = 10;
    write_stream(&mut Once(Some(a.into_iter().chain(b).collect())), &store, unbounded()).unwrap();

    let rows = subreddit_rollup(&store).unwrap();
    assert_eq!(
        rows,
        vec![
            SubredditRollup { subreddit: "alpha".into(), submissions: 3, comments: 6 },
            SubredditRollup { subreddit: "beta".into(), submissions: 1, comments: 10 },
        ]
    );

    assert!(load_rollup(&store).unwrap().is_empty());
    write_rollup(&store).unwrap();
    assert!(dir.path().join(ROLLUP_FILE).exists());
    assert_eq!(load_rollup(&store).unwrap(), rows);

    assert_eq!(num_comments(&store, "alpha").unwrap(), vec![1, 2, 3]);
    assert!(num_comments(&store, "gamma").unwrap().is_empty());
}

fn dump_lines() -> Vec<String> {
    vec![
        raw("s1", "alpha", 100).to_string(),
        raw("s2", "beta", 101).to_string(),
        String::new(),
        "{not json".to_string(),
        json!({"id": "s3", "created_utc": 102}).to_string(),
        raw("s4", "alpha", 103).to_string(),
        json!({"id": "s5", "subreddit": "alpha", "created_utc": "104.0", "pinned": true}).to_string(),
    ]
}

/// A plain dump is cut into batches of `chunk_size`; bad lines are skipped and counted.
#[test]
fn dump_reader_batches_and_quarantines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("RS_sample.jsonl");
    write_lines(&path, &dump_lines());

    let mut reader = DumpReader::open(&path, 2).unwrap();
    let mut sizes = Vec::new();
    while let StreamState::Active(b) = reader.next_batch().unwrap() {
        sizes.push(b.len());
    }
    assert_eq!(sizes, vec![2, 2]);
    assert_eq!(reader.records(), 4);
    assert_eq!(reader.quarantined(), 2);
    assert_eq!(reader.next_batch().unwrap(), StreamState::Exhausted);
}

/// A compressed dump converts into the archive, one partition per subreddit.
#[test]
fn compressed_dump_ingests_into_archive() {
    let dir = tempfile::tempdir().unwrap();
    let dump = dir.path().join("RS_sample.zst");
    write_lines(&dump, &dump_lines());
    let store = ArchiveStore::open(&dir.path().join("archive"), 3).unwrap();

    let stats = ingest_dump(&dump, 3, &store, unbounded()).unwrap();

    assert_eq!(stats.records, 4);
    let alpha = store.read_subreddit("alpha").unwrap();
    assert_eq!(alpha.len(), 3);
    assert!(alpha.iter().any(|r| r.id == "s5" && r.stickied && r.created_utc == 104));
    assert_eq!(store.read_subreddit("beta").unwrap().len(), 1);
}

/// Per-subreddit counts, optionally saved as headerless `subreddit,count` rows.
#[test]
fn subreddit_counts_of_a_dump() {
    let dir = tempfile::tempdir().unwrap();
    let dump = dir.path().join("RS_sample.zst");
    write_lines(&dump, &dump_lines());
    let save = dir.path().join("counts.csv");

    let counts = count_subreddits(&dump, 2, Some(&save)).unwrap();

    assert_eq!(counts.get("alpha"), Some(&3));
    assert_eq!(counts.get("beta"), Some(&1));
    assert_eq!(fs::read_to_string(&save).unwrap(), "alpha,3\nbeta,1\n");
}

/// Hands out one batch, then reports exhaustion.
struct Once(Option<Vec<subharvest::Record>>);

impl BatchSource for Once {
    fn next_batch(&mut self) -> anyhow::Result<StreamState> {
        Ok(self.0.take().map_or(StreamState::Exhausted, StreamState::Active))
    }
}
