#[path = "common/mod.rs"]
mod common;

use common::*;
use serde_json::Value;
use std::fs;
use std::sync::Arc;
use subharvest::{load_years, year_bounds, year_file, ArchiveStore, CancelToken, Harvester, RemoteError};

/// Three posts per year for 2019-2021 in r/pics, one in r/other.
fn corpus() -> Vec<Value> {
    let mut out = Vec::new();
    for year in [2019, 2020, 2021] {
        let (start, _) = year_bounds(year).unwrap();
        for k in 0..3 {
            out.push(raw(&format!("p{year}_{k}"), "pics", start + 86_400 * (k + 1)));
        }
    }
    let (start, _) = year_bounds(2020).unwrap();
    out.push(raw("o1", "other", start + 5));
    out
}

/// Whole-range download collects every in-range record of one subreddit.
#[test]
fn download_posts_collects_the_window() {
    let stub = StubSearch::new(corpus());
    let (lower, _) = year_bounds(2020).unwrap();
    let (_, upper) = year_bounds(2021).unwrap();

    let posts = Harvester::new(&stub).page_size(2).progress(false).download_posts("pics", lower, Some(upper)).unwrap();

    assert_eq!(posts.len(), 6);
    assert!(posts.iter().all(|r| r.subreddit == "pics" && r.created_utc >= lower && r.created_utc < upper));
}

/// Yearly files are written per subreddit and year, enriched, and load back together.
#[test]
fn yearly_files_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let stub = StubSearch::new(corpus());
    let lookup = StubLookup::new([("p2020_0", 500, 50)]);

    let files = Harvester::new(&stub)
        .lookup(&lookup)
        .progress(false)
        .save_posts_year(&["pics".to_string()], &[2020, 2021], dir.path())
        .unwrap();

    assert_eq!(files, vec![year_file(dir.path(), "pics", 2020), year_file(dir.path(), "pics", 2021)]);
    assert!(dir.path().join("pics_2020.csv").exists());

    let loaded = load_years("pics", &[2020, 2021, 2022], dir.path()).unwrap();
    assert_eq!(loaded.len(), 6);
    let hot = loaded.iter().find(|r| r.id == "p2020_0").unwrap();
    assert_eq!((hot.score, hot.num_comments), (500, 50));
    assert_eq!(hot.time_updated, Some(lookup.time_updated));
}

/// The CSV harvest pages in hundreds, enriches each page, and appends with a single header.
#[test]
fn download_csv_appends_enriched_pages() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("pics.csv");
    let stub = StubSearch::new(raw_range("pics", 10_000, 10_250));
    let lookup = StubLookup::new([("pics10249", 42, 4)]);

    let written = Harvester::new(&stub)
        .lookup(&lookup)
        .progress(false)
        .download_csv("pics", &out, 10_000, Some(10_250))
        .unwrap();

    assert_eq!(written, 250);
    assert!(stub.queries().iter().all(|q| q.size == 100));
    assert_eq!(lookup.calls().len(), 3);

    let text = fs::read_to_string(&out).unwrap();
    assert_eq!(text.lines().filter(|l| l.starts_with("id,")).count(), 1);
    let rows = subharvest::read_flat_file(&out).unwrap();
    assert_eq!(rows.len(), 250);
    assert_eq!(rows[0].score, 42);
}

/// Several subreddits share one writer: a single flush at the end writes one
/// append per subreddit, with enrichment applied on the way.
#[test]
fn harvest_into_partitions() {
    let stub = StubSearch::new(corpus());
    let lookup = StubLookup::new([("o1", 9, 9)]);
    let sink = MemorySink::default();
    let (lower, _) = year_bounds(2019).unwrap();
    let (_, upper) = year_bounds(2021).unwrap();

    let stats = Harvester::new(&stub)
        .lookup(&lookup)
        .page_size(4)
        .progress(false)
        .harvest(&["pics".to_string(), "other".to_string()], lower, Some(upper), &sink)
        .unwrap();

    assert_eq!(stats.records, 10);
    assert_eq!(sink.appends(), vec![("other".to_string(), 1), ("pics".to_string(), 9)]);
    assert_eq!(sink.rows("other")[0].score, 9);
}

/// A multi-page harvest reports enrichment progress for the run as a whole:
/// no per-page estimate or milestone cycle, one summary at the end.
#[test]
fn harvest_reports_enrichment_once_per_run() {
    let corpus = raw_range("pics", 10_000, 11_000);
    let stub = StubSearch::new(corpus);
    let ids: Vec<String> = (10_000..11_000).map(|t| format!("pics{t}")).collect();
    let lookup = StubLookup::new(ids.iter().map(|id| (id.as_str(), 3, 3)));
    let sink = MemorySink::default();

    let (stats, logs) = capture_logs(|| {
        Harvester::new(&stub)
            .lookup(&lookup)
            .page_size(500)
            .progress(false)
            .harvest(&["pics".to_string()], 10_000, Some(11_000), &sink)
            .unwrap()
    });

    assert_eq!(stats.records, 1000);
    assert_eq!(lookup.calls().len(), 10);
    assert!(sink.rows("pics").iter().all(|r| r.score == 3));
    assert_eq!(logs.matches("updating ").count(), 0, "{logs}");
    assert_eq!(logs.matches("enrichment: 100%").count(), 0, "{logs}");
    assert_eq!(logs.matches("enrichment done: 2 pages, 1000 ids looked up, 1000 records updated").count(), 1, "{logs}");
}

/// Harvest into a real archive with a transient failure on the way: one pause,
/// no lost or duplicated records.
#[test]
fn harvest_survives_a_transient_failure() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArchiveStore::open(dir.path(), 3).unwrap();
    let stub = StubSearch::new(corpus()).script(Err(RemoteError::retryable("HTTP 500")));
    let sleeper = Arc::new(RecordingSleeper::default());

    let stats = Harvester::new(&stub)
        .sleeper(sleeper.clone())
        .progress(false)
        .harvest(&["pics".to_string()], 0, None, &store)
        .unwrap();

    assert_eq!(stats.records, 9);
    assert_eq!(sleeper.sleeps().len(), 1);
    assert_eq!(store.read_subreddit("pics").unwrap().len(), 9);
}

/// A cancelled harvest still flushes what it had and reports it as partial output.
#[test]
fn cancelled_harvest_flushes_partial_output() {
    let stub = StubSearch::new(corpus());
    let sink = MemorySink::default();
    let cancel = CancelToken::new();
    cancel.cancel();

    let stats = Harvester::new(&stub)
        .cancel_token(cancel)
        .progress(false)
        .harvest(&["pics".to_string()], 0, None, &sink)
        .unwrap();

    assert_eq!(stats.records, 0);
    assert!(stub.queries().is_empty());
    assert!(sink.appends().is_empty());
}
