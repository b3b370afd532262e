#![allow(dead_code)]

use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use subharvest::{
    LiveStats, LookupApi, PartitionKey, PartitionSink, Record, RemoteError, SearchApi, SearchQuery, Sleeper,
};

/// A typed record with the fields the tests care about; the rest are defaults.
pub fn rec(id: &str, subreddit: &str, created_utc: i64) -> Record {
    Record {
        id: id.to_string(),
        subreddit: subreddit.to_string(),
        author: Some(format!("user_{id}")),
        created_utc,
        score: 1,
        num_comments: 0,
        domain: format!("self.{subreddit}"),
        stickied: false,
        time_updated: None,
    }
}

/// `n` records of one subreddit with ids `<prefix>0..` and descending timestamps.
pub fn batch(prefix: &str, subreddit: &str, n: usize) -> Vec<Record> {
    (0..n).map(|i| rec(&format!("{prefix}{i}"), subreddit, 2_000_000 - i as i64)).collect()
}

/// A raw crawl object as the search endpoint returns it, with some extra fields
/// the allow-list is expected to drop.
pub fn raw(id: &str, subreddit: &str, created_utc: i64) -> Value {
    json!({
        "id": id, "subreddit": subreddit, "author": format!("user_{id}"),
        "created_utc": created_utc, "score": 1, "num_comments": 0,
        "domain": format!("self.{subreddit}"), "stickied": false,
        "title": "ignored", "selftext": "ignored", "over_18": false
    })
}

/// One raw object per second in `[from, to)` for `subreddit`.
pub fn raw_range(subreddit: &str, from: i64, to: i64) -> Vec<Value> {
    (from..to).map(|t| raw(&format!("{subreddit}{t}"), subreddit, t)).collect()
}

/// In-process search endpoint.
///
/// Answers like the real service from `corpus` (filter by subreddit and
/// `before`, newest first, at most `size`), unless a scripted response is queued,
/// in which case the next scripted response is returned instead.
#[derive(Default)]
pub struct StubSearch {
    corpus: Vec<Value>,
    scripted: Mutex<VecDeque<Result<Vec<Value>, RemoteError>>>,
    queries: Mutex<Vec<SearchQuery>>,
}

impl StubSearch {
    pub fn new(corpus: Vec<Value>) -> Self {
        Self { corpus, ..Default::default() }
    }

    /// Queue a response served ahead of the corpus.
    pub fn script(self, resp: Result<Vec<Value>, RemoteError>) -> Self {
        self.scripted.lock().unwrap().push_back(resp);
        self
    }

    pub fn queries(&self) -> Vec<SearchQuery> {
        self.queries.lock().unwrap().clone()
    }
}

impl SearchApi for StubSearch {
    fn search(&self, query: &SearchQuery) -> Result<Vec<Value>, RemoteError> {
        self.queries.lock().unwrap().push(query.clone());
        if let Some(resp) = self.scripted.lock().unwrap().pop_front() {
            return resp;
        }
        let mut page: Vec<Value> = self
            .corpus
            .iter()
            .filter(|v| v["subreddit"] == query.subreddit.as_str())
            .filter(|v| v["created_utc"].as_i64().unwrap() < query.before)
            .cloned()
            .collect();
        page.sort_by_key(|v| std::cmp::Reverse(v["created_utc"].as_i64().unwrap()));
        page.truncate(query.size);
        Ok(page)
    }
}

/// In-process authenticated lookup. Knows `(score, num_comments)` per base id,
/// answers in reverse request order and silently omits unknown ids.
#[derive(Default)]
pub struct StubLookup {
    live: HashMap<String, (i64, i64)>,
    pub time_updated: i64,
    failures: Mutex<VecDeque<RemoteError>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl StubLookup {
    pub fn new<'a>(live: impl IntoIterator<Item = (&'a str, i64, i64)>) -> Self {
        Self {
            live: live.into_iter().map(|(id, s, c)| (id.to_string(), (s, c))).collect(),
            time_updated: 1_700_000_000,
            ..Default::default()
        }
    }

    /// Fail the next call with `err` before answering normally.
    pub fn fail_next(self, err: RemoteError) -> Self {
        self.failures.lock().unwrap().push_back(err);
        self
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

impl LookupApi for StubLookup {
    fn info(&self, fullnames: &[String]) -> Result<Vec<LiveStats>, RemoteError> {
        self.calls.lock().unwrap().push(fullnames.to_vec());
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(fullnames
            .iter()
            .rev()
            .filter_map(|f| {
                let id = f.strip_prefix("t3_").unwrap_or(f);
                self.live.get(id).map(|(score, num_comments)| LiveStats {
                    id: f.clone(),
                    score: *score,
                    num_comments: *num_comments,
                    time_updated: self.time_updated,
                })
            })
            .collect())
    }
}

/// Records every pause instead of waiting.
#[derive(Default)]
pub struct RecordingSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, d: Duration) {
        self.sleeps.lock().unwrap().push(d);
    }
}

/// Partition sink kept in memory. Every append is logged as `(subreddit, rows)`.
/// Appends for the subreddit named in `fail_for` are refused.
#[derive(Default)]
pub struct MemorySink {
    existing: Vec<PartitionKey>,
    pub fail_for: Mutex<Option<String>>,
    appends: Mutex<Vec<(String, usize)>>,
    rows: Mutex<BTreeMap<String, Vec<Record>>>,
}

impl MemorySink {
    pub fn with_existing(existing: Vec<PartitionKey>) -> Self {
        Self { existing, ..Default::default() }
    }

    pub fn appends(&self) -> Vec<(String, usize)> {
        self.appends.lock().unwrap().clone()
    }

    pub fn rows(&self, subreddit: &str) -> Vec<Record> {
        self.rows.lock().unwrap().get(subreddit).cloned().unwrap_or_default()
    }

    pub fn total_rows(&self) -> usize {
        self.rows.lock().unwrap().values().map(Vec::len).sum()
    }
}

impl PartitionSink for MemorySink {
    fn existing_partitions(&self) -> anyhow::Result<Vec<PartitionKey>> {
        Ok(self.existing.clone())
    }

    fn append(&self, key: &PartitionKey, records: &[Record]) -> anyhow::Result<()> {
        if self.fail_for.lock().unwrap().as_deref() == Some(key.subreddit.as_str()) {
            anyhow::bail!("disk full");
        }
        self.appends.lock().unwrap().push((key.subreddit.clone(), records.len()));
        self.rows.lock().unwrap().entry(key.subreddit.clone()).or_default().extend_from_slice(records);
        Ok(())
    }
}

/// Write JSON lines to `path`, zstd-compressed when it ends in `.zst`.
pub fn write_lines(path: &Path, lines: &[String]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let f = File::create(path).unwrap();
    if path.extension().is_some_and(|e| e == "zst") {
        let mut enc = zstd::stream::write::Encoder::new(f, 3).unwrap();
        for l in lines {
            writeln!(&mut enc, "{}", l).unwrap();
        }
        enc.finish().unwrap();
    } else {
        let mut f = f;
        for l in lines {
            writeln!(&mut f, "{}", l).unwrap();
        }
    }
}

/// In-memory log sink shared between the subscriber and the test.
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `f` with INFO-level log output captured on this thread.
pub fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
    let buf = LogBuffer::default();
    let writer = buf.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let out = tracing::subscriber::with_default(subscriber, f);
    let text = String::from_utf8_lossy(&buf.0.lock().unwrap()).into_owned();
    (out, text)
}
