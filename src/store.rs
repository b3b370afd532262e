//! Partitioned on-disk archive: one independently appendable table per subreddit.
//!
//! Layout:
//!   <root>/_partitions.json        key -> subreddit name
//!   <root>/<key>.jsonl.zst         one zstd frame per append, NDJSON records inside
//!
//! Each append is written as a single complete frame; a failed write is truncated
//! back so the partition never holds a torn frame. Appends to one partition are
//! serialized by a per-partition lock, appends to different partitions may run
//! concurrently.

use crate::error::ConfigError;
use crate::record::Record;
use crate::util::{append_with_backoff, create_with_backoff, open_with_backoff, replace_file_atomic_backoff};
use ahash::AHashMap;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use walkdir::WalkDir;
use zstd::stream::read::Decoder;

pub const MANIFEST_FILE: &str = "_partitions.json";
pub const PARTITION_EXT: &str = ".jsonl.zst";

/// A subreddit together with the storage-safe key it is filed under.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionKey {
    pub key: String,
    pub subreddit: String,
}

/// Map a subreddit name onto `[A-Za-z0-9_]+` not starting with a digit.
/// Returns `None` when nothing usable is left.
pub fn sanitize_key(subreddit: &str) -> Option<String> {
    static UNSAFE: OnceLock<Regex> = OnceLock::new();
    let re = UNSAFE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_]").expect("static regex"));
    let trimmed = subreddit.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut key = re.replace_all(trimmed, "_").into_owned();
    if key.chars().all(|c| c == '_') {
        return None;
    }
    if key.starts_with(|c: char| c.is_ascii_digit()) {
        key.insert_str(0, "r_");
    }
    Some(key)
}

/// Tracks which subreddit owns each key; two names on one key abort the run.
/// Keys are compared case-folded because partition files may live on a
/// case-insensitive filesystem.
#[derive(Clone, Debug, Default)]
pub struct KeyRegistry {
    by_key: BTreeMap<String, String>,
}

impl KeyRegistry {
    pub fn from_existing<I: IntoIterator<Item = PartitionKey>>(keys: I) -> Self {
        Self { by_key: keys.into_iter().map(|k| (k.key.to_ascii_lowercase(), k.subreddit)).collect() }
    }

    pub fn resolve(&mut self, subreddit: &str) -> Result<PartitionKey, ConfigError> {
        let key = sanitize_key(subreddit).ok_or_else(|| ConfigError::EmptyPartitionKey(subreddit.to_string()))?;
        let folded = key.to_ascii_lowercase();
        match self.by_key.get(&folded) {
            Some(owner) if owner != subreddit => Err(ConfigError::PartitionKeyCollision {
                key,
                existing: owner.clone(),
                incoming: subreddit.to_string(),
            }),
            Some(_) => Ok(PartitionKey { key, subreddit: subreddit.to_string() }),
            None => {
                self.by_key.insert(folded, subreddit.to_string());
                Ok(PartitionKey { key, subreddit: subreddit.to_string() })
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

/// Destination of a flush: one append per partition per call.
pub trait PartitionSink: Send + Sync {
    /// Partitions already present, used to seed collision detection.
    fn existing_partitions(&self) -> Result<Vec<PartitionKey>>;

    /// Append `records` (all of `key.subreddit`) as one physical operation.
    fn append(&self, key: &PartitionKey, records: &[Record]) -> Result<()>;
}

pub struct ArchiveStore {
    root: PathBuf,
    level: i32,
    write_buf: usize,
    manifest: Mutex<BTreeMap<String, String>>,
    locks: Mutex<AHashMap<String, Arc<Mutex<()>>>>,
}

impl ArchiveStore {
    /// Open (or create) an archive rooted at `root` with zstd `level`.
    pub fn open(root: &Path, level: i32) -> Result<Self> {
        fs::create_dir_all(root).with_context(|| format!("create archive root {}", root.display()))?;
        let manifest_path = root.join(MANIFEST_FILE);
        let manifest: BTreeMap<String, String> = if manifest_path.exists() {
            let f = open_with_backoff(&manifest_path, 16, 50)
                .with_context(|| format!("open {}", manifest_path.display()))?;
            serde_json::from_reader(BufReader::new(f))
                .with_context(|| format!("parse {}", manifest_path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            root: root.to_path_buf(),
            level,
            write_buf: 256 * 1024,
            manifest: Mutex::new(manifest),
            locks: Mutex::new(AHashMap::new()),
        })
    }

    /// Buffer size used when writing a frame.
    pub fn with_write_buffer(mut self, bytes: usize) -> Self {
        self.write_buf = bytes.max(1);
        self
    }

    pub fn write_buffer(&self) -> usize {
        self.write_buf
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}{PARTITION_EXT}"))
    }

    /// Known partitions, ordered by key.
    pub fn partitions(&self) -> Vec<PartitionKey> {
        self.manifest
            .lock()
            .iter()
            .map(|(k, s)| PartitionKey { key: k.clone(), subreddit: s.clone() })
            .collect()
    }

    /// Data files present on disk, whether or not the manifest knows them.
    pub fn partition_files(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.file_name().to_str().is_some_and(|n| n.ends_with(PARTITION_EXT)))
            .map(|e| e.path().to_path_buf())
            .collect();
        out.sort();
        out
    }

    /// Partition of `subreddit`, if it was ever written.
    pub fn find(&self, subreddit: &str) -> Option<PartitionKey> {
        let manifest = self.manifest.lock();
        manifest
            .iter()
            .find(|(_, s)| s.as_str() == subreddit)
            .or_else(|| manifest.iter().find(|(_, s)| s.eq_ignore_ascii_case(subreddit)))
            .map(|(k, s)| PartitionKey { key: k.clone(), subreddit: s.clone() })
    }

    /// Read back every record of one subreddit, in append order.
    pub fn read_subreddit(&self, subreddit: &str) -> Result<Vec<Record>> {
        match self.find(subreddit) {
            Some(pk) => self.read_key(&pk.key),
            None => Ok(Vec::new()),
        }
    }

    /// Stream every record of partition `key` through `on_record`.
    pub fn for_each_record(&self, key: &str, mut on_record: impl FnMut(Record) -> Result<()>) -> Result<()> {
        let path = self.partition_path(key);
        if !path.exists() {
            return Ok(());
        }
        let f = open_with_backoff(&path, 16, 50).with_context(|| format!("open {}", path.display()))?;
        // The decoder reads concatenated frames as one stream.
        let decoder = Decoder::new(f)?;
        let reader = BufReader::new(decoder);
        for (i, line) in reader.lines().enumerate() {
            let line = line.with_context(|| format!("decode {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let rec: Record = serde_json::from_str(&line)
                .with_context(|| format!("{} line {}", path.display(), i + 1))?;
            on_record(rec)?;
        }
        Ok(())
    }

    pub fn read_key(&self, key: &str) -> Result<Vec<Record>> {
        let mut out = Vec::new();
        self.for_each_record(key, |r| {
            out.push(r);
            Ok(())
        })?;
        Ok(out)
    }

    fn partition_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks.lock().entry(key.to_string()).or_default().clone()
    }

    fn register(&self, key: &PartitionKey) -> Result<()> {
        let mut manifest = self.manifest.lock();
        let owner = manifest.iter().find(|(k, _)| k.eq_ignore_ascii_case(&key.key));
        match owner {
            Some((k, s)) if k == &key.key && s == &key.subreddit => return Ok(()),
            Some((_, s)) => {
                return Err(ConfigError::PartitionKeyCollision {
                    key: key.key.clone(),
                    existing: s.clone(),
                    incoming: key.subreddit.clone(),
                }
                .into())
            }
            None => {}
        }
        manifest.insert(key.key.clone(), key.subreddit.clone());
        let tmp = self.root.join(format!("{MANIFEST_FILE}.inprogress"));
        let f = create_with_backoff(&tmp, 16, 50).with_context(|| format!("create {}", tmp.display()))?;
        let mut w = BufWriter::new(f);
        serde_json::to_writer_pretty(&mut w, &*manifest)?;
        w.flush()?;
        drop(w);
        replace_file_atomic_backoff(&tmp, &self.root.join(MANIFEST_FILE))
    }

    fn encode_frame(&self, records: &[Record]) -> Result<Vec<u8>> {
        let mut raw = Vec::with_capacity(records.len() * 160);
        for r in records {
            serde_json::to_writer(&mut raw, r)?;
            raw.push(b'\n');
        }
        Ok(zstd::stream::encode_all(&raw[..], self.level)?)
    }
}

impl PartitionSink for ArchiveStore {
    fn existing_partitions(&self) -> Result<Vec<PartitionKey>> {
        Ok(self.partitions())
    }

    fn append(&self, key: &PartitionKey, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let lock = self.partition_lock(&key.key);
        let _guard = lock.lock();

        self.register(key)?;
        let frame = self.encode_frame(records)?;
        let path = self.partition_path(&key.key);
        let file = append_with_backoff(&path, 16, 50)
            .with_context(|| format!("open {} for append", path.display()))?;
        let before = file.metadata()?.len();

        let mut w = BufWriter::with_capacity(self.write_buf, &file);
        let written = w.write_all(&frame).and_then(|_| w.flush());
        drop(w);
        if let Err(e) = written {
            // Roll back to the last complete frame.
            if let Err(trunc) = file.set_len(before) {
                tracing::error!(
                    "r/{}: could not truncate {} back to {} bytes after a failed append: {}",
                    key.subreddit,
                    path.display(),
                    before,
                    trunc
                );
            }
            return Err(e).with_context(|| format!("append to {}", path.display()));
        }
        tracing::debug!("r/{}: appended {} records to {}", key.subreddit, records.len(), path.display());
        Ok(())
    }
}
