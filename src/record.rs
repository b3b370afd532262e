//! The typed submission record and the field allow-list it is built from.

use crate::error::{ConfigError, RecordError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One Reddit submission as kept by the harvester. Anything the crawl returns
/// beyond these fields is dropped when the record is built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub subreddit: String,
    #[serde(default)]
    pub author: Option<String>,
    pub created_utc: i64,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub num_comments: i64,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub stickied: bool,
    /// Unix seconds of the live lookup that refreshed `score`/`num_comments`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_updated: Option<i64>,
}

/// Records handed between pipeline stages in one piece.
pub type RecordBatch = Vec<Record>;

/// Column order used by flat files and by the crawl `fields` parameter.
pub const FIELDS: [&str; 9] = [
    "id",
    "subreddit",
    "author",
    "created_utc",
    "score",
    "num_comments",
    "domain",
    "stickied",
    "time_updated",
];

/// Fields without which a record cannot be keyed, partitioned or paged.
pub const REQUIRED_FIELDS: [&str; 3] = ["id", "subreddit", "created_utc"];

/// Fields that only exist locally; never requested from the crawl API.
const LOCAL_FIELDS: [&str; 1] = ["time_updated"];

impl Record {
    /// Build a record from one raw crawl/dump object.
    ///
    /// `created_utc` is accepted as integer, float or numeric string (older crawl
    /// data mixes all three). Missing engagement fields default to zero, a missing
    /// `author` stays `None`; only the keying fields are mandatory.
    pub fn from_value(v: &Value) -> Result<Self, RecordError> {
        let obj = v.as_object().ok_or(RecordError::NotAnObject)?;

        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or(RecordError::Field("id"))?
            .to_string();
        let subreddit = obj
            .get("subreddit")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or(RecordError::Field("subreddit"))?
            .to_string();
        let created_utc = obj
            .get("created_utc")
            .and_then(as_epoch)
            .ok_or(RecordError::Field("created_utc"))?;

        let author = obj.get("author").and_then(Value::as_str).map(str::to_string);
        let score = obj.get("score").and_then(as_int).unwrap_or(0);
        let num_comments = obj.get("num_comments").and_then(as_int).unwrap_or(0);
        let domain = obj
            .get("domain")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let stickied = obj.get("stickied").and_then(Value::as_bool).unwrap_or(false)
            || obj.get("pinned").and_then(Value::as_bool).unwrap_or(false);
        let time_updated = obj.get("time_updated").and_then(as_epoch);

        Ok(Self {
            id,
            subreddit,
            author,
            created_utc,
            score,
            num_comments,
            domain,
            stickied,
            time_updated,
        })
    }

    /// `t3_`-prefixed id used by the authenticated lookup endpoint.
    pub fn fullname(&self) -> String {
        fullname(&self.id)
    }

    /// Rough heap + inline footprint, used for the writer's memory budget.
    pub fn estimated_bytes(&self) -> u64 {
        let inline = std::mem::size_of::<Record>();
        let heap = self.id.len()
            + self.subreddit.len()
            + self.author.as_ref().map_or(0, String::len)
            + self.domain.len();
        (inline + heap) as u64
    }
}

/// Sum of `estimated_bytes` over a batch.
pub fn estimated_batch_bytes(batch: &[Record]) -> u64 {
    batch.iter().map(Record::estimated_bytes).sum()
}

pub fn fullname(id: &str) -> String {
    if id.starts_with("t3_") {
        id.to_string()
    } else {
        format!("t3_{id}")
    }
}

/// Parse a page of raw objects, quarantining the ones that do not fit.
/// Returns the typed records and the number of rejected objects.
pub fn parse_records(values: &[Value]) -> (RecordBatch, usize) {
    let mut out = Vec::with_capacity(values.len());
    let mut rejected = 0usize;
    for v in values {
        match Record::from_value(v) {
            Ok(r) => out.push(r),
            Err(e) => {
                rejected += 1;
                tracing::warn!("quarantined record: {} ({})", e, compact_preview(v));
            }
        }
    }
    (out, rejected)
}

fn compact_preview(v: &Value) -> String {
    let s = v.to_string();
    if s.len() <= 160 {
        s
    } else {
        let mut end = 160;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

fn as_int(v: &Value) -> Option<i64> {
    v.as_i64().or_else(|| v.as_f64().map(|f| f as i64))
}

pub(crate) fn as_epoch(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .ok()
            .or_else(|| s.trim().parse::<f64>().ok().map(|f| f as i64)),
        _ => None,
    }
}

/// Validated subset of `FIELDS` requested from the crawl API.
/// The keying fields are always included.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldSelector {
    fields: Vec<String>,
}

impl Default for FieldSelector {
    fn default() -> Self {
        Self::all()
    }
}

impl FieldSelector {
    pub fn all() -> Self {
        Self {
            fields: FIELDS
                .iter()
                .filter(|f| !LOCAL_FIELDS.contains(f))
                .map(|f| f.to_string())
                .collect(),
        }
    }

    pub fn new<I, S>(fields: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out: Vec<String> = REQUIRED_FIELDS.iter().map(|f| f.to_string()).collect();
        for f in fields {
            let f = f.as_ref().trim();
            if !FIELDS.contains(&f) {
                return Err(ConfigError::UnknownField(f.to_string()));
            }
            if LOCAL_FIELDS.contains(&f) {
                continue;
            }
            if !out.iter().any(|x| x == f) {
                out.push(f.to_string());
            }
        }
        // Keep the canonical column order regardless of how they were given.
        out.sort_by_key(|f| FIELDS.iter().position(|c| c == f));
        Ok(Self { fields: out })
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Comma-joined form for the `fields` query parameter.
    pub fn to_query_value(&self) -> String {
        self.fields.join(",")
    }
}
