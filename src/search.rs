//! Crawl-archive search endpoint: one request per page, newest first, bounded by `before`.

use crate::error::RemoteError;
use reqwest::blocking::Client;
use serde_json::Value;
use std::time::Duration;

/// One page request against the search endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchQuery {
    pub subreddit: String,
    /// Exclusive upper bound (unix seconds).
    pub before: i64,
    pub size: usize,
    /// Comma-joined allow-list, `None` to receive every field.
    pub fields: Option<String>,
}

impl SearchQuery {
    pub fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut p = vec![
            ("subreddit", self.subreddit.clone()),
            ("sort", "desc".to_string()),
            ("sort_type", "created_utc".to_string()),
            ("size", self.size.to_string()),
            ("before", self.before.to_string()),
        ];
        if let Some(f) = &self.fields {
            p.push(("fields", f.clone()));
        }
        p
    }
}

/// Anything that can answer a page query with raw record objects.
pub trait SearchApi {
    fn search(&self, query: &SearchQuery) -> Result<Vec<Value>, RemoteError>;
}

impl<T: SearchApi + ?Sized> SearchApi for &T {
    fn search(&self, query: &SearchQuery) -> Result<Vec<Value>, RemoteError> {
        (**self).search(query)
    }
}

/// Blocking HTTP client for the public search endpoint.
pub struct PushshiftClient {
    client: Client,
    base_url: String,
}

impl PushshiftClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("subharvest/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, base_url: base_url.into() })
    }
}

impl SearchApi for PushshiftClient {
    fn search(&self, query: &SearchQuery) -> Result<Vec<Value>, RemoteError> {
        let resp = self.client.get(&self.base_url).query(&query.to_params()).send()?;
        let status = resp.status();
        let body = resp.text()?;
        if !status.is_success() {
            // The service answers overload with 429/5xx and the occasional 4xx; all transient.
            return Err(RemoteError::retryable(format!("search returned HTTP {status}")));
        }
        parse_search_body(&body)
    }
}

/// Pull the `data` array out of a search response. A body without it is an
/// error page served under load, so it is retryable like a network failure.
pub fn parse_search_body(body: &str) -> Result<Vec<Value>, RemoteError> {
    let v: Value = serde_json::from_str(body)
        .map_err(|e| RemoteError::retryable(format!("malformed search body: {e}")))?;
    match v {
        Value::Object(mut obj) => match obj.remove("data") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(RemoteError::retryable("search body has no `data` array")),
        },
        _ => Err(RemoteError::retryable("search body is not a JSON object")),
    }
}
