//! Authenticated bulk lookup of live submission stats (`/api/info`).

use crate::config::Credentials;
use crate::date::now_unix;
use crate::error::RemoteError;
use parking_lot::Mutex;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::{Duration, Instant};

const TOKEN_URL: &str = "https://www.reddit.com/api/v1/access_token";
const INFO_URL: &str = "https://oauth.reddit.com/api/info";
/// Refresh this long before the advertised expiry.
const TOKEN_SLACK: Duration = Duration::from_secs(60);

/// Authoritative engagement numbers for one submission at lookup time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiveStats {
    /// Base id, without the `t3_` prefix.
    pub id: String,
    pub score: i64,
    pub num_comments: i64,
    pub time_updated: i64,
}

/// Bulk lookup by fullname. Results may come back in any order and may omit ids.
pub trait LookupApi {
    fn info(&self, fullnames: &[String]) -> Result<Vec<LiveStats>, RemoteError>;
}

impl<T: LookupApi + ?Sized> LookupApi for &T {
    fn info(&self, fullnames: &[String]) -> Result<Vec<LiveStats>, RemoteError> {
        (**self).info(fullnames)
    }
}

struct BearerToken {
    value: String,
    expires_at: Instant,
}

/// OAuth password-grant session against the official API.
pub struct RedditClient {
    client: Client,
    creds: Credentials,
    token: Mutex<Option<BearerToken>>,
}

impl RedditClient {
    pub fn new(creds: Credentials, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).user_agent(creds.user_agent.clone()).build()?;
        Ok(Self { client, creds, token: Mutex::new(None) })
    }

    fn bearer(&self) -> Result<String, RemoteError> {
        let mut guard = self.token.lock();
        if let Some(tok) = guard.as_ref() {
            if Instant::now() + TOKEN_SLACK < tok.expires_at {
                return Ok(tok.value.clone());
            }
        }
        let fresh = self.request_token()?;
        let value = fresh.value.clone();
        *guard = Some(fresh);
        Ok(value)
    }

    fn request_token(&self) -> Result<BearerToken, RemoteError> {
        #[derive(Deserialize)]
        struct TokenBody {
            access_token: Option<String>,
            expires_in: Option<u64>,
            error: Option<String>,
        }

        let resp = self
            .client
            .post(TOKEN_URL)
            .basic_auth(&self.creds.client_id, Some(&self.creds.client_secret))
            .form(&[
                ("grant_type", "password"),
                ("username", self.creds.username.as_str()),
                ("password", self.creds.password.as_str()),
            ])
            .send()?;
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RemoteError::fatal(format!("token request rejected with HTTP {status}; check client_id/client_secret")));
        }
        if !status.is_success() {
            return Err(RemoteError::retryable(format!("token request returned HTTP {status}")));
        }
        let body: TokenBody = resp.json()?;
        if let Some(err) = body.error {
            // invalid_grant and friends: the credentials file is wrong.
            return Err(RemoteError::fatal(format!("token request refused: {err}")));
        }
        let value = body
            .access_token
            .ok_or_else(|| RemoteError::retryable("token response without access_token"))?;
        tracing::info!("obtained API token for u/{}", self.creds.username);
        Ok(BearerToken {
            value,
            expires_at: Instant::now() + Duration::from_secs(body.expires_in.unwrap_or(3600)),
        })
    }
}

impl LookupApi for RedditClient {
    fn info(&self, fullnames: &[String]) -> Result<Vec<LiveStats>, RemoteError> {
        let token = self.bearer()?;
        let resp = self
            .client
            .get(INFO_URL)
            .bearer_auth(token)
            .query(&[("id", fullnames.join(",")), ("raw_json", "1".to_string())])
            .send()?;
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            // Expired or revoked; drop it so the retry fetches a new one.
            *self.token.lock() = None;
            return Err(RemoteError::retryable("lookup returned 401, token refreshed"));
        }
        if !status.is_success() {
            return Err(RemoteError::retryable(format!("lookup returned HTTP {status}")));
        }
        let body = resp.text()?;
        parse_info_body(&body, now_unix())
    }
}

/// Extract `(id, score, num_comments)` from an `/api/info` listing.
pub fn parse_info_body(body: &str, time_updated: i64) -> Result<Vec<LiveStats>, RemoteError> {
    #[derive(Deserialize)]
    struct Listing {
        data: ListingData,
    }
    #[derive(Deserialize)]
    struct ListingData {
        children: Vec<Child>,
    }
    #[derive(Deserialize)]
    struct Child {
        data: ChildData,
    }
    #[derive(Deserialize)]
    struct ChildData {
        id: String,
        #[serde(default)]
        score: i64,
        #[serde(default)]
        num_comments: i64,
    }

    let listing: Listing = serde_json::from_str(body)
        .map_err(|e| RemoteError::retryable(format!("malformed lookup body: {e}")))?;
    Ok(listing
        .data
        .children
        .into_iter()
        .map(|c| LiveStats {
            id: c.data.id,
            score: c.data.score,
            num_comments: c.data.num_comments,
            time_updated,
        })
        .collect())
}
