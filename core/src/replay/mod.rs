//! Request replay
//!
//! A captured request is registered in the [`ReplayCache`] under a random,
//! short-lived token. The token can then be resolved by the capturing agent
//! (which re-issues the request from inside the browser session) or executed
//! directly by [`ReplayCache::fetch`], which proxies the upstream response
//! back with enough rewriting for the page to render standalone.

mod repeat;
mod rewrite;
mod upstream;

pub use repeat::{headers_list_to_text, parse_headers_text, repeat};
pub use rewrite::{base_href_for_url, inject_base_href, is_html, rewrite_location};
pub use upstream::{UpstreamClient, UpstreamResponse, DEFAULT_UPSTREAM_TIMEOUT};

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use url::Url;

use crate::error::{CoreError, CoreResult};
use crate::models::{HeaderList, ReplayEntry, ReplayOpenRequest, ReplayResponse, ReplayTicket};

/// Reserved query parameter carrying a replay token on browser URLs.
pub const REPLAY_PARAM: &str = "__nsp";

pub const DEFAULT_REPLAY_TTL: Duration = Duration::from_secs(60);

/// Stripped from stored replay requests and from repeat request headers.
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

const TOKEN_BYTES: usize = 16;

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// In-memory token → request map with lazy TTL pruning.
pub struct ReplayCache {
    entries: Mutex<HashMap<String, ReplayEntry>>,
    ttl: chrono::Duration,
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_TTL)
    }
}

impl ReplayCache {
    pub fn new(ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60));
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Register a request and hand back its token.
    pub fn open(
        &self,
        method: &str,
        url: &str,
        headers: HeaderList,
        body: Vec<u8>,
    ) -> CoreResult<ReplayTicket> {
        self.open_at(method, url, headers, body, Utc::now())
    }

    /// Decode an open request from the wire (text or base64 body) and register it.
    pub fn open_request(&self, request: ReplayOpenRequest) -> CoreResult<ReplayTicket> {
        let body = match request.body_b64.as_deref().filter(|b| !b.is_empty()) {
            Some(encoded) => STANDARD
                .decode(encoded.trim())
                .map_err(|_| CoreError::InvalidPayload("invalid body_b64".to_string()))?,
            None => request.body.into_bytes(),
        };
        self.open(&request.method, &request.url, request.headers, body)
    }

    pub fn open_at(
        &self,
        method: &str,
        url: &str,
        headers: HeaderList,
        body: Vec<u8>,
        now: DateTime<Utc>,
    ) -> CoreResult<ReplayTicket> {
        let url = url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(CoreError::InvalidPayload(
                "url must start with http:// or https://".to_string(),
            ));
        }
        let method = method.trim().to_ascii_uppercase();
        if method.is_empty() {
            return Err(CoreError::InvalidPayload("method is required".to_string()));
        }

        let token = generate_token();
        let browser_url = if method == "GET" && body.is_empty() {
            browser_url(url, &token)
        } else {
            None
        };

        let entry = ReplayEntry {
            token: token.clone(),
            created_at: now,
            method,
            url: url.to_string(),
            headers: headers
                .into_iter()
                .filter(|(name, _)| !is_hop_by_hop(name))
                .collect(),
            body,
        };

        {
            let mut entries = self.lock();
            prune(&mut entries, now, self.ttl);
            entries.insert(token.clone(), entry);
        }
        tracing::debug!("Opened replay token for {}", url);

        Ok(ReplayTicket {
            url: format!("/replay/{token}"),
            token,
            browser_url,
        })
    }

    /// Look up a live entry. Tokens may be resolved any number of times
    /// within their lifetime.
    pub fn resolve(&self, token: &str) -> CoreResult<ReplayEntry> {
        self.resolve_at(token, Utc::now())
    }

    pub fn resolve_at(&self, token: &str, now: DateTime<Utc>) -> CoreResult<ReplayEntry> {
        let mut entries = self.lock();
        prune(&mut entries, now, self.ttl);
        entries
            .get(token)
            .cloned()
            .ok_or_else(|| CoreError::not_found("replay token"))
    }

    /// Resolve the token and execute the stored request upstream.
    pub async fn fetch(&self, token: &str, client: &UpstreamClient) -> CoreResult<ReplayResponse> {
        let entry = self.resolve(token)?;
        client.execute_replay(&entry).await
    }

    /// Entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ReplayEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// Entries are still valid at exactly `ttl`.
fn prune(entries: &mut HashMap<String, ReplayEntry>, now: DateTime<Utc>, ttl: chrono::Duration) {
    let before = entries.len();
    entries.retain(|_, entry| now.signed_duration_since(entry.created_at) <= ttl);
    let pruned = before - entries.len();
    if pruned > 0 {
        tracing::trace!("Pruned {} expired replay tokens", pruned);
    }
}

fn generate_token() -> String {
    let bytes: [u8; TOKEN_BYTES] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Original URL with the token appended as [`REPLAY_PARAM`].
fn browser_url(url: &str, token: &str) -> Option<String> {
    let mut parsed = Url::parse(url).ok()?;
    parsed.query_pairs_mut().append_pair(REPLAY_PARAM, token);
    Some(parsed.to_string())
}

/// Split a replay token out of a browser URL. Returns the token and the URL
/// with the reserved parameter removed, or `None` when it is not present.
pub fn strip_replay_param(url: &str) -> Option<(String, String)> {
    let mut parsed = Url::parse(url).ok()?;
    let mut token = None;
    let remaining: Vec<(String, String)> = parsed
        .query_pairs()
        .into_owned()
        .filter(|(key, value)| {
            if key == REPLAY_PARAM {
                token.get_or_insert_with(|| value.clone());
                false
            } else {
                true
            }
        })
        .collect();
    let token = token?;

    if remaining.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(remaining);
    }
    Some((token, parsed.to_string()))
}
