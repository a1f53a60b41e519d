//! Replay and repeat request/response models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::HeaderList;

/// Captured request registered for re-issue through the browser.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayEntry {
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub method: String,
    pub url: String,
    /// Hop-by-hop headers already stripped
    pub headers: HeaderList,
    pub body: Vec<u8>,
}

/// Body of a replay open request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplayOpenRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HeaderList,
    /// Text body, used when `body_b64` is absent
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub body_b64: Option<String>,
}

/// Addresses handed back after a replay was opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayTicket {
    #[serde(skip)]
    pub token: String,
    /// Server-relative execution path
    pub url: String,
    /// Original URL with the token appended, only for bodiless GETs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_url: Option<String>,
}

/// Replay spec as read back by the capturing agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaySpec {
    pub method: String,
    pub url: String,
    pub headers: HeaderList,
    pub body: String,
}

impl From<&ReplayEntry> for ReplaySpec {
    fn from(entry: &ReplayEntry) -> Self {
        Self {
            method: entry.method.clone(),
            url: entry.url.clone(),
            headers: entry.headers.clone(),
            body: String::from_utf8_lossy(&entry.body).into_owned(),
        }
    }
}

/// Upstream response from a replay execution, ready to hand to the browser.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayResponse {
    pub status: u16,
    pub headers: HeaderList,
    pub body: Vec<u8>,
}

/// One-shot repeat input. Headers and body are free text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepeatRequest {
    #[serde(default = "default_repeat_method")]
    pub method: String,
    pub url: String,
    /// One `Name: value` per line
    #[serde(default)]
    pub headers: String,
    #[serde(default)]
    pub body: String,
}

fn default_repeat_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatResponse {
    pub status: u16,
    pub headers: String,
    pub preview: String,
    pub body_first64k_b64: String,
    pub bytes: u64,
}
