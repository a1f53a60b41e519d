//! Captured flow model
//!
//! A flow is a single HTTP request/response exchange as delivered by the
//! capturing agent. Field names on the wire follow the agent's compact record.

use serde::{Deserialize, Serialize};

/// Ordered header list. Duplicate names are kept in order.
pub type HeaderList = Vec<(String, String)>;

/// Full captured exchange, minus the stored response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    /// Unique identifier assigned by the capturing agent
    pub id: String,
    /// Capture start, seconds since epoch
    #[serde(rename = "ts")]
    pub timestamp: f64,
    pub method: String,
    pub url: String,
    pub host: Option<String>,
    pub path: Option<String>,
    /// Absent if the response never completed
    pub status: Option<u16>,
    /// Seconds, only when the response completed after the request started
    pub duration: Option<f64>,
    #[serde(rename = "req_headers", default)]
    pub request_headers: HeaderList,
    #[serde(rename = "resp_headers", default)]
    pub response_headers: HeaderList,
    /// Raw wire size, pre-decompression
    #[serde(rename = "req_size", default)]
    pub request_size: u64,
    #[serde(rename = "resp_size", default)]
    pub response_size: u64,
    /// Base64 request payload, omitted above the request body cap
    #[serde(rename = "req_body_b64", default)]
    pub request_body: Option<String>,
    #[serde(rename = "req_preview", default)]
    pub request_preview: Option<String>,
    #[serde(rename = "resp_preview", default)]
    pub response_preview: Option<String>,
}

impl Flow {
    /// Project the scalar fields into a listing row.
    pub fn summary(&self, seq: i64) -> FlowSummary {
        FlowSummary {
            seq,
            id: self.id.clone(),
            timestamp: self.timestamp,
            method: self.method.clone(),
            url: self.url.clone(),
            host: self.host.clone(),
            path: self.path.clone(),
            status: self.status,
            duration: self.duration,
            request_size: self.request_size,
            response_size: self.response_size,
        }
    }

    /// First value of a response header, case-insensitive.
    pub fn response_header(&self, name: &str) -> Option<&str> {
        header_value(&self.response_headers, name)
    }
}

/// Stored response body that travels next to a [`Flow`] on upsert.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseBodyOverride {
    /// Base64 payload as captured
    pub body_b64: Option<String>,
    /// Lossy text rendering used for body search
    pub body_text: Option<String>,
}

/// Fixed projection of a [`Flow`] used for listings and live events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSummary {
    /// Store-assigned, stable across updates in place
    pub seq: i64,
    pub id: String,
    #[serde(rename = "ts")]
    pub timestamp: f64,
    pub method: String,
    pub url: String,
    pub host: Option<String>,
    pub path: Option<String>,
    pub status: Option<u16>,
    pub duration: Option<f64>,
    #[serde(rename = "req_size")]
    pub request_size: u64,
    #[serde(rename = "resp_size")]
    pub response_size: u64,
}

/// Full stored response body returned by the body endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseBody {
    pub body_b64: String,
    pub content_type: Option<String>,
    pub bytes: u64,
}

/// Columns a listing can be ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SortKey {
    /// Insertion order (sequence number)
    #[serde(rename = "num")]
    Seq,
    #[serde(rename = "method")]
    Method,
    #[serde(rename = "url")]
    Url,
    /// Nulls first
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "size")]
    ResponseSize,
    /// Nulls first
    #[serde(rename = "time")]
    Duration,
    #[default]
    #[serde(rename = "ts")]
    Timestamp,
}

impl SortKey {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "num" => Some(SortKey::Seq),
            "method" => Some(SortKey::Method),
            "url" => Some(SortKey::Url),
            "status" => Some(SortKey::Status),
            "size" => Some(SortKey::ResponseSize),
            "time" => Some(SortKey::Duration),
            "ts" | "timestamp" => Some(SortKey::Timestamp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "asc" => Some(SortOrder::Asc),
            "desc" => Some(SortOrder::Desc),
            _ => None,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Discrete field filters accepted by older viewers. All set fields are ANDed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    /// Substring over url and both previews
    pub q: Option<String>,
    /// Exact host
    pub host: Option<String>,
    pub method: Option<String>,
    pub status: Option<u16>,
    pub url_contains: Option<String>,
    /// Substring over request preview and response body text
    pub body_contains: Option<String>,
    pub duration_min: Option<f64>,
    pub duration_max: Option<f64>,
    pub resp_size_min: Option<u64>,
    pub resp_size_max: Option<u64>,
}

impl FieldFilter {
    pub fn is_empty(&self) -> bool {
        *self == FieldFilter::default()
    }
}

/// Row filter: an optional free-form predicate plus structured fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowFilter {
    /// Boolean expression over the stored columns
    pub predicate: Option<String>,
    pub fields: FieldFilter,
}

impl FlowFilter {
    pub fn predicate(predicate: impl Into<String>) -> Self {
        Self {
            predicate: Some(predicate.into()),
            fields: FieldFilter::default(),
        }
    }
}

pub const MAX_QUERY_LIMIT: u32 = 2000;
pub const DEFAULT_QUERY_LIMIT: u32 = 200;

/// Paged, sorted listing request.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowQuery {
    /// 1..=2000
    pub limit: u32,
    pub offset: u64,
    pub filter: FlowFilter,
    pub sort: SortKey,
    pub order: SortOrder,
}

impl Default for FlowQuery {
    fn default() -> Self {
        Self {
            limit: DEFAULT_QUERY_LIMIT,
            offset: 0,
            filter: FlowFilter::default(),
            sort: SortKey::default(),
            order: SortOrder::default(),
        }
    }
}

/// Event pushed to live observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum FlowEvent {
    Flow(FlowSummary),
}

pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}
