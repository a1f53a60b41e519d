//! Ingest gateway
//!
//! Accepts one envelope per completed exchange from the capturing agent,
//! normalises the record, writes it through the [`FlowStore`] and only then
//! announces it on the [`EventBus`]. A failed write publishes nothing.

mod preview;

pub use preview::{
    charset_from_content_type, collapse_cookies, decode_text, preview_text, truncate_chars,
    MAX_FORMAT_BYTES, MAX_PREVIEW_CHARS, MAX_REQUEST_BODY, MAX_RESPONSE_BODY,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{CoreError, CoreResult};
use crate::events::EventBus;
use crate::models::{header_value, Flow, FlowSummary, HeaderList, ResponseBodyOverride};
use crate::storage::FlowStore;

/// Agent → core message. Unknown `type` values and extra keys are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case", deny_unknown_fields)]
pub enum IngestEnvelope {
    Flow(FlowRecord),
}

impl IngestEnvelope {
    pub fn from_slice(raw: &[u8]) -> CoreResult<Self> {
        serde_json::from_slice(raw).map_err(|e| CoreError::InvalidPayload(e.to_string()))
    }
}

/// Compact flow record as sent by the agent, with the response body inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowRecord {
    pub id: String,
    pub ts: f64,
    #[serde(default)]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub req_headers: HeaderList,
    #[serde(default)]
    pub resp_headers: HeaderList,
    #[serde(default)]
    pub req_size: u64,
    #[serde(default)]
    pub resp_size: u64,
    #[serde(default)]
    pub req_body_b64: Option<String>,
    #[serde(default)]
    pub req_preview: Option<String>,
    #[serde(default)]
    pub resp_preview: Option<String>,
    #[serde(default)]
    pub resp_body_b64: Option<String>,
}

impl FlowRecord {
    fn validate(&self) -> CoreResult<()> {
        if self.id.trim().is_empty() {
            return Err(CoreError::InvalidPayload("flow id is required".to_string()));
        }
        if self.url.trim().is_empty() {
            return Err(CoreError::InvalidPayload("flow url is required".to_string()));
        }
        if !self.ts.is_finite() {
            return Err(CoreError::InvalidPayload("ts must be a finite number".to_string()));
        }
        if let Some(duration) = self.duration {
            if !duration.is_finite() || duration < 0.0 {
                return Err(CoreError::InvalidPayload(
                    "duration must be a non-negative number".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Validate and split into the stored flow and its response body.
    pub fn normalize(self) -> CoreResult<(Flow, ResponseBodyOverride)> {
        self.validate()?;

        let method = match self.method.trim() {
            "" => "GET".to_string(),
            m => m.to_ascii_uppercase(),
        };
        let request_headers = collapse_cookies(self.req_headers);

        let request_bytes = self
            .req_body_b64
            .as_deref()
            .and_then(|encoded| decode_body(encoded, MAX_REQUEST_BODY, "request"));
        let request_body = request_bytes.as_ref().and(self.req_body_b64);
        let request_preview = match self.req_preview {
            Some(preview) => Some(truncate_chars(&preview, MAX_PREVIEW_CHARS)),
            None => request_bytes.as_deref().and_then(|bytes| {
                preview_text(bytes, header_value(&request_headers, "content-type"))
            }),
        };

        let response_bytes = self
            .resp_body_b64
            .as_deref()
            .and_then(|encoded| decode_body(encoded, MAX_RESPONSE_BODY, "response"));
        let response_content_type = header_value(&self.resp_headers, "content-type");
        let response_preview = match self.resp_preview {
            Some(preview) => Some(truncate_chars(&preview, MAX_PREVIEW_CHARS)),
            None => response_bytes
                .as_deref()
                .and_then(|bytes| preview_text(bytes, response_content_type)),
        };
        let body = match &response_bytes {
            Some(bytes) => ResponseBodyOverride {
                body_b64: self.resp_body_b64,
                body_text: Some(decode_text(
                    bytes,
                    &charset_from_content_type(response_content_type),
                )),
            },
            None => ResponseBodyOverride::default(),
        };

        let flow = Flow {
            id: self.id,
            timestamp: self.ts,
            method,
            url: self.url,
            host: self.host.filter(|h| !h.is_empty()),
            path: self.path,
            status: self.status,
            duration: self.duration,
            request_headers,
            response_headers: self.resp_headers,
            request_size: self.req_size,
            response_size: self.resp_size,
            request_body,
            request_preview,
            response_preview,
        };
        Ok((flow, body))
    }
}

/// Decoded, non-empty body within `cap`, or `None`.
fn decode_body(encoded: &str, cap: usize, which: &str) -> Option<Vec<u8>> {
    if encoded.is_empty() {
        return None;
    }
    match STANDARD.decode(encoded) {
        Ok(bytes) if bytes.is_empty() => None,
        Ok(bytes) if bytes.len() > cap => {
            tracing::debug!("Dropping {} body of {} bytes (cap {})", which, bytes.len(), cap);
            None
        }
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::warn!("Ignoring undecodable {} body: {}", which, e);
            None
        }
    }
}

/// Write-then-publish glue between the agent, the store and the bus.
#[derive(Clone)]
pub struct IngestGateway {
    store: Arc<FlowStore>,
    bus: EventBus,
}

impl IngestGateway {
    pub fn new(store: Arc<FlowStore>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    pub async fn ingest(&self, envelope: IngestEnvelope) -> CoreResult<FlowSummary> {
        match envelope {
            IngestEnvelope::Flow(record) => self.ingest_flow(record).await,
        }
    }

    /// Decode a raw JSON envelope and ingest it.
    pub async fn ingest_json(&self, raw: &[u8]) -> CoreResult<FlowSummary> {
        self.ingest(IngestEnvelope::from_slice(raw)?).await
    }

    async fn ingest_flow(&self, record: FlowRecord) -> CoreResult<FlowSummary> {
        let (flow, body) = record.normalize()?;
        let pending = flow.summary(0);

        let seq = self.store.upsert(flow, body).await?;
        let summary = FlowSummary { seq, ..pending };

        let delivered = self.bus.publish_summary(summary.clone());
        tracing::debug!(
            "Ingested flow {} (seq {}), delivered to {} subscribers",
            summary.id,
            seq,
            delivered
        );
        Ok(summary)
    }
}
