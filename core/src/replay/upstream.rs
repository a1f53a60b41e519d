use bytes::Bytes;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{redirect, Client, Method};
use std::time::{Duration, Instant};

use crate::error::{CoreError, CoreResult};
use crate::models::{header_value, HeaderList, ReplayEntry, ReplayResponse};

use super::rewrite::{base_href_for_url, filter_response_headers, inject_base_href, is_html};

pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(20);

/// Raw upstream exchange result.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderList,
    pub body: Bytes,
}

/// Outbound HTTP client for repeat and replay. Never follows redirects.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client,
}

impl UpstreamClient {
    pub fn new(timeout: Duration) -> CoreResult<Self> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::Upstream(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Issue one request and buffer the whole response.
    pub async fn send(
        &self,
        method: &str,
        url: &str,
        headers: &[(String, String)],
        body: Vec<u8>,
    ) -> CoreResult<UpstreamResponse> {
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| CoreError::InvalidPayload(format!("invalid HTTP method {:?}", method)))?;

        let mut request_builder = self.client.request(method.clone(), url);
        for (key, value) in headers {
            // The client negotiates and decodes content encodings itself.
            if key.eq_ignore_ascii_case("accept-encoding") {
                continue;
            }
            if let Ok(header_name) = HeaderName::try_from(key.as_str()) {
                if let Ok(header_value) = HeaderValue::from_str(value) {
                    request_builder = request_builder.header(header_name, header_value);
                }
            }
        }
        if !body.is_empty() {
            request_builder = request_builder.body(body);
        }

        let started = Instant::now();
        let response = request_builder.send().await.map_err(|e| {
            tracing::warn!("Upstream {} {} failed: {}", method, url, e);
            CoreError::from(e)
        })?;

        let status = response.status().as_u16();
        let headers: HeaderList = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response.bytes().await.map_err(CoreError::from)?;

        tracing::debug!(
            "Upstream {} {} -> {} ({} bytes, {} ms)",
            method,
            url,
            status,
            body.len(),
            started.elapsed().as_millis()
        );

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }

    /// Execute a stored replay and shape the response for a browser tab.
    pub async fn execute_replay(&self, entry: &ReplayEntry) -> CoreResult<ReplayResponse> {
        let upstream = self
            .send(&entry.method, &entry.url, &entry.headers, entry.body.clone())
            .await?;

        let mut body = upstream.body.to_vec();
        if is_html(header_value(&upstream.headers, "content-type")) {
            if let Some(base_href) = base_href_for_url(&entry.url) {
                body = inject_base_href(&body, &base_href);
            }
        }

        Ok(ReplayResponse {
            status: upstream.status,
            headers: filter_response_headers(&upstream.headers, &entry.url),
            body,
        })
    }
}
