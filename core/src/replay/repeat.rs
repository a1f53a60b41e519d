//! One-shot repeat: send an edited request and report a compact result.
//! Nothing is persisted.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::{CoreError, CoreResult};
use crate::models::{HeaderList, RepeatRequest, RepeatResponse};

use super::{is_hop_by_hop, UpstreamClient};

const PREVIEW_BYTES: usize = 8192;
const BODY_PREFIX_BYTES: usize = 65536;

/// Parse `Name: value` lines. Lines without a colon and hop-by-hop headers
/// are skipped.
pub fn parse_headers_text(text: &str) -> HeaderList {
    text.lines()
        .map(str::trim)
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim(), value.trim()))
        .filter(|(key, _)| !key.is_empty() && !is_hop_by_hop(key))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

pub fn headers_list_to_text(headers: &[(String, String)]) -> String {
    headers
        .iter()
        .map(|(key, value)| format!("{key}: {value}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub async fn repeat(client: &UpstreamClient, request: RepeatRequest) -> CoreResult<RepeatResponse> {
    let url = request.url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(CoreError::InvalidPayload(
            "url must start with http:// or https://".to_string(),
        ));
    }
    let method = match request.method.trim() {
        "" => "GET".to_string(),
        m => m.to_ascii_uppercase(),
    };
    let headers = parse_headers_text(&request.headers);

    let response = client
        .send(&method, url, &headers, request.body.into_bytes())
        .await?;
    let raw = &response.body;

    Ok(RepeatResponse {
        status: response.status,
        headers: headers_list_to_text(&response.headers),
        preview: String::from_utf8_lossy(&raw[..raw.len().min(PREVIEW_BYTES)]).into_owned(),
        body_first64k_b64: STANDARD.encode(&raw[..raw.len().min(BODY_PREFIX_BYTES)]),
        bytes: raw.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_text_parsing_skips_noise() {
        let parsed = parse_headers_text(
            "Accept: */*\n\
             garbage line\n\
             Connection: close\n\
             \n\
             X-Trace:  a:b:c  \r\n\
             : empty-name",
        );
        assert_eq!(
            parsed,
            vec![
                ("Accept".to_string(), "*/*".to_string()),
                ("X-Trace".to_string(), "a:b:c".to_string()),
            ]
        );
    }

    #[test]
    fn header_list_renders_one_per_line() {
        let text = headers_list_to_text(&[
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ]);
        assert_eq!(text, "a: 1\nb: 2");
    }

    #[tokio::test]
    async fn repeat_rejects_non_http_url() {
        let client = UpstreamClient::new(std::time::Duration::from_secs(1)).unwrap();
        let err = repeat(
            &client,
            RepeatRequest {
                method: "GET".into(),
                url: "file:///etc/passwd".into(),
                headers: String::new(),
                body: String::new(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidPayload(_)));
    }
}
