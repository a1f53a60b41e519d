//! Response rewriting for standalone replay rendering.

use url::Url;

use crate::models::HeaderList;

use super::is_hop_by_hop;

/// Directory of the request URL (path cut after the last `/`), without query
/// or fragment.
pub fn base_href_for_url(url: &str) -> Option<String> {
    let mut parsed = Url::parse(url).ok()?;
    let dir = match parsed.path().rfind('/') {
        Some(idx) => parsed.path()[..=idx].to_string(),
        None => "/".to_string(),
    };
    parsed.set_path(&dir);
    parsed.set_query(None);
    parsed.set_fragment(None);
    Some(parsed.to_string())
}

pub fn is_html(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| ct.to_ascii_lowercase().contains("text/html"))
        .unwrap_or(false)
}

/// Resolve a `Location` value against the request URL.
pub fn rewrite_location(request_url: &str, location: &str) -> String {
    Url::parse(request_url)
        .and_then(|base| base.join(location))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| location.to_string())
}

/// Insert `<base href>` after the opening `<head>`, else before `</head>`,
/// else at the very start. Documents that already carry a `<base` tag are
/// returned untouched. Works on raw bytes so any ASCII-compatible charset
/// passes through unchanged.
pub fn inject_base_href(html: &[u8], base_href: &str) -> Vec<u8> {
    let lower = html.to_ascii_lowercase();
    if find(&lower, b"<base", 0).is_some() {
        return html.to_vec();
    }

    let tag = format!("<base href=\"{}\">", base_href.replace('"', "%22"));
    let at = open_head_end(&lower)
        .or_else(|| find(&lower, b"</head>", 0))
        .unwrap_or(0);

    let mut out = Vec::with_capacity(html.len() + tag.len());
    out.extend_from_slice(&html[..at]);
    out.extend_from_slice(tag.as_bytes());
    out.extend_from_slice(&html[at..]);
    out
}

/// Position just past the `>` of the first `<head ...>` tag. `<header>` does
/// not count.
fn open_head_end(lower: &[u8]) -> Option<usize> {
    let mut from = 0;
    while let Some(start) = find(lower, b"<head", from) {
        let after = start + b"<head".len();
        match lower.get(after) {
            Some(b'>') => return Some(after + 1),
            Some(c) if c.is_ascii_whitespace() || *c == b'/' => {
                return find(lower, b">", after).map(|end| end + 1);
            }
            _ => from = after,
        }
    }
    None
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() || needle.len() > haystack.len() - from {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|idx| idx + from)
}

/// Drop hop-by-hop and `content-encoding` headers and absolutise `Location`.
pub(super) fn filter_response_headers(headers: &[(String, String)], request_url: &str) -> HeaderList {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name) && !name.eq_ignore_ascii_case("content-encoding"))
        .map(|(name, value)| {
            if name.eq_ignore_ascii_case("location") {
                (name.clone(), rewrite_location(request_url, value))
            } else {
                (name.clone(), value.clone())
            }
        })
        .collect()
}
