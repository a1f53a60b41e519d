//! Body text previews, header normalisation and size caps.

use encoding_rs::{Encoding, UTF_8};

use crate::models::HeaderList;

/// Longest preview kept, in characters.
pub const MAX_PREVIEW_CHARS: usize = 8192;
/// Request bodies above this decoded size are not stored.
pub const MAX_REQUEST_BODY: usize = 256 * 1024;
/// Response bodies above this decoded size are not stored.
pub const MAX_RESPONSE_BODY: usize = 2 * 1024 * 1024;
/// JSON bodies up to this size are pretty-printed for the preview.
pub const MAX_FORMAT_BYTES: usize = 256 * 1024;

const DEFAULT_CHARSET: &str = "utf-8";

/// Charset parameter of a `Content-Type`, lower-cased, defaulting to utf-8.
pub fn charset_from_content_type(content_type: Option<&str>) -> String {
    let Some(content_type) = content_type else {
        return DEFAULT_CHARSET.to_string();
    };
    let lower = content_type.to_ascii_lowercase();
    let Some(idx) = lower.find("charset=") else {
        return DEFAULT_CHARSET.to_string();
    };

    let value = lower[idx + "charset=".len()..]
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .trim_matches(|c| c == '"' || c == '\'');
    if value.is_empty() {
        DEFAULT_CHARSET.to_string()
    } else {
        value.to_string()
    }
}

/// Decode with replacement using the declared charset. Unknown labels fall
/// back to UTF-8.
pub fn decode_text(data: &[u8], charset: &str) -> String {
    let encoding = Encoding::for_label(charset.trim().as_bytes()).unwrap_or_else(|| {
        tracing::trace!("Unknown charset {:?}, decoding as utf-8", charset);
        UTF_8
    });
    let (text, _, _) = encoding.decode(data);
    text.into_owned()
}

pub fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Short text rendering of a decoded body, `None` for an empty body.
pub fn preview_text(data: &[u8], content_type: Option<&str>) -> Option<String> {
    if data.is_empty() {
        return None;
    }
    let charset = charset_from_content_type(content_type);
    let is_json = content_type
        .map(|ct| ct.to_ascii_lowercase().contains("json"))
        .unwrap_or(false);

    if is_json && data.len() <= MAX_FORMAT_BYTES {
        let text = decode_text(data, &charset);
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
            if let Ok(pretty) = serde_json::to_string_pretty(&value) {
                return Some(truncate_chars(&pretty, MAX_PREVIEW_CHARS));
            }
        }
    }

    let head = &data[..data.len().min(MAX_PREVIEW_CHARS)];
    Some(truncate_chars(&decode_text(head, &charset), MAX_PREVIEW_CHARS))
}

/// Merge every `cookie` header into one `"; "`-joined pair at the position
/// of the first occurrence. Other headers keep their order.
pub fn collapse_cookies(headers: HeaderList) -> HeaderList {
    let mut out: HeaderList = Vec::with_capacity(headers.len());
    let mut cookie_index = None;
    let mut cookie_parts: Vec<String> = Vec::new();

    for (name, value) in headers {
        if name.eq_ignore_ascii_case("cookie") {
            cookie_index.get_or_insert(out.len());
            let part = value.trim();
            if !part.is_empty() {
                cookie_parts.push(part.to_string());
            }
            continue;
        }
        out.push((name, value));
    }

    if let Some(idx) = cookie_index {
        if !cookie_parts.is_empty() {
            out.insert(idx, ("cookie".to_string(), cookie_parts.join("; ")));
        }
    }
    out
}
