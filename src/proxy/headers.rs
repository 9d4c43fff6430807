//! Header filtering for both proxy directions, credential redaction for
//! persisted header maps, and upstream URL construction.

use axum::http::header::{HeaderMap, HeaderValue};
use serde_json::{Map, Value};

/// Hop-by-hop headers that must not be forwarded.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Header keys whose values are never persisted verbatim.
const REDACTED_HEADERS: [&str; 2] = ["authorization", "x-api-key"];

const REDACTED: &str = "[REDACTED]";

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for key in HOP_BY_HOP_HEADERS {
        headers.remove(key);
    }
}

/// Headers for the upstream request: hop-by-hop and `Host` stripped,
/// `Accept-Encoding` removed so the upstream returns uncompressed bytes
/// the SSE parser can read, and the configured API key injected when the
/// client supplied no Authorization of its own.
pub fn prepare_upstream_headers(original: &HeaderMap, api_key: &str) -> HeaderMap {
    let mut headers = original.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove("host");
    headers.remove("accept-encoding");

    if !api_key.is_empty() && !headers.contains_key("authorization") {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
            headers.insert("authorization", value);
        }
    }

    headers
}

/// Headers for the client-facing response: hop-by-hop stripped, plus
/// `Content-Encoding` (we request identity upstream) and `Content-Length`
/// (set by the response writer).
pub fn prepare_client_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = upstream.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove("content-encoding");
    headers.remove("content-length");
    headers
}

/// Convert a header map to the JSON shape stored in `request_payloads`,
/// replacing credential-bearing values with the redaction sentinel.
pub fn sanitize_headers(headers: &HeaderMap) -> Value {
    let mut map = Map::new();
    for key in headers.keys() {
        let name = key.as_str();
        let values = if REDACTED_HEADERS.iter().any(|r| name.eq_ignore_ascii_case(r)) {
            vec![Value::String(REDACTED.to_string())]
        } else {
            headers
                .get_all(key)
                .iter()
                .map(|v| Value::String(String::from_utf8_lossy(v.as_bytes()).into_owned()))
                .collect()
        };
        map.insert(name.to_string(), Value::Array(values));
    }
    Value::Object(map)
}

/// Rebuild the upstream URL: scheme and host from the configured base,
/// path and raw query from the inbound request.
pub fn build_target_url(base_url: &str, path: &str, raw_query: Option<&str>) -> String {
    let mut url = reqwest::Url::parse(base_url).unwrap_or_else(|_| {
        reqwest::Url::parse("https://api.anthropic.com").expect("default upstream URL is valid")
    });
    url.set_path(path);
    url.set_query(raw_query);
    url.to_string()
}
