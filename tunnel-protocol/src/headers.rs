//! HTTP header handling across the tunnel.
//!
//! Headers travel as a flat `name → value` map. Repeated header values are
//! joined with `", "` in the order the source map yields them, except
//! `set-cookie`: cookie values may contain commas, so only the last one is
//! kept.

use std::collections::BTreeMap;

use http::header::{HeaderMap, HeaderName, HeaderValue, SET_COOKIE};

/// Flat header map carried by `request-start` and `response-start`.
pub type Headers = BTreeMap<String, String>;

/// Status codes that must never carry a response body.
pub const NULL_BODY_STATUSES: [u16; 4] = [101, 204, 205, 304];

/// Connection-scoped headers that must not be replayed on another hop.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_null_body_status(status_code: u16) -> bool {
    NULL_BODY_STATUSES.contains(&status_code)
}

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Collapses a multi-valued header map into the wire representation.
pub fn flatten_headers(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in map {
        let value = String::from_utf8_lossy(value.as_bytes());
        if *name == SET_COOKIE {
            headers.insert(name.as_str().to_owned(), value.into_owned());
            continue;
        }
        headers
            .entry(name.as_str().to_owned())
            .and_modify(|joined| {
                joined.push_str(", ");
                joined.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    headers
}

/// Rebuilds a header map, dropping hop-by-hop headers and any entry that is
/// not a valid HTTP header.
pub fn to_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name) {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            tracing::debug!(header = %name, "Skipping invalid header");
            continue;
        };
        map.insert(name, value);
    }
    map
}

/// Whether the flattened request headers ask for a WebSocket upgrade.
pub fn is_websocket_upgrade(headers: &Headers) -> bool {
    headers
        .iter()
        .any(|(name, value)| name.eq_ignore_ascii_case("upgrade") && value.eq_ignore_ascii_case("websocket"))
}
