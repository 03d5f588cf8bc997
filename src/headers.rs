//! Hop-by-hop header handling.

use hyper::HeaderMap;

/// Headers meaningful only for a single transport leg; never forwarded by the proxy.
pub const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Returns a copy of `headers` without any hop-by-hop header.
///
/// Every other name/value pair is kept, repeated values included, in the
/// order the map yields them.
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut stripped = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if !is_hop_by_hop(name.as_str()) {
            stripped.append(name.clone(), value.clone());
        }
    }
    stripped
}
