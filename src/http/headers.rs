//! Header handling between the client connection and the upstream one.

use axum::http::{HeaderMap, HeaderName, header};

/// Connection-scoped headers that never cross the proxy.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "upgrade",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
];

/// Build the outbound header set from the inbound one.
///
/// Copies everything except `Host`, the hop-by-hop headers, and any header
/// the client listed in its `Connection` value.  With `identity_only` the
/// `Accept-Encoding` header is dropped too, so the upstream body arrives
/// unencoded and can be stored as-is.
pub fn upstream_request_headers(inbound: &HeaderMap, identity_only: bool) -> HeaderMap {
    let mut headers = inbound.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);
    if identity_only {
        headers.remove(header::ACCEPT_ENCODING);
    }
    headers
}

/// Append upstream response headers onto `client`, skipping hop-by-hop ones.
///
/// Existing values on the client side are kept; upstream values are added
/// next to them.
pub fn append_response_headers(upstream: &HeaderMap, client: &mut HeaderMap) {
    let skip = connection_tokens(upstream);
    for (name, value) in upstream {
        if HOP_BY_HOP.contains(&name.as_str()) || skip.contains(name) {
            continue;
        }
        client.append(name.clone(), value.clone());
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in connection_tokens(headers) {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Header names listed in the `Connection` header(s).
fn connection_tokens(headers: &HeaderMap) -> Vec<HeaderName> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect()
}
