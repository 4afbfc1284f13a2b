//! Plain (non-CONNECT) forward proxying.

use super::{status_response, ProxyBody};
use http::header::{HeaderMap, HeaderValue, CONNECTION, HOST};
use http::uri::{Authority, Scheme, Uri};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::collections::HashSet;
use tracing::{debug, warn};

// RFC 7230 Section 6.1: Hop-by-hop headers must not be forwarded by proxies.
static HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forwards absolute-form requests received on the listening socket.
#[derive(Clone)]
pub struct PlainForwarder {
    client: Client<HttpConnector, Incoming>,
}

impl Default for PlainForwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl PlainForwarder {
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    /// Send `req` to its destination and relay the answer. Any upstream
    /// failure becomes a `502 Bad Gateway`.
    pub async fn forward(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let (mut parts, body) = req.into_parts();

        let Some(uri) = absolute_uri(&parts.uri, &parts.headers) else {
            debug!(uri = %parts.uri, "Plain request without a destination");
            return status_response(StatusCode::BAD_REQUEST);
        };

        strip_hop_by_hop(&mut parts.headers);
        parts.uri = uri;

        let method = parts.method.clone();
        let uri = parts.uri.clone();

        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(response) => {
                debug!(%method, %uri, status = %response.status(), "Forwarded plain request");
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                Response::from_parts(parts, body.boxed())
            }
            Err(e) => {
                warn!(%method, %uri, error = %e, "Error sending request upstream");
                status_response(StatusCode::BAD_GATEWAY)
            }
        }
    }
}

// Origin-form requests are completed from the Host header.
fn absolute_uri(uri: &Uri, headers: &HeaderMap) -> Option<Uri> {
    if uri.authority().is_some() {
        return Some(uri.clone());
    }

    let host = headers.get(HOST)?.to_str().ok()?;
    let authority: Authority = host.parse().ok()?;

    let mut parts = uri.clone().into_parts();
    parts.scheme = Some(Scheme::HTTP);
    parts.authority = Some(authority);
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(http::uri::PathAndQuery::from_static("/"));
    }

    Uri::from_parts(parts).ok()
}

pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let connection_tokens = parse_connection_tokens(headers.get(CONNECTION));

    for name in HOP_BY_HOP_HEADERS.iter().copied().chain(connection_tokens.iter().map(String::as_str)) {
        headers.remove(name);
    }
}

// Parse a Connection header value into a lowercased set of tokens
fn parse_connection_tokens(value: Option<&HeaderValue>) -> HashSet<String> {
    value
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .map(|token| token.trim().to_ascii_lowercase())
                .filter(|token| !token.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
