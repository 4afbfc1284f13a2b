//! Request/response exchanges inside a terminated TLS tunnel.

use super::{full_body, empty, relay, ProxyBody};
use crate::body::SharedBody;
use crate::error::{ProxyError, Result};
use crate::hooks::{run_request_hooks, run_response_hooks, ExchangeId, InterceptedRequest, InterceptedResponse};
use crate::state::{ActiveGuard, EngineState, Stat};
use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::uri::{PathAndQuery, Uri};
use http::{Method, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Destination named by a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

impl ConnectTarget {
    pub fn from_uri(uri: &Uri) -> Option<Self> {
        let authority = uri.authority()?;
        let host = authority.host().trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return None;
        }

        Some(Self {
            host: host.to_string(),
            port: authority.port_u16().unwrap_or(443),
        })
    }

    /// `host` alone on the default HTTPS port, `host:port` otherwise.
    pub fn authority(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };

        if self.port == 443 {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

/// One terminated tunnel: the client side is served by hyper, every request
/// is forwarded over the single upstream connection held here.
pub(crate) struct InterceptSession {
    state: Arc<EngineState>,
    target: ConnectTarget,
    upstream: Mutex<SendRequest<Full<Bytes>>>,
}

impl InterceptSession {
    pub(crate) fn new(
        state: Arc<EngineState>,
        target: ConnectTarget,
        upstream: SendRequest<Full<Bytes>>,
    ) -> Self {
        Self {
            state,
            target,
            upstream: Mutex::new(upstream),
        }
    }

    /// Handle one exchange. An error closes the client connection without a response.
    pub(crate) async fn handle(&self, mut req: Request<Incoming>) -> Result<Response<ProxyBody>> {
        let client_upgrade = hyper::upgrade::on(&mut req);

        let (parts, body) = req.into_parts();
        let mut request = InterceptedRequest {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body: SharedBody::new(body),
        };

        let intercepted = self.state.criteria().should_intercept_request(&request);
        let exchange_id = if intercepted {
            let id = ExchangeId::new();
            self.state.metrics.increase(Stat::InterceptedRequests);
            self.run_request_hooks(&mut request, id).await?;
            Some(id)
        } else {
            None
        };

        let request_method = request.method.clone();
        let request_uri = request.uri.clone();

        let mut upstream_response = self.send_upstream(request).await?;
        let status = upstream_response.status();

        let upstream_upgrade = (status == StatusCode::SWITCHING_PROTOCOLS)
            .then(|| hyper::upgrade::on(&mut upstream_response));

        let (parts, body) = upstream_response.into_parts();
        let mut response = InterceptedResponse {
            status: parts.status,
            version: parts.version,
            headers: parts.headers,
            body: SharedBody::new(body),
            request_method,
            request_uri,
        };

        if let Some(id) = exchange_id {
            self.state.metrics.increase(Stat::InterceptedResponses);
            run_response_hooks(&self.state.hooks(), &mut response, id).await?;
        }

        if let Some(upstream_upgrade) = upstream_upgrade {
            self.spawn_upgrade_relay(client_upgrade, upstream_upgrade);
        }

        into_client_response(response).await
    }

    async fn run_request_hooks(&self, request: &mut InterceptedRequest, id: ExchangeId) -> Result<()> {
        let original_uri = request.uri.clone();
        let original_host = request.headers.get(HOST).cloned();

        let authority = self.target.authority();
        let path = request
            .uri
            .path_and_query()
            .map(PathAndQuery::as_str)
            .unwrap_or("/");
        let rewritten_uri: Uri = format!("https://{}{}", authority, path)
            .parse()
            .map_err(|e: http::uri::InvalidUri| ProxyError::InvalidRequest(e.to_string()))?;
        let rewritten_host = HeaderValue::from_str(&authority)
            .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;

        request.uri = rewritten_uri.clone();
        request.headers.insert(HOST, rewritten_host.clone());

        if let Err(e) = run_request_hooks(&self.state.hooks(), request, id).await {
            warn!(exchange_id = %id, uri = %rewritten_uri, error = %e, "Request hook failed, closing connection");
            return Err(e.into());
        }

        // Hooks that left both untouched get the client's original form back
        let host_unchanged = request.headers.get(HOST) == Some(&rewritten_host);
        if request.uri == rewritten_uri && host_unchanged {
            request.uri = original_uri;
            match original_host {
                Some(host) => request.headers.insert(HOST, host),
                None => request.headers.remove(HOST),
            };
        }

        Ok(())
    }

    async fn send_upstream(&self, request: InterceptedRequest) -> Result<Response<Incoming>> {
        let body = request.body.bytes().await?;

        let mut headers = request.headers;
        if !headers.contains_key(HOST) {
            let host = HeaderValue::from_str(&self.target.authority())
                .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
            headers.insert(HOST, host);
        }
        let sends_body = !body.is_empty() || headers.contains_key(CONTENT_LENGTH) || headers.contains_key(TRANSFER_ENCODING);
        if sends_body {
            set_content_length(&mut headers, body.len());
        }

        let path = request
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));

        let mut upstream_request = Request::new(Full::new(body));
        *upstream_request.method_mut() = request.method;
        *upstream_request.uri_mut() = Uri::from(path);
        *upstream_request.headers_mut() = headers;

        let mut sender = self.upstream.lock().await;
        sender.ready().await.map_err(|e| {
            debug!(target_host = %self.target.host, error = %e, "Upstream connection closed");
            ProxyError::Http(e)
        })?;

        sender.send_request(upstream_request).await.map_err(|e| {
            warn!(target_host = %self.target.host, error = %e, "Failed to forward request upstream");
            ProxyError::Http(e)
        })
    }

    fn spawn_upgrade_relay(&self, client: hyper::upgrade::OnUpgrade, upstream: hyper::upgrade::OnUpgrade) {
        let metrics = self.state.metrics.clone();
        metrics.increase(Stat::UpgradedRequests);
        let target = self.target.clone();

        tokio::spawn(async move {
            let _active = ActiveGuard::new(metrics, Stat::ActiveUpgradedRequests);

            let (client, upstream) = match tokio::try_join!(client, upstream) {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(target_host = %target.host, error = %e, "Upgrade did not complete");
                    return;
                }
            };

            let stats = relay::pump(TokioIo::new(client), TokioIo::new(upstream)).await;
            debug!(
                target_host = %target.host,
                client_to_upstream = stats.client_to_upstream,
                upstream_to_client = stats.upstream_to_client,
                "Upgraded connection closed"
            );
        });
    }
}

async fn into_client_response(response: InterceptedResponse) -> Result<Response<ProxyBody>> {
    let mut headers = response.headers;

    let body = if carries_body(&response.request_method, response.status) {
        let bytes = response.body.bytes().await?;
        set_content_length(&mut headers, bytes.len());
        full_body(bytes)
    } else {
        empty()
    };

    let mut client_response = Response::new(body);
    *client_response.status_mut() = response.status;
    *client_response.headers_mut() = headers;

    Ok(client_response)
}

fn carries_body(method: &Method, status: StatusCode) -> bool {
    !(method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

// Bodies are forwarded fully buffered, so the length is always known
fn set_content_length(headers: &mut HeaderMap, len: usize) {
    headers.remove(TRANSFER_ENCODING);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
}
