//! Connection handling: plain forwarding, CONNECT tunnels and TLS interception.
//!
//! Every accepted connection is served by a hyper HTTP/1.1 server connection
//! with upgrades enabled. A CONNECT request is answered only after the
//! engine is ready to carry the tunnel, so failures reach the client as a
//! `502` instead of a dead tunnel.

pub mod intercept;
pub mod plain;
pub mod relay;
pub mod upstream;

use crate::ca::CertificateAuthority;
use crate::criteria::InterceptionCriteria;
use crate::error::Result;
use crate::hooks::{HookSet, RequestModifier, RequestObserver, ResponseModifier, ResponseObserver};
use crate::state::{ActiveGuard, EngineState, Stat};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

pub use intercept::ConnectTarget;
pub use plain::PlainForwarder;
pub use upstream::UpstreamConnector;

use intercept::InterceptSession;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn status_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(empty());
    *response.status_mut() = status;
    response
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Path answered with an empty `200` on plain requests.
    pub health_check_path: Option<String>,
    /// Accept any certificate from intercepted destinations.
    pub insecure_skip_verify: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            health_check_path: None,
            insecure_skip_verify: true,
        }
    }
}

pub struct MitmEngine {
    state: Arc<EngineState>,
    ca: Arc<CertificateAuthority>,
    upstream: UpstreamConnector,
    plain: PlainForwarder,
    health_check_path: Option<String>,
}

impl MitmEngine {
    pub fn new(
        ca: Arc<CertificateAuthority>,
        criteria: InterceptionCriteria,
        options: EngineOptions,
    ) -> Self {
        Self {
            state: Arc::new(EngineState::new(criteria)),
            ca,
            upstream: UpstreamConnector::new(options.insecure_skip_verify),
            plain: PlainForwarder::new(),
            health_check_path: options.health_check_path,
        }
    }

    /// Replace the connector used to dial intercepted destinations.
    pub fn with_upstream(mut self, upstream: UpstreamConnector) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    pub fn ca(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }

    pub fn criteria(&self) -> Arc<InterceptionCriteria> {
        self.state.criteria()
    }

    pub fn set_criteria(&self, criteria: InterceptionCriteria) {
        self.state.update_criteria(|_| criteria.clone());
    }

    pub fn update_criteria<F>(&self, update: F)
    where
        F: Fn(&InterceptionCriteria) -> InterceptionCriteria,
    {
        self.state.update_criteria(update);
    }

    pub fn hooks(&self) -> Arc<HookSet> {
        self.state.hooks()
    }

    pub fn add_request_in_hook(&self, hook: RequestObserver) {
        self.state.update_hooks(|hooks| hooks.with_request_in(hook.clone()));
    }

    pub fn add_request_mod_hook(&self, hook: RequestModifier) {
        self.state.update_hooks(|hooks| hooks.with_request_mod(hook.clone()));
    }

    pub fn add_request_out_hook(&self, hook: RequestObserver) {
        self.state.update_hooks(|hooks| hooks.with_request_out(hook.clone()));
    }

    pub fn add_response_in_hook(&self, hook: ResponseObserver) {
        self.state.update_hooks(|hooks| hooks.with_response_in(hook.clone()));
    }

    pub fn add_response_mod_hook(&self, hook: ResponseModifier) {
        self.state.update_hooks(|hooks| hooks.with_response_mod(hook.clone()));
    }

    pub fn add_response_out_hook(&self, hook: ResponseObserver) {
        self.state.update_hooks(|hooks| hooks.with_response_out(hook.clone()));
    }

    /// Accept connections until `shutdown` resolves. Connections already
    /// accepted keep running on their own tasks.
    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "Proxy listening");

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(%local_addr, "Proxy stopped accepting connections");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    let engine = self.clone();
                    tokio::spawn(async move {
                        engine.serve_connection(stream, remote_addr).await;
                    });
                }
            }
        }

        Ok(())
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) {
        // Shared with tunnel tasks, which outlive hyper's hold on the socket.
        let client_active = Arc::new(ActiveGuard::new(self.state.metrics.clone(), Stat::ActiveConnections));
        let _ = stream.set_nodelay(true);

        let service = service_fn(move |req: Request<Incoming>| {
            let engine = self.clone();
            let client_active = client_active.clone();
            async move { Ok::<_, Infallible>(engine.dispatch(req, client_active).await) }
        });

        if let Err(e) = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await
        {
            debug!(%remote_addr, error = %e, "Client connection closed with error");
        }
    }

    async fn dispatch(self: Arc<Self>, req: Request<Incoming>, client_active: Arc<ActiveGuard>) -> Response<ProxyBody> {
        if req.method() == Method::CONNECT {
            return self.handle_connect(req, client_active).await;
        }

        if let Some(path) = &self.health_check_path {
            if req.uri().path() == path {
                return Response::new(empty());
            }
        }

        self.plain.forward(req).await
    }

    async fn handle_connect(
        self: Arc<Self>,
        req: Request<Incoming>,
        client_active: Arc<ActiveGuard>,
    ) -> Response<ProxyBody> {
        let Some(target) = ConnectTarget::from_uri(req.uri()) else {
            debug!(uri = %req.uri(), "CONNECT without a target authority");
            return status_response(StatusCode::BAD_REQUEST);
        };

        if self.state.criteria().should_intercept_domain(&target.host) {
            self.terminate(req, target, client_active).await
        } else {
            self.tunnel(req, target, client_active).await
        }
    }

    /// Pass the tunnel through untouched.
    async fn tunnel(
        &self,
        req: Request<Incoming>,
        target: ConnectTarget,
        client_active: Arc<ActiveGuard>,
    ) -> Response<ProxyBody> {
        let upstream = match TcpStream::connect((target.host.as_str(), target.port)).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(host = %target.host, port = target.port, error = %e, "Could not connect to tunnel destination");
                return status_response(StatusCode::BAD_GATEWAY);
            }
        };

        debug!(host = %target.host, port = target.port, "Tunneling connection");

        let active = ActiveGuard::new(self.state.metrics.clone(), Stat::ActiveConnectRequests);
        let on_upgrade = hyper::upgrade::on(req);

        tokio::spawn(async move {
            let _active = (active, client_active);
            match on_upgrade.await {
                Ok(client) => {
                    let stats = relay::pump(TokioIo::new(client), upstream).await;
                    debug!(
                        host = %target.host,
                        client_to_upstream = stats.client_to_upstream,
                        upstream_to_client = stats.upstream_to_client,
                        "Tunnel closed"
                    );
                }
                Err(e) => debug!(host = %target.host, error = %e, "Tunnel upgrade failed"),
            }
        });

        Response::new(empty())
    }

    /// Terminate TLS on both sides and run every exchange through the hooks.
    async fn terminate(
        self: Arc<Self>,
        req: Request<Incoming>,
        target: ConnectTarget,
        client_active: Arc<ActiveGuard>,
    ) -> Response<ProxyBody> {
        let ca = self.ca.clone();
        let domain = target.host.clone();
        let leaf = match tokio::task::spawn_blocking(move || ca.certificate_for(&domain)).await {
            Ok(Ok(leaf)) => leaf,
            Ok(Err(e)) => {
                error!(host = %target.host, error = %e, "Could not issue certificate");
                return status_response(StatusCode::BAD_GATEWAY);
            }
            Err(e) => {
                error!(host = %target.host, error = %e, "Certificate issuance task failed");
                return status_response(StatusCode::BAD_GATEWAY);
            }
        };

        let upstream = match self.upstream.connect(&target.host, target.port).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(host = %target.host, port = target.port, error = %e, "Could not connect to destination");
                return status_response(StatusCode::BAD_GATEWAY);
            }
        };

        let (sender, connection) =
            match hyper::client::conn::http1::handshake::<_, Full<Bytes>>(TokioIo::new(upstream)).await {
                Ok(handshake) => handshake,
                Err(e) => {
                    warn!(host = %target.host, error = %e, "Upstream HTTP handshake failed");
                    return status_response(StatusCode::BAD_GATEWAY);
                }
            };

        let upstream_host = target.host.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.with_upgrades().await {
                debug!(host = %upstream_host, error = %e, "Upstream connection closed with error");
            }
        });

        debug!(host = %target.host, port = target.port, "Intercepting connection");

        let active = ActiveGuard::new(self.state.metrics.clone(), Stat::ActiveConnectRequests);
        let on_upgrade = hyper::upgrade::on(req);
        let acceptor = TlsAcceptor::from(leaf.server_config.clone());
        let state = self.state.clone();

        tokio::spawn(async move {
            let _active = (active, client_active);

            let client = match on_upgrade.await {
                Ok(client) => client,
                Err(e) => {
                    debug!(host = %target.host, error = %e, "CONNECT upgrade failed");
                    return;
                }
            };

            let tls = match acceptor.accept(TokioIo::new(client)).await {
                Ok(tls) => tls,
                Err(e) => {
                    debug!(host = %target.host, error = %e, "Client TLS handshake failed");
                    return;
                }
            };

            let host = target.host.clone();
            let session = Arc::new(InterceptSession::new(state, target, sender));
            let service = service_fn(move |req: Request<Incoming>| {
                let session = session.clone();
                async move { session.handle(req).await }
            });

            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(tls), service)
                .with_upgrades()
                .await
            {
                debug!(%host, error = %e, "Intercepted connection closed");
            }
        });

        Response::new(empty())
    }
}
