//! Library entry point: builds the engine from a [`Config`] and runs it.

use crate::ca::CertificateAuthority;
use crate::config::{self, Config};
use crate::criteria::{exclude_file_extensions, exclude_file_types, InterceptionCriteria, RequestFilter};
use crate::engine::{EngineOptions, MitmEngine, UpstreamConnector};
use crate::error::{ConfigError, Result};
use crate::hooks::{HookSet, RequestModifier, RequestObserver, ResponseModifier, ResponseObserver};
use crate::stream::StreamHub;
use regex::Regex;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

pub struct Proxy {
    config: Config,
    engine: MitmEngine,
}

impl Proxy {
    pub fn new(config: Config) -> Result<Self> {
        config::validate(&config)?;

        let ca = match (&config.ca.cert_path, &config.ca.key_path) {
            (Some(cert_path), Some(key_path)) => CertificateAuthority::from_files(cert_path, key_path)?,
            _ => CertificateAuthority::embedded()?,
        };

        let criteria = build_criteria(&config)?;
        let options = EngineOptions {
            health_check_path: config.proxy.health_check_path.clone(),
            insecure_skip_verify: config.upstream.insecure_skip_verify,
        };

        let engine = MitmEngine::new(Arc::new(ca), criteria, options);
        Ok(Self { config, engine })
    }

    /// Dial intercepted destinations with `upstream` instead of the configured connector.
    pub fn with_upstream(mut self, upstream: UpstreamConnector) -> Self {
        self.engine = self.engine.with_upstream(upstream);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &MitmEngine {
        &self.engine
    }

    pub fn ca_cert_pem(&self) -> &str {
        self.engine.ca().ca_cert_pem()
    }

    /// Address the proxy will bind, as configured.
    pub fn url(&self) -> String {
        format!("http://{}", self.config.listen_addr())
    }

    pub fn set_domain_pattern(&self, pattern: &str) -> Result<()> {
        let pattern = Regex::new(pattern).map_err(ConfigError::Pattern)?;
        self.engine
            .update_criteria(|criteria| criteria.with_domain_pattern(pattern.clone()));
        Ok(())
    }

    pub fn add_request_filter(&self, filter: Arc<dyn RequestFilter>) {
        self.engine
            .update_criteria(|criteria| criteria.with_request_filter(filter.clone()));
    }

    pub fn add_request_in_hook(&self, hook: RequestObserver) {
        self.engine.add_request_in_hook(hook);
    }

    pub fn add_request_mod_hook(&self, hook: RequestModifier) {
        self.engine.add_request_mod_hook(hook);
    }

    pub fn add_request_out_hook(&self, hook: RequestObserver) {
        self.engine.add_request_out_hook(hook);
    }

    pub fn add_response_in_hook(&self, hook: ResponseObserver) {
        self.engine.add_response_in_hook(hook);
    }

    pub fn add_response_mod_hook(&self, hook: ResponseModifier) {
        self.engine.add_response_mod_hook(hook);
    }

    pub fn add_response_out_hook(&self, hook: ResponseObserver) {
        self.engine.add_response_out_hook(hook);
    }

    /// Route all six hook stages through `hub`.
    pub fn attach_stream(&self, hub: &StreamHub) {
        self.engine.state().update_hooks(|hooks: &HookSet| hub.attach(hooks));
    }

    pub fn stats(&self) -> BTreeMap<&'static str, i64> {
        self.engine.state().metrics.snapshot()
    }

    pub async fn bind(self) -> Result<BoundProxy> {
        let listener = TcpListener::bind(self.config.listen_addr()).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "Proxy bound");

        Ok(BoundProxy {
            engine: Arc::new(self.engine),
            listener,
            local_addr,
        })
    }
}

/// A proxy holding its listening socket, ready to serve.
pub struct BoundProxy {
    engine: Arc<MitmEngine>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl BoundProxy {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    pub fn engine(&self) -> &Arc<MitmEngine> {
        &self.engine
    }

    pub fn stats(&self) -> BTreeMap<&'static str, i64> {
        self.engine.state().metrics.snapshot()
    }

    /// Serve until `shutdown` resolves.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.engine.serve(self.listener, shutdown).await
    }
}

fn build_criteria(config: &Config) -> Result<InterceptionCriteria> {
    let interception = &config.interception;
    let mut criteria = InterceptionCriteria::new();

    if let Some(pattern) = &interception.domain_pattern {
        criteria = criteria.with_domain_pattern(Regex::new(pattern).map_err(ConfigError::Pattern)?);
    }
    if let Some(pattern) = &interception.exclude_extensions {
        criteria = criteria.with_request_filter(exclude_file_extensions(pattern).map_err(ConfigError::Pattern)?);
    }
    if let Some(types) = &interception.exclude_content_types {
        criteria = criteria.with_request_filter(
            exclude_file_types(&types.include, &types.exclude).map_err(ConfigError::Pattern)?,
        );
    }

    Ok(criteria)
}
