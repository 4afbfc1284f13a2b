use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub interception: InterceptionConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub ca: CaConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_host")]
    pub host: String,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    /// Plain request path answered with an empty `200` instead of being forwarded.
    #[serde(default)]
    pub health_check_path: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_proxy_host(),
            port: default_proxy_port(),
            health_check_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct InterceptionConfig {
    /// Regex a CONNECT host must match to be terminated. Unset intercepts every host.
    #[serde(default)]
    pub domain_pattern: Option<String>,
    /// Alternation of file extensions whose requests skip the hooks, e.g. `png|jpe?g|css`.
    #[serde(default)]
    pub exclude_extensions: Option<String>,
    #[serde(default)]
    pub exclude_content_types: Option<ContentTypeFilterConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ContentTypeFilterConfig {
    pub include: String,
    pub exclude: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_insecure_skip_verify")]
    pub insecure_skip_verify: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            insecure_skip_verify: default_insecure_skip_verify(),
        }
    }
}

/// Replacement root. Both paths must be given together; neither means the embedded root.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CaConfig {
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

// Default value functions
fn default_proxy_host() -> String {
    "127.0.0.1".to_string()
}

fn default_proxy_port() -> u16 {
    8080
}

fn default_insecure_skip_verify() -> bool {
    true
}

impl Config {
    pub fn listen_addr(&self) -> String {
        if self.proxy.host.contains(':') {
            format!("[{}]:{}", self.proxy.host, self.proxy.port)
        } else {
            format!("{}:{}", self.proxy.host, self.proxy.port)
        }
    }
}
