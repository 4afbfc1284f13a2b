use crate::config::{self, Config};
use crate::error::Result;
use crate::proxy::Proxy;
use tracing::info;

/// Validate `config`, load the root it names and return the resolved
/// configuration as YAML.
pub fn run_config_check(config: Config) -> Result<String> {
    info!("Checking configuration...");

    config::validate(&config)?;
    info!("✓ Configuration is valid");

    let proxy = Proxy::new(config)?;
    match &proxy.config().ca.cert_path {
        Some(path) => info!("✓ Root certificate loaded from {}", path.display()),
        None => info!("✓ Embedded root certificate loaded"),
    }

    let criteria = proxy.engine().criteria();
    match criteria.domain_pattern() {
        Some(pattern) => info!("  Intercepting hosts matching {}", pattern),
        None => info!("  Intercepting every host"),
    }
    info!("  {} request filter(s)", criteria.request_filter_count());

    let resolved = serde_yaml::to_string(proxy.config())
        .map_err(|e| crate::error::ConfigError::Parse(e.to_string()))?;
    Ok(resolved)
}

/// PEM of the root certificate clients must trust.
pub fn export_ca_certificate(config: Config) -> Result<String> {
    let proxy = Proxy::new(config)?;
    Ok(proxy.ca_cert_pem().to_string())
}
