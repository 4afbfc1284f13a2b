use super::schema::Config;
use crate::error::{ConfigError, Result};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use regex::Regex;
use std::path::Path;

const ENV_PREFIX: &str = "MITM_PROXY_";

pub async fn load_from_env_or_file() -> Result<Config> {
    let config: Config = Figment::new()
        .merge(Toml::file("mitm-proxy.toml"))
        .merge(Json::file("mitm-proxy.json"))
        .merge(Yaml::file("mitm-proxy.yaml"))
        .merge(Yaml::file("mitm-proxy.yml"))
        // MITM_PROXY_PROXY__PORT=9000 -> proxy.port
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;
    Ok(config)
}

pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into());
        }
    };

    if !path.exists() {
        return Err(ConfigError::Parse(format!("Config file {} not found", path.display())).into());
    }

    let config: Config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.proxy.host.trim().is_empty() {
        return Err(ConfigError::Validation("Proxy host must not be empty".into()).into());
    }

    if let Some(path) = &config.proxy.health_check_path {
        if !path.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "Health check path '{}' must start with '/'",
                path
            ))
            .into());
        }
    }

    let interception = &config.interception;
    if let Some(pattern) = &interception.domain_pattern {
        Regex::new(pattern).map_err(ConfigError::Pattern)?;
    }
    if let Some(pattern) = &interception.exclude_extensions {
        Regex::new(pattern).map_err(ConfigError::Pattern)?;
    }
    if let Some(types) = &interception.exclude_content_types {
        Regex::new(&types.include).map_err(ConfigError::Pattern)?;
        Regex::new(&types.exclude).map_err(ConfigError::Pattern)?;
    }

    match (&config.ca.cert_path, &config.ca.key_path) {
        (Some(_), None) | (None, Some(_)) => {
            return Err(ConfigError::Validation(
                "ca.cert_path and ca.key_path must be set together".into(),
            )
            .into());
        }
        _ => {}
    }

    Ok(())
}
