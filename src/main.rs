use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};

use mitm_rust_proxy::commands;
use mitm_rust_proxy::config::{self, Config};
use mitm_rust_proxy::proxy::Proxy;

#[derive(Parser, Debug)]
#[command(name = "mitm-rust-proxy")]
#[command(about = "A TLS intercepting HTTP proxy", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the proxy (default)
    Run,
    /// Validate the configuration and print it fully resolved
    Check,
    /// Print the root certificate clients must trust
    Ca {
        /// Write the certificate to this file instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(format!("mitm_rust_proxy={log_level}").parse()?);
    if args.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = load_config(args.config).await?;

    match args.command.unwrap_or(Command::Run) {
        Command::Check => {
            let resolved = commands::run_config_check(config)?;
            print!("{resolved}");
            Ok(())
        }
        Command::Ca { output } => {
            let pem = commands::export_ca_certificate(config)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, pem)
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!("Root certificate written to {}", path.display());
                }
                None => print!("{pem}"),
            }
            Ok(())
        }
        Command::Run => run(config).await,
    }
}

async fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            config::load_from_path(&path).await.map_err(|e| {
                error!("Failed to load configuration from {}: {}", path.display(), e);
                e
            })?
        }
        None => config::load_from_env_or_file().await.map_err(|e| {
            error!("Failed to load configuration: {}", e);
            e
        })?,
    };
    Ok(config)
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!("Starting MITM Rust Proxy");

    let proxy = Proxy::new(config).context("building proxy")?;
    let bound = proxy.bind().await.context("binding listener")?;
    info!("Proxy available at {}", bound.url());

    bound.serve(shutdown_signal()).await?;

    info!("Proxy stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received shutdown signal");
}
