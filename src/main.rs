use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;
use tracing::{info, warn};

use smtp_relay::{Config, DEFAULT_CONFIG_FILE, Relay, UpstreamConnector, load_config};

fn read_config() -> Result<(Config, String)> {
    match std::env::args_os().nth(1) {
        Some(path) => {
            let path = PathBuf::from(path);
            let config = load_config(&path)?;
            Ok((config, path.display().to_string()))
        }
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            let config = load_config(Path::new(DEFAULT_CONFIG_FILE))?;
            Ok((config, DEFAULT_CONFIG_FILE.to_string()))
        }
        None => {
            warn!(
                config_file = DEFAULT_CONFIG_FILE,
                "Configuration file not found, using built-in defaults"
            );
            Ok((Config::default(), "<defaults>".to_string()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let (config, source) = read_config()?;
    info!(
        config_file = %source,
        listen_ip = %config.listen.ip,
        listen_port = config.listen.port,
        upstream_host = %config.upstream.host,
        upstream_port = config.upstream.port,
        security = ?config.upstream.security,
        "Configuration loaded"
    );

    let connector = UpstreamConnector::from_config(&config.upstream)?;

    let addr = config.listen.addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to address {addr}"))?;

    info!(listen_addr = %addr, "SMTP relay listening");

    let relay = Relay::new(connector);
    tokio::select! {
        () = relay.serve(listener) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!(
                active_sessions = relay.registry().len(),
                "Shutting down"
            );
        }
    }

    Ok(())
}
