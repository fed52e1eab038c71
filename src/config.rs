use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::{fs, path::Path, time::Duration};

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: ListenConfig,
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub ip: String,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            ip: "0.0.0.0".to_string(),
            port: 2525,
        }
    }
}

impl ListenConfig {
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Transport used for the outbound leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    Encrypted,
    Plaintext,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
    pub security: SecurityMode,
    pub connect_timeout_secs: u64,
    pub tls: UpstreamTlsConfig,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: "smtp.googlemail.com".to_string(),
            port: 465,
            security: SecurityMode::Encrypted,
            connect_timeout_secs: 30,
            tls: UpstreamTlsConfig::default(),
        }
    }
}

impl UpstreamConfig {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamTlsConfig {
    /// When false, any server certificate is accepted.
    pub verify_certificates: bool,
    /// PEM bundle used instead of the platform trust store.
    pub ca_file: Option<String>,
    /// Name sent as SNI and checked against the certificate. Defaults to the upstream host.
    pub server_name: Option<String>,
}

impl Default for UpstreamTlsConfig {
    fn default() -> Self {
        Self {
            verify_certificates: true,
            ca_file: None,
            server_name: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.upstream.host.trim().is_empty() {
            bail!("upstream.host must not be empty");
        }
        if self.upstream.port == 0 {
            bail!("upstream.port must not be 0");
        }
        if self.upstream.connect_timeout_secs == 0 {
            bail!("upstream.connect_timeout_secs must be greater than 0");
        }
        Ok(())
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse configuration as valid TOML")?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {} file", path.display()))?;
    parse_config(&content)
}
