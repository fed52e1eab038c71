use anyhow::Context;
use std::{fmt, sync::Arc, time::Duration};
use tokio::{net::TcpStream, time::timeout};
use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::config::{SecurityMode, UpstreamConfig};
use crate::error::{RelayError, Result};
use crate::pair::{OutboundConnection, SessionId};
use crate::stream::StreamType;
use crate::tls::{load_client_config, server_name};

/// The fixed upstream endpoint.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
}

impl UpstreamTarget {
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Opens outbound connections to the upstream, one per inbound session.
pub enum UpstreamConnector {
    Encrypted {
        target: UpstreamTarget,
        tls: TlsConnector,
        server_name: ServerName<'static>,
    },
    Plaintext {
        target: UpstreamTarget,
    },
}

impl fmt::Debug for UpstreamConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConnector")
            .field("security", &self.security())
            .field("target", self.target())
            .finish_non_exhaustive()
    }
}

impl UpstreamConnector {
    #[must_use]
    pub const fn plaintext(target: UpstreamTarget) -> Self {
        Self::Plaintext { target }
    }

    /// `name` is the TLS server name, usually the target host.
    pub fn encrypted(
        target: UpstreamTarget,
        config: Arc<rustls::ClientConfig>,
        name: &str,
    ) -> Result<Self> {
        let server_name =
            server_name(name).ok_or_else(|| RelayError::InvalidServerName(name.to_string()))?;
        Ok(Self::Encrypted {
            target,
            tls: TlsConnector::from(config),
            server_name,
        })
    }

    pub fn from_config(config: &UpstreamConfig) -> anyhow::Result<Self> {
        let target = UpstreamTarget {
            host: config.host.clone(),
            port: config.port,
            connect_timeout: config.connect_timeout(),
        };

        match config.security {
            SecurityMode::Plaintext => Ok(Self::plaintext(target)),
            SecurityMode::Encrypted => {
                let client_config = load_client_config(&config.tls)
                    .context("Failed to build upstream TLS configuration")?;
                let name = config
                    .tls
                    .server_name
                    .clone()
                    .unwrap_or_else(|| config.host.clone());
                Ok(Self::encrypted(target, Arc::new(client_config), &name)?)
            }
        }
    }

    #[must_use]
    pub const fn target(&self) -> &UpstreamTarget {
        match self {
            Self::Encrypted { target, .. } | Self::Plaintext { target } => target,
        }
    }

    #[must_use]
    pub const fn security(&self) -> SecurityMode {
        match self {
            Self::Encrypted { .. } => SecurityMode::Encrypted,
            Self::Plaintext { .. } => SecurityMode::Plaintext,
        }
    }

    /// Connects to the upstream on behalf of `session`. The whole attempt,
    /// including the TLS handshake, is bounded by the target's connect timeout.
    pub async fn connect(&self, session: SessionId) -> Result<OutboundConnection> {
        let target = self.target();
        let addr = target.addr();
        debug!(%session, upstream = %addr, "Connecting to upstream");

        let stream = timeout(target.connect_timeout, self.establish(&addr))
            .await
            .map_err(|_| RelayError::ConnectTimeout {
                addr: addr.clone(),
                timeout: target.connect_timeout,
            })??;

        info!(
            %session,
            upstream = %addr,
            encrypted = stream.is_encrypted(),
            "Connected to upstream"
        );
        Ok(OutboundConnection::new(session, stream))
    }

    async fn establish(&self, addr: &str) -> Result<StreamType> {
        let tcp_stream = TcpStream::connect(addr)
            .await
            .map_err(|source| RelayError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        if let Err(e) = tcp_stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        match self {
            Self::Plaintext { .. } => Ok(StreamType::Plain(tcp_stream)),
            Self::Encrypted {
                tls, server_name, ..
            } => {
                let tls_stream = tls
                    .connect(server_name.clone(), tcp_stream)
                    .await
                    .map_err(|source| RelayError::Handshake {
                        addr: addr.to_string(),
                        source,
                    })?;
                Ok(StreamType::Tls(Box::new(tls_stream)))
            }
        }
    }
}
