use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::connector::UpstreamConnector;
use crate::error::Result;
use crate::pair::{InboundConnection, PairedConnection, RelayStats, SessionRegistry};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts clients and pairs each one with its own upstream connection.
#[derive(Debug, Clone)]
pub struct Relay {
    connector: Arc<UpstreamConnector>,
    registry: Arc<SessionRegistry>,
}

impl Relay {
    #[must_use]
    pub fn new(connector: UpstreamConnector) -> Self {
        Self {
            connector: Arc::new(connector),
            registry: SessionRegistry::new(),
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Runs the accept loop until the listener is dropped.
    pub async fn serve(&self, listener: TcpListener) {
        loop {
            let (stream, client_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Usually descriptor exhaustion; give in-flight sessions a chance to finish.
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            };

            let relay = self.clone();
            tokio::spawn(async move {
                match relay.handle_connection(stream, client_addr).await {
                    Ok(_) => {}
                    Err(e) if e.is_connect_failure() => {
                        warn!(client_addr = %client_addr, error = %e, "Upstream unavailable, closed client");
                    }
                    Err(e) => error!(client_addr = %client_addr, error = %e, "Session failed"),
                }
            });
        }
    }

    /// Drives one client session: the inbound leg stays paused while the
    /// upstream connection is established, and is closed if that fails.
    #[tracing::instrument(skip(self, stream), fields(session = tracing::field::Empty))]
    pub async fn handle_connection(
        &self,
        stream: TcpStream,
        client_addr: SocketAddr,
    ) -> Result<RelayStats> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let inbound = InboundConnection::new(self.registry.open(client_addr), stream);
        let session = inbound.id();
        tracing::Span::current().record("session", tracing::field::display(session));
        info!(
            upstream = %self.connector.target().addr(),
            "Got inbound connection, connecting to upstream"
        );

        let outbound = match self.connector.connect(session).await {
            Ok(outbound) => outbound,
            Err(e) => {
                inbound.close().await;
                return Err(e);
            }
        };

        debug!(
            upstream_addr = ?outbound.stream().peer_addr().ok(),
            encrypted = outbound.stream().is_encrypted(),
            "Linking session"
        );
        PairedConnection::link(inbound, outbound)?.relay().await
    }
}
