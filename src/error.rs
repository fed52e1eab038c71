use std::{io, time::Duration};
use thiserror::Error;

use crate::pair::SessionId;

#[derive(Debug, Error)]
pub enum RelayError {
    /// The pairing reference was read before the outbound leg was linked.
    #[error("session {0} does not have an opposite connection yet")]
    NoOppositeConnection(SessionId),

    #[error("session {0} is already linked to an outbound connection")]
    AlreadyLinked(SessionId),

    #[error("outbound connection for session {outbound} cannot be linked to session {inbound}")]
    SessionMismatch {
        inbound: SessionId,
        outbound: SessionId,
    },

    #[error("failed to connect to upstream {addr}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out after {timeout:?} connecting to upstream {addr}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("TLS handshake with upstream {addr} failed")]
    Handshake {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid upstream server name: {0:?}")]
    InvalidServerName(String),
}

impl RelayError {
    /// True for errors raised while establishing the outbound leg.
    #[must_use]
    pub const fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::ConnectTimeout { .. } | Self::Handshake { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
