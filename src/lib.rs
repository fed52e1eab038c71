//! SMTP Relay
//!
//! A transparent TCP relay: every inbound client connection gets its own outbound
//! connection to a fixed upstream server, plaintext or over TLS, and bytes are
//! piped unmodified between the two until either side closes.

pub mod config;
pub mod connector;
pub mod error;
pub mod pair;
pub mod relay;
pub mod stream;
pub mod tls;

// Re-export commonly used types and functions
pub use config::{
    Config, DEFAULT_CONFIG_FILE, ListenConfig, SecurityMode, UpstreamConfig, UpstreamTlsConfig,
    load_config, parse_config,
};
pub use connector::{UpstreamConnector, UpstreamTarget};
pub use error::RelayError;
pub use pair::{
    BUFFER_SIZE, InboundConnection, OutboundConnection, PairedConnection, RelayStats, SessionId,
    SessionRegistry, SessionState,
};
pub use relay::Relay;
pub use stream::StreamType;
pub use tls::load_client_config;
