//! Error types and handling for the pipeline tunnel

use thiserror::Error;

/// Main error type for tunnel operations
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Malformed or contradictory configuration/policy (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Certificate, key or DH parameter material could not be used
    #[error("Credential error: {0}")]
    Credential(String),

    /// TLS negotiation with an upstream endpoint failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Peer sent a malformed multiplexing frame
    #[error("Frame protocol error: {0}")]
    FrameProtocol(String),

    /// No established channel became available in time
    #[error("No available channel: {0}")]
    NoAvailableChannel(String),

    /// The stream could not be carried even after failover
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// ICMP relay unsupported for the requested address family
    #[error("Capability unavailable: {0}")]
    Capability(String),

    /// The channel carrying a stream has failed
    #[error("Channel failed: {0}")]
    ChannelFailed(String),

    /// The channel no longer accepts new streams (draining or closed)
    #[error("Channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// Operation on a stream that was already closed
    #[error("Stream closed: {0}")]
    StreamClosed(u32),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS errors
    #[error("TLS error: {0}")]
    Tls(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Invalid state errors
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl TunnelError {
    /// True when the error came from the channel underneath a stream rather
    /// than from the stream itself, so placing the stream elsewhere may help.
    pub fn is_channel_failure(&self) -> bool {
        matches!(
            self,
            TunnelError::ChannelFailed(_)
                | TunnelError::ChannelUnavailable(_)
                | TunnelError::FrameProtocol(_)
                | TunnelError::Io(_)
        )
    }
}

/// Result type alias for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Helper trait for attaching context while converting foreign errors
pub trait IntoTunnelError<T> {
    fn into_tunnel_error(self, context: &str) -> Result<T>;
}

impl<T, E> IntoTunnelError<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn into_tunnel_error(self, context: &str) -> Result<T> {
        self.map_err(|e| TunnelError::InvalidState(format!("{context}: {e}")))
    }
}

impl From<toml::de::Error> for TunnelError {
    fn from(err: toml::de::Error) -> Self {
        TunnelError::Config(format!("TOML parsing error: {err}"))
    }
}

impl From<rustls::Error> for TunnelError {
    fn from(err: rustls::Error) -> Self {
        TunnelError::Tls(format!("TLS error: {err}"))
    }
}
