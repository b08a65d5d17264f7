use thiserror::Error;

/// Common error types for the mobile proxy
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("DNS resolution failed: {0}")]
    Dns(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for mobile proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn dns(msg: impl Into<String>) -> Self {
        Self::Dns(msg.into())
    }

    pub fn tunnel(msg: impl Into<String>) -> Self {
        Self::Tunnel(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

impl From<crate::DomainError> for ProxyError {
    fn from(err: crate::DomainError) -> Self {
        Self::InvalidAddress(err.to_string())
    }
}

impl From<crate::ConfigError> for ProxyError {
    fn from(err: crate::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
