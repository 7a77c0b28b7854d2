//! Error types for rai

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The listening socket could not be bound (typically address in use).
    #[error("Bind error on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// STARTTLS requested on a connection that is already secure.
    #[error("Connection is already secure")]
    UpgradeRejected,

    #[error("No TLS context configured")]
    TlsUnavailable,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection closed")]
    Closed,
}

impl Error {
    /// Whether this is a bind failure caused by the address already being in use.
    #[must_use]
    pub fn is_addr_in_use(&self) -> bool {
        matches!(
            self,
            Self::Bind { source, .. } if source.kind() == std::io::ErrorKind::AddrInUse
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
