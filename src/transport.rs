//! The socket a connection talks through (plain or TLS)

use crate::error::{Error, Result};
use crate::tls::TlsContext;
use bytes::BytesMut;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

type TlsStream = tokio_rustls::server::TlsStream<TcpStream>;

/// Exactly one active handle per connection.
///
/// `Detached` only exists while the plain socket has been moved into a
/// handshake, and after a handshake that failed and consumed it.
#[derive(Debug)]
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream>),
    Detached,
}

impl Transport {
    /// Run a server-side handshake over `stream`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] if the handshake fails or does not
    /// finish within `limit`.
    pub async fn accept(
        stream: TcpStream,
        tls: &TlsContext,
        limit: Option<Duration>,
    ) -> Result<Self> {
        let handshake = tls.acceptor().accept(stream);
        let stream = match limit {
            Some(limit) => tokio::time::timeout(limit, handshake)
                .await
                .map_err(|_| Error::Handshake("timed out".into()))?,
            None => handshake.await,
        }
        .map_err(|e| Error::Handshake(e.to_string()))?;
        Ok(Self::Tls(Box::new(stream)))
    }

    /// Consume a plain transport and return its TLS replacement.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UpgradeRejected`] if the transport is not plain,
    /// otherwise as [`Self::accept`].
    pub async fn upgrade(self, tls: &TlsContext, limit: Option<Duration>) -> Result<Self> {
        match self {
            Self::Plain(stream) => Self::accept(stream, tls, limit).await,
            Self::Tls(_) | Self::Detached => Err(Error::UpgradeRejected),
        }
    }

    pub const fn is_secure(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// Read whatever is available into `buf`. `Ok(0)` means EOF.
    pub async fn read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read_buf(buf).await,
            Self::Tls(stream) => stream.read_buf(buf).await,
            Self::Detached => Err(detached()),
        }
    }

    /// Write all of `data` and flush.
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Self::Plain(stream) => {
                stream.write_all(data).await?;
                stream.flush().await
            }
            Self::Tls(stream) => {
                stream.write_all(data).await?;
                stream.flush().await
            }
            Self::Detached => Err(detached()),
        }
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(stream) => stream.shutdown().await,
            Self::Tls(stream) => stream.shutdown().await,
            Self::Detached => Ok(()),
        }
    }
}

fn detached() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport detached")
}
