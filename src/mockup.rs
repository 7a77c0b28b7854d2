//! Scripted client for driving a server through a fixed command list
//!
//! The client waits for a response, sends the next command, and
//! repeats until the list is exhausted. A `STARTTLS` or `STLS` command
//! makes it upgrade its own socket after reading the response, before
//! sending the following command.
//!
//! ```no_run
//! # async fn demo() -> rai::Result<()> {
//! use rai::Script;
//!
//! let transcript = Script::new("127.0.0.1", 2525)
//!     .commands(["EHLO client", "STARTTLS", "EHLO client", "QUIT"])
//!     .run()
//!     .await?;
//! println!("Final: {}", transcript.last.trim());
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use bytes::BytesMut;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Everything the server sent, one entry per read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Transcript {
    /// The response received after the last command was sent.
    pub last: String,
    pub responses: Vec<String>,
}

/// A fixed sequence of commands to run against a server.
#[derive(Clone)]
pub struct Script {
    host: String,
    port: u16,
    commands: Vec<String>,
    debug: bool,
    connector: Option<TlsConnector>,
    server_name: Option<String>,
}

impl Script {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            commands: Vec::new(),
            debug: false,
            connector: None,
            server_name: None,
        }
    }

    /// Commands to send, without line terminators.
    #[must_use]
    pub fn commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands = commands.into_iter().map(Into::into).collect();
        self
    }

    /// Log every line sent and received.
    #[must_use]
    pub const fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Connector used for STARTTLS. Defaults to one that accepts any
    /// certificate.
    #[must_use]
    pub fn tls_connector(mut self, connector: TlsConnector) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Name presented during the handshake. Defaults to the host.
    #[must_use]
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Connect and run every command.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails, the server closes the
    /// connection before the script is done ([`Error::Closed`]), or a
    /// STARTTLS handshake fails.
    pub async fn run(&self) -> Result<Transcript> {
        let addr = format!("{}:{}", self.host, self.port);
        debug!("Connecting to {addr}");
        let mut stream = ClientStream::Plain(TcpStream::connect(&addr).await?);

        let mut responses = Vec::new();
        let mut buf = BytesMut::with_capacity(4096);
        let mut cursor = 0;
        let mut previous: Option<&str> = None;

        loop {
            buf.clear();
            if stream.read_buf(&mut buf).await? == 0 {
                return Err(Error::Closed);
            }
            let response = String::from_utf8_lossy(&buf).into_owned();
            if self.debug {
                debug!("S: {}", response.trim_end());
            }
            responses.push(response);

            let Some(command) = self.commands.get(cursor) else {
                stream.shutdown().await.ok();
                break;
            };

            if previous.is_some_and(is_starttls) {
                stream = stream.upgrade(&self.connector()?, self.sni_name()?).await?;
                if self.debug {
                    debug!("TLS connection secured");
                }
            }

            if self.debug {
                debug!("C: {command}");
            }
            stream.write_line(command).await?;
            previous = Some(command.as_str());
            cursor += 1;
        }

        Ok(Transcript {
            last: responses.last().cloned().unwrap_or_default(),
            responses,
        })
    }

    fn connector(&self) -> Result<TlsConnector> {
        match &self.connector {
            Some(connector) => Ok(connector.clone()),
            None => insecure_connector(),
        }
    }

    fn sni_name(&self) -> Result<ServerName<'static>> {
        let name = self.server_name.as_ref().unwrap_or(&self.host).clone();
        ServerName::try_from(name).map_err(|e| Error::Tls(format!("Invalid server name: {e}")))
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Script")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("commands", &self.commands)
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}

fn is_starttls(command: &str) -> bool {
    let command = command.trim();
    command.eq_ignore_ascii_case("STARTTLS") || command.eq_ignore_ascii_case("STLS")
}

enum ClientStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl ClientStream {
    async fn read_buf(&mut self, buf: &mut BytesMut) -> std::io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read_buf(buf).await,
            Self::Tls(stream) => stream.read_buf(buf).await,
        }
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let data = format!("{line}\r\n");
        match self {
            Self::Plain(stream) => {
                stream.write_all(data.as_bytes()).await?;
                stream.flush().await
            }
            Self::Tls(stream) => {
                stream.write_all(data.as_bytes()).await?;
                stream.flush().await
            }
        }
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(stream) => stream.shutdown().await,
            Self::Tls(stream) => stream.shutdown().await,
        }
    }

    async fn upgrade(self, connector: &TlsConnector, name: ServerName<'static>) -> Result<Self> {
        let Self::Plain(tcp) = self else {
            return Err(Error::UpgradeRejected);
        };
        let tls = connector
            .connect(name, tcp)
            .await
            .map_err(|e| Error::Handshake(e.to_string()))?;
        Ok(Self::Tls(Box::new(tls)))
    }
}

/// Build a TLS connector that trusts whatever certificate the server
/// presents.
///
/// Servers under test use self-signed certificates, so the chain and
/// name are not checked. Handshake signatures still are.
///
/// # Errors
///
/// Returns [`Error::Tls`] if the crypto provider offers no usable
/// protocol version.
pub fn insecure_connector() -> Result<TlsConnector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = TrustAnyCertificate {
        algorithms: provider.signature_verification_algorithms,
    };
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

#[derive(Debug)]
struct TrustAnyCertificate {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for TrustAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
