//! Test certificates
//!
//! A fresh self-signed certificate for `localhost` is generated with
//! `rcgen` per call, so no cert files are needed. The returned connector
//! trusts exactly that certificate.

use rai::TlsContext;
use rcgen::generate_simple_self_signed;
use rustls::pki_types::{PrivatePkcs8KeyDer, ServerName};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

/// Name the test certificate is issued for.
pub const SERVER_NAME: &str = "localhost";

/// Server context and a client connector that trusts it.
pub fn pair() -> (TlsContext, TlsConnector) {
    let cert = generate_simple_self_signed(vec![SERVER_NAME.to_string()])
        .expect("generate self-signed cert");

    let cert_der = cert.cert.der().clone();
    let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    let context = TlsContext::from_der(vec![cert_der.clone()], key_der.into())
        .expect("build server TLS context");

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert_der).expect("trust test certificate");

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let client = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("protocol versions")
        .with_root_certificates(roots)
        .with_no_client_auth();

    (context, TlsConnector::from(Arc::new(client)))
}

/// Run the client side of a handshake over `tcp`.
pub async fn secure(connector: &TlsConnector, tcp: TcpStream) -> TlsStream<TcpStream> {
    let name = ServerName::try_from(SERVER_NAME).expect("server name");
    connector.connect(name, tcp).await.expect("client handshake")
}
