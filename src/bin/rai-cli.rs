#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! CLI for running a demo line-protocol server and scripting clients against it

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use rai::{Command, Handler, Script, Server, ServerConfig, Session, TlsContext};
use rustls::pki_types::PrivatePkcs8KeyDer;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rai-cli")]
#[command(about = "Demo SMTP-style server and scripted client")]
struct Args {
    #[command(subcommand)]
    command: Cmd,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run a demo server until interrupted
    Serve {
        /// Address to bind (overrides RAI_HOST)
        #[arg(long)]
        host: Option<String>,

        /// Port to bind, 0 for any (overrides RAI_PORT)
        #[arg(long)]
        port: Option<u16>,

        /// Terminate TLS at accept time
        #[arg(long)]
        secure: bool,

        /// Idle timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Close idle connections
        #[arg(long)]
        disconnect_on_timeout: bool,

        /// Trace every line sent and received
        #[arg(long)]
        debug: bool,

        /// PEM certificate chain (self-signed when omitted)
        #[arg(long, requires = "key")]
        cert: Option<PathBuf>,

        /// PEM private key
        #[arg(long, requires = "cert")]
        key: Option<PathBuf>,
    },

    /// Send commands to a server one response at a time
    Script {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long, default_value = "2525")]
        port: u16,

        /// Name to verify during STARTTLS (defaults to the host)
        #[arg(long)]
        server_name: Option<String>,

        /// Trace every line sent and received
        #[arg(long)]
        debug: bool,

        /// Commands to send, in order
        commands: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Cmd::Serve {
            host,
            port,
            secure,
            timeout_ms,
            disconnect_on_timeout,
            debug,
            cert,
            key,
        } => {
            let mut config = ServerConfig::from_env()?;
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(ms) = timeout_ms {
                config.timeout = Some(Duration::from_millis(ms));
            }
            config.secure_connection |= secure;
            config.disconnect_on_timeout |= disconnect_on_timeout;
            config.debug |= debug;

            let tls = match (cert, key) {
                (Some(cert), Some(key)) => TlsContext::from_pem_files(&cert, &key)?,
                _ => self_signed()?,
            };
            cmd_serve(config, tls).await?;
        }
        Cmd::Script {
            host,
            port,
            server_name,
            debug,
            commands,
        } => {
            let mut script = Script::new(host, port).commands(commands).debug(debug);
            if let Some(name) = server_name {
                script = script.server_name(name);
            }
            cmd_script(&script, args.json).await?;
        }
    }

    Ok(())
}

async fn cmd_serve(config: ServerConfig, tls: TlsContext) -> anyhow::Result<()> {
    let server = Server::listen(config, Some(tls), |_| Demo::default()).await?;
    println!("listening on {}", server.local_addr());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;
    info!("Shutting down");
    server.end().await;
    Ok(())
}

async fn cmd_script(script: &Script, json: bool) -> anyhow::Result<()> {
    let transcript = script.run().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&transcript)?);
    } else {
        for response in &transcript.responses {
            print!("{response}");
        }
    }

    Ok(())
}

/// A fresh certificate for `localhost`.
fn self_signed() -> anyhow::Result<TlsContext> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .context("Failed to generate a self-signed certificate")?;
    let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    Ok(TlsContext::from_der(vec![cert.cert.der().clone()], key.into())?)
}

/// Minimal SMTP-flavoured handler that accepts and discards messages.
#[derive(Default)]
struct Demo {
    received: usize,
}

impl Handler for Demo {
    async fn on_connect(&mut self, session: &mut Session<'_>) {
        session.send("220 rai ready");
    }

    async fn on_command(&mut self, session: &mut Session<'_>, command: Command) {
        match command.keyword() {
            "HELO" => session.send("250 Hello"),
            "EHLO" if session.is_secure() => session.send("250 Hello"),
            "EHLO" => {
                session.send("250-Hello");
                session.send("250 STARTTLS");
            }
            "STARTTLS" => {
                session.send("220 Go ahead");
                session.start_tls();
            }
            "DATA" => {
                self.received = 0;
                session.send("354 End data with <CR><LF>.<CR><LF>");
                session.start_data_mode();
            }
            "NOOP" => session.send("250 OK"),
            "QUIT" => {
                session.send("221 Bye");
                session.end();
            }
            _ => session.send("500 Unknown command"),
        }
    }

    async fn on_data(&mut self, _session: &mut Session<'_>, data: Bytes) {
        self.received += data.len();
    }

    async fn on_ready(&mut self, session: &mut Session<'_>) {
        session.send(format!("250 Queued ({} bytes)", self.received));
    }
}
