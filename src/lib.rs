//! Engine for line-oriented protocol servers
//!
//! `rai` handles the transport side of SMTP/POP3-style protocols and
//! leaves command semantics to the caller: it accepts connections,
//! frames CRLF-terminated command lines (pipelining included), switches
//! into a dot-terminated bulk data mode on request, and upgrades open
//! connections to TLS with STARTTLS or terminates TLS at accept time.
//!
//! Commands arriving in the same plaintext segment after a STARTTLS
//! request are discarded, never executed before or after the handshake.
//!
//! ```no_run
//! use rai::{Command, Handler, Server, ServerConfig, Session};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     async fn on_connect(&mut self, session: &mut Session<'_>) {
//!         session.send("220 Welcome");
//!     }
//!
//!     async fn on_command(&mut self, session: &mut Session<'_>, command: Command) {
//!         match command.keyword() {
//!             "QUIT" => {
//!                 session.send("221 Bye");
//!                 session.end();
//!             }
//!             _ => session.send(format!("250 {command}")),
//!         }
//!     }
//! }
//!
//! # async fn demo() -> rai::Result<()> {
//! let server = Server::listen(ServerConfig::default(), None, |_| Echo).await?;
//! server.end().await;
//! # Ok(())
//! # }
//! ```

mod command;
mod config;
mod connection;
mod error;
mod framer;
pub mod mockup;
mod registry;
mod server;
mod tls;
mod transport;

pub use command::Command;
pub use config::ServerConfig;
pub use connection::{ConnectionHandle, ConnectionInfo, Handler, Session};
pub use error::{Error, Result};
pub use framer::{Framer, Mode, Record};
pub use mockup::{Script, Transcript};
pub use server::Server;
pub use tls::TlsContext;
