//! Server configuration

use crate::error::{Error, Result};
use std::env;
use std::time::Duration;

/// Listener and per-connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    /// Port to bind. `0` lets the OS pick one.
    pub port: u16,
    /// Terminate TLS at accept time (implicit TLS).
    pub secure_connection: bool,
    /// Idle timeout, re-armed on every successful read.
    pub timeout: Option<Duration>,
    /// Close the connection right after the timeout notification.
    pub disconnect_on_timeout: bool,
    /// Trace every received and sent line.
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 2525,
            secure_connection: false,
            timeout: None,
            disconnect_on_timeout: false,
            debug: false,
        }
    }
}

impl ServerConfig {
    /// Load server configuration from environment variables
    ///
    /// Reads from `.env` file if present. All variables are optional:
    /// - `RAI_HOST` (default: `127.0.0.1`)
    /// - `RAI_PORT` (default: `2525`)
    /// - `RAI_SECURE` (default: `false`)
    /// - `RAI_TIMEOUT_MS` (default: no timeout)
    /// - `RAI_DISCONNECT_ON_TIMEOUT` (default: `false`)
    /// - `RAI_DEBUG` (default: `false`)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable is set to an invalid value.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let port = match lookup("RAI_PORT") {
            Some(raw) => raw
                .parse()
                .map_err(|e| Error::Config(format!("Invalid RAI_PORT: {e}")))?,
            None => defaults.port,
        };

        let timeout = match lookup("RAI_TIMEOUT_MS") {
            Some(raw) => {
                let ms: u64 = raw
                    .parse()
                    .map_err(|e| Error::Config(format!("Invalid RAI_TIMEOUT_MS: {e}")))?;
                Some(Duration::from_millis(ms))
            }
            None => None,
        };

        Ok(Self {
            host: lookup("RAI_HOST").unwrap_or(defaults.host),
            port,
            secure_connection: flag(&lookup, "RAI_SECURE")?,
            timeout,
            disconnect_on_timeout: flag(&lookup, "RAI_DISCONNECT_ON_TIMEOUT")?,
            debug: flag(&lookup, "RAI_DEBUG")?,
        })
    }

    /// `host:port` as passed to the socket layer.
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<bool> {
    let Some(raw) = lookup(key) else {
        return Ok(false);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(Error::Config(format!("Invalid {key}: {other}"))),
    }
}
