//! In-process test harness for the engine
//!
//! - `recorder` -- a `Handler` that reports every callback over a
//!   channel and performs scripted actions
//! - `tls` -- self-signed certificates and matching client connector
//! - `io` -- raw client helpers

#![allow(dead_code)]

pub mod io;
pub mod recorder;
pub mod tls;

pub use recorder::{Action, Event, Recorder};

use rai::{Mode, Server, ServerConfig, TlsContext};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// How long a test waits for any single event before failing.
pub const EVENT_WAIT: Duration = Duration::from_secs(5);

/// Loopback config on an OS-assigned port, with line tracing on.
pub fn config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        debug: true,
        ..ServerConfig::default()
    }
}

/// Start a server whose connections all use clones of `recorder`.
pub async fn start(config: ServerConfig, tls: Option<TlsContext>, recorder: Recorder) -> Server {
    Server::listen(config, tls, move |_| recorder.clone())
        .await
        .expect("server listens")
}

/// Wait for the next event.
pub async fn next_event(events: &mut UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(EVENT_WAIT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Assert that no further event arrives within `wait`.
pub async fn assert_quiet(events: &mut UnboundedReceiver<Event>, wait: Duration) {
    if let Ok(Some(event)) = tokio::time::timeout(wait, events.recv()).await {
        panic!("unexpected event: {event:?}");
    }
}

/// Collect data events until the transfer completes.
pub async fn collect_data(events: &mut UnboundedReceiver<Event>) -> Vec<u8> {
    let mut data = Vec::new();
    loop {
        match next_event(events).await {
            Event::Data(chunk) => data.extend_from_slice(&chunk),
            Event::Ready(mode) => {
                assert_eq!(mode, Mode::Command);
                return data;
            }
            other => panic!("unexpected event during data transfer: {other:?}"),
        }
    }
}

/// Wait until the server reports `count` live connections.
///
/// A connection leaves the registry just after its `on_end` runs.
pub async fn wait_for_connections(server: &Server, count: usize) {
    let deadline = tokio::time::Instant::now() + EVENT_WAIT;
    while server.connection_count() != count {
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected {count} connections, have {}",
            server.connection_count()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
