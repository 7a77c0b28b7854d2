//! Per-connection protocol state machine
//!
//! A [`Connection`] owns one transport, one [`Framer`] and one
//! [`Handler`]. Each read is fed to the framer and the resulting records
//! are drained one at a time; handler callbacks are awaited in that
//! order, so a callback that switches to data mode or requests STARTTLS
//! takes effect before the next buffered record is looked at.
//!
//! ```text
//!   COMMAND --start_data_mode()--> DATA --"."--> COMMAND
//!   COMMAND --start_tls()--------> handshake --> COMMAND (secure)
//!   *       --end / EOF / error--> CLOSING
//! ```

use crate::command::Command;
use crate::error::{Error, Result};
use crate::framer::{Framer, Mode, Record};
use crate::tls::TlsContext;
use crate::transport::Transport;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const READ_BUFFER: usize = 8 * 1024;
const CRLF: &[u8] = b"\r\n";

/// Callbacks a connection dispatches to.
///
/// Every callback except [`Handler::on_end`] receives a [`Session`]
/// through which it can answer the peer or change the connection's
/// mode. Callbacks for one connection never run concurrently, and run
/// in the order the triggering bytes arrived.
pub trait Handler: Send + 'static {
    /// The connection was accepted (and, for implicit TLS, secured).
    fn on_connect(&mut self, _session: &mut Session<'_>) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// A command line arrived in command mode.
    fn on_command(
        &mut self,
        session: &mut Session<'_>,
        command: Command,
    ) -> impl Future<Output = ()> + Send;

    /// Bulk data arrived in data mode, unstuffed, lines joined by CRLF.
    fn on_data(&mut self, _session: &mut Session<'_>, _data: Bytes) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// The data terminator was seen; the connection is back in command mode.
    fn on_ready(&mut self, _session: &mut Session<'_>) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// The connection became secure: either it was accepted with
    /// implicit TLS (called right after [`Handler::on_connect`]), or a
    /// STARTTLS upgrade requested with [`Session::start_tls`] completed.
    fn on_secure(&mut self, _session: &mut Session<'_>) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// No bytes were read for the configured idle timeout.
    fn on_timeout(&mut self, _session: &mut Session<'_>) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Something went wrong. Transport and handshake failures are
    /// followed by the connection closing; rejected upgrades are not.
    fn on_error(
        &mut self,
        session: &mut Session<'_>,
        error: Error,
    ) -> impl Future<Output = ()> + Send {
        warn!(id = session.id(), peer = %session.peer_addr(), "Connection error: {error}");
        async {}
    }

    /// The connection is closed. Called exactly once.
    fn on_end(&mut self) {}
}

/// Identity of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: u64,
    pub peer_addr: SocketAddr,
    pub secure: bool,
}

/// Per-connection policy shared by every connection of a server.
#[derive(Debug, Clone, Default)]
pub(crate) struct Settings {
    pub timeout: Option<Duration>,
    pub disconnect_on_timeout: bool,
    pub debug: bool,
    pub tls: Option<TlsContext>,
}

#[derive(Debug)]
enum Control {
    Send(Bytes),
    End,
}

type SecuredCallback = Box<dyn FnOnce(&mut Session<'_>) + Send>;

struct Upgrade {
    on_secure: Option<SecuredCallback>,
}

/// Connection state reachable from handler callbacks.
struct Context {
    info: ConnectionInfo,
    framer: Framer,
    outbox: BytesMut,
    /// Data lines of the current batch not yet given to `on_data`.
    data: BytesMut,
    /// Lines seen in the current transfer; every line after the first
    /// is preceded by the CRLF that ended its predecessor.
    data_lines: usize,
    upgrade: Option<Upgrade>,
    errors: VecDeque<Error>,
    closing: bool,
    tls_available: bool,
    debug: bool,
    control: mpsc::UnboundedSender<Control>,
}

impl Context {
    fn push_data(&mut self, line: &[u8]) {
        if self.data_lines > 0 {
            self.data.extend_from_slice(CRLF);
        }
        self.data.extend_from_slice(line);
        self.data_lines += 1;
    }
}

/// A handler's view of its connection during a callback.
pub struct Session<'a> {
    ctx: &'a mut Context,
}

impl<'a> Session<'a> {
    const fn new(ctx: &'a mut Context) -> Self {
        Self { ctx }
    }
}

impl Session<'_> {
    /// Queue `line` followed by CRLF. Output is flushed to the active
    /// transport as soon as the callback returns.
    pub fn send(&mut self, line: impl AsRef<[u8]>) {
        let line = line.as_ref();
        if self.ctx.debug {
            debug!(id = self.ctx.info.id, "S: {}", String::from_utf8_lossy(line));
        }
        frame_line(&mut self.ctx.outbox, line);
    }

    /// Treat everything from the next buffered byte on as bulk data.
    pub fn start_data_mode(&mut self) {
        self.ctx.framer.set_mode(Mode::Data);
        self.ctx.data.clear();
        self.ctx.data_lines = 0;
    }

    /// Upgrade to TLS once this callback returns, then fire
    /// [`Handler::on_secure`].
    ///
    /// Everything the peer sent after the triggering line is discarded
    /// immediately. On a secure connection the request is rejected with
    /// [`Error::UpgradeRejected`] through [`Handler::on_error`].
    pub fn start_tls(&mut self) {
        self.request_upgrade(None);
    }

    /// Like [`Self::start_tls`], but run `on_secure` instead of
    /// [`Handler::on_secure`] when the handshake completes.
    pub fn start_tls_then<F>(&mut self, on_secure: F)
    where
        F: FnOnce(&mut Session<'_>) + Send + 'static,
    {
        self.request_upgrade(Some(Box::new(on_secure)));
    }

    fn request_upgrade(&mut self, on_secure: Option<SecuredCallback>) {
        if self.ctx.info.secure || self.ctx.upgrade.is_some() {
            self.ctx.errors.push_back(Error::UpgradeRejected);
            return;
        }
        if !self.ctx.tls_available {
            self.ctx.errors.push_back(Error::TlsUnavailable);
            return;
        }

        let dropped = self.ctx.framer.buffered();
        self.ctx.framer.discard();
        if dropped > 0 {
            debug!(id = self.ctx.info.id, dropped, "Discarded bytes pipelined after STARTTLS");
        }
        self.ctx.upgrade = Some(Upgrade { on_secure });
    }

    /// Close the connection once this callback returns.
    pub fn end(&mut self) {
        self.ctx.closing = true;
    }

    #[must_use]
    pub const fn is_secure(&self) -> bool {
        self.ctx.info.secure
    }

    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.ctx.framer.mode()
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.ctx.info.id
    }

    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.ctx.info.peer_addr
    }

    #[must_use]
    pub const fn info(&self) -> ConnectionInfo {
        self.ctx.info
    }

    /// A handle that outlives this callback, for work spawned elsewhere.
    #[must_use]
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            id: self.ctx.info.id,
            tx: self.ctx.control.clone(),
        }
    }
}

/// Cloneable, `'static` access to a connection from outside its callbacks.
///
/// Messages are processed by the connection between reads, in the
/// order they were sent.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: u64,
    tx: mpsc::UnboundedSender<Control>,
}

impl ConnectionHandle {
    /// Write `line` followed by CRLF.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] if the connection has ended.
    pub fn send(&self, line: impl AsRef<[u8]>) -> Result<()> {
        let mut buf = BytesMut::new();
        frame_line(&mut buf, line.as_ref());
        self.tx
            .send(Control::Send(buf.freeze()))
            .map_err(|_| Error::Closed)
    }

    /// Close the connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] if the connection has already ended.
    pub fn end(&self) -> Result<()> {
        self.tx.send(Control::End).map_err(|_| Error::Closed)
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

fn frame_line(buf: &mut BytesMut, line: &[u8]) {
    buf.reserve(line.len() + CRLF.len());
    buf.extend_from_slice(line);
    buf.extend_from_slice(CRLF);
}

pub(crate) struct Connection<H> {
    handler: H,
    ctx: Context,
    transport: Transport,
    control: mpsc::UnboundedReceiver<Control>,
    settings: Arc<Settings>,
    shutdown: CancellationToken,
    deadline: Option<Instant>,
}

impl<H: Handler> Connection<H> {
    pub(crate) fn new(
        info: ConnectionInfo,
        transport: Transport,
        handler: H,
        settings: Arc<Settings>,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = Context {
            info: ConnectionInfo {
                secure: transport.is_secure(),
                ..info
            },
            framer: Framer::new(),
            outbox: BytesMut::new(),
            data: BytesMut::new(),
            data_lines: 0,
            upgrade: None,
            errors: VecDeque::new(),
            closing: false,
            tls_available: settings.tls.is_some(),
            debug: settings.debug,
            control: tx,
        };
        Self {
            handler,
            ctx,
            transport,
            control: rx,
            settings,
            shutdown,
            deadline: None,
        }
    }

    /// Serve the connection until it closes.
    pub(crate) async fn run(mut self) {
        let id = self.ctx.info.id;
        debug!(id, peer = %self.ctx.info.peer_addr, secure = self.ctx.info.secure, "Connection started");
        self.arm();

        let mut session = Session::new(&mut self.ctx);
        self.handler.on_connect(&mut session).await;
        if self.ctx.info.secure {
            let mut session = Session::new(&mut self.ctx);
            self.handler.on_secure(&mut session).await;
        }
        if let Err(e) = self.step().await {
            self.fail(e).await;
        }

        let shutdown = self.shutdown.clone();
        let mut buf = BytesMut::with_capacity(READ_BUFFER);
        while !self.ctx.closing {
            buf.reserve(READ_BUFFER);
            let deadline = self.deadline;

            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!(id, "Server shutting down");
                    break;
                }
                Some(control) = self.control.recv() => {
                    if let Err(e) = self.apply(control).await {
                        self.fail(e).await;
                    }
                }
                read = self.transport.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        debug!(id, "Peer closed connection");
                        break;
                    }
                    Ok(_) => {
                        self.arm();
                        let chunk = buf.split();
                        self.ctx.framer.feed(&chunk);
                        if let Err(e) = self.step().await {
                            self.fail(e).await;
                        }
                    }
                    Err(e) => self.fail(Error::Io(e)).await,
                },
                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.deadline = None;
                    if let Err(e) = self.timed_out().await {
                        self.fail(e).await;
                    }
                }
            }
        }

        self.close().await;
    }

    /// Re-arm the idle timer.
    ///
    /// A limit too large to represent never fires.
    fn arm(&mut self) {
        self.deadline = self
            .settings
            .timeout
            .and_then(|limit| Instant::now().checked_add(limit));
    }

    /// Flush, perform a pending upgrade, and drain buffered records,
    /// until nothing else is pending.
    async fn step(&mut self) -> Result<()> {
        self.settle().await?;
        loop {
            if self.ctx.closing {
                return Ok(());
            }
            if let Some(upgrade) = self.ctx.upgrade.take() {
                self.upgrade(upgrade).await?;
            }
            self.drain().await?;
            if self.ctx.upgrade.is_none() {
                return Ok(());
            }
        }
    }

    async fn drain(&mut self) -> Result<()> {
        while !self.ctx.closing && self.ctx.upgrade.is_none() {
            let Some(record) = self.ctx.framer.next_record() else {
                break;
            };
            match record {
                Record::Command(line) => {
                    let command = Command::parse(line);
                    if self.ctx.debug {
                        debug!(id = self.ctx.info.id, "C: {command}");
                    }
                    let mut session = Session::new(&mut self.ctx);
                    self.handler.on_command(&mut session, command).await;
                    self.settle().await?;
                }
                Record::Data(line) => self.ctx.push_data(&line),
                Record::DataEnd => {
                    self.deliver_data().await?;
                    self.ctx.data_lines = 0;
                    if self.ctx.debug {
                        debug!(id = self.ctx.info.id, "C: .");
                    }
                    let mut session = Session::new(&mut self.ctx);
                    self.handler.on_ready(&mut session).await;
                    self.settle().await?;
                }
            }
        }
        self.deliver_data().await
    }

    async fn deliver_data(&mut self) -> Result<()> {
        if self.ctx.data.is_empty() {
            return Ok(());
        }
        let data = self.ctx.data.split().freeze();
        if self.ctx.debug {
            debug!(id = self.ctx.info.id, bytes = data.len(), "C: <data>");
        }
        let mut session = Session::new(&mut self.ctx);
        self.handler.on_data(&mut session, data).await;
        self.settle().await
    }

    /// Write queued output and deliver queued non-fatal errors.
    async fn settle(&mut self) -> Result<()> {
        loop {
            if !self.ctx.outbox.is_empty() {
                let out = self.ctx.outbox.split();
                self.transport.write_all(&out).await?;
            }
            let Some(error) = self.ctx.errors.pop_front() else {
                return Ok(());
            };
            let mut session = Session::new(&mut self.ctx);
            self.handler.on_error(&mut session, error).await;
        }
    }

    async fn upgrade(&mut self, upgrade: Upgrade) -> Result<()> {
        let tls = self.settings.tls.clone().ok_or(Error::TlsUnavailable)?;
        let id = self.ctx.info.id;
        debug!(id, "Starting TLS handshake");

        let plain = std::mem::replace(&mut self.transport, Transport::Detached);
        let shutdown = self.shutdown.clone();
        self.transport = tokio::select! {
            secured = plain.upgrade(&tls, self.settings.timeout) => secured?,
            () = shutdown.cancelled() => {
                debug!(id, "Server shutting down during handshake");
                self.ctx.closing = true;
                return Ok(());
            }
        };
        self.ctx.info.secure = true;
        self.arm();
        info!(id, peer = %self.ctx.info.peer_addr, "Connection secured");

        let mut session = Session::new(&mut self.ctx);
        match upgrade.on_secure {
            Some(on_secure) => on_secure(&mut session),
            None => self.handler.on_secure(&mut session).await,
        }
        self.settle().await
    }

    async fn timed_out(&mut self) -> Result<()> {
        info!(id = self.ctx.info.id, "Connection timed out");
        let mut session = Session::new(&mut self.ctx);
        self.handler.on_timeout(&mut session).await;
        if self.settings.disconnect_on_timeout {
            self.ctx.closing = true;
        }
        self.step().await
    }

    async fn apply(&mut self, control: Control) -> Result<()> {
        match control {
            Control::Send(line) => {
                if self.ctx.debug {
                    debug!(id = self.ctx.info.id, "S: {}", String::from_utf8_lossy(line.trim_ascii_end()));
                }
                self.ctx.outbox.extend_from_slice(&line);
                self.settle().await
            }
            Control::End => {
                self.ctx.closing = true;
                Ok(())
            }
        }
    }

    /// Report a fatal error and mark the connection for closing.
    async fn fail(&mut self, error: Error) {
        self.ctx.closing = true;
        let mut session = Session::new(&mut self.ctx);
        self.handler.on_error(&mut session, error).await;
        if let Err(e) = self.settle().await {
            debug!(id = self.ctx.info.id, "Discarding output after failure: {e}");
        }
    }

    async fn close(&mut self) {
        let id = self.ctx.info.id;
        if let Err(e) = self.transport.shutdown().await {
            debug!(id, "Shutdown failed: {e}");
        }
        self.transport = Transport::Detached;
        self.ctx.closing = true;
        self.handler.on_end();
        info!(id, peer = %self.ctx.info.peer_addr, "Connection closed");
    }
}
