//! Listener that runs one connection task per accepted socket

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionInfo, Handler, Settings};
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::tls::TlsContext;
use crate::transport::Transport;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A listening protocol server.
///
/// Each accepted connection gets its own [`Handler`] from the factory
/// passed to [`Server::listen`]; [`Handler::on_connect`] is the
/// "connected" notification.
#[derive(Debug)]
pub struct Server {
    local_addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

impl Server {
    /// Bind `config.host:config.port` and start accepting connections.
    ///
    /// With `config.secure_connection` every socket completes a TLS
    /// handshake before a handler is created for it. `tls` is also what
    /// [`Session::start_tls`](crate::Session::start_tls) upgrades with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Bind`] if the address cannot be bound (for
    /// example because another listener holds the port), or
    /// [`Error::Config`] if implicit TLS is requested without `tls`.
    pub async fn listen<F, H>(
        config: ServerConfig,
        tls: Option<TlsContext>,
        make_handler: F,
    ) -> Result<Self>
    where
        F: Fn(&ConnectionInfo) -> H + Send + Sync + 'static,
        H: Handler,
    {
        if config.secure_connection && tls.is_none() {
            return Err(Error::Config(
                "secure_connection requires a TLS context".into(),
            ));
        }

        let addr = config.addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| Error::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!(secure = config.secure_connection, "Listening on {local_addr}");

        let shutdown = CancellationToken::new();
        let registry = Arc::new(Registry::new(shutdown.clone()));
        let settings = Arc::new(Settings {
            timeout: config.timeout,
            disconnect_on_timeout: config.disconnect_on_timeout,
            debug: config.debug,
            tls,
        });

        let acceptor = Acceptor {
            listener,
            registry: registry.clone(),
            settings,
            make_handler: Arc::new(make_handler),
            implicit_tls: config.secure_connection,
            shutdown: shutdown.clone(),
            next_id: 1,
        };
        let accept_task = tokio::spawn(acceptor.run());

        Ok(Self {
            local_addr,
            registry,
            shutdown,
            accept_task: Some(accept_task),
        })
    }

    /// The address actually bound (useful with port `0`).
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Ids and peers of the live connections, by id.
    #[must_use]
    pub fn connections(&self) -> Vec<(u64, SocketAddr)> {
        self.registry.peers()
    }

    /// Close one connection. Returns `false` if it is not live.
    pub fn close_connection(&self, id: u64) -> bool {
        self.registry.cancel(id)
    }

    /// Stop accepting, close every live connection, and return once
    /// all of them and the listener are closed.
    pub async fn end(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.accept_task.take()
            && let Err(e) = task.await
        {
            warn!("Accept loop failed: {e}");
        }
        info!("Server on {} closed", self.local_addr);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Acceptor<F> {
    listener: TcpListener,
    registry: Arc<Registry>,
    settings: Arc<Settings>,
    make_handler: Arc<F>,
    implicit_tls: bool,
    shutdown: CancellationToken,
    next_id: u64,
}

impl<F, H> Acceptor<F>
where
    F: Fn(&ConnectionInfo) -> H + Send + Sync + 'static,
    H: Handler,
{
    async fn run(mut self) {
        let mut tasks = JoinSet::new();
        let shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Connection task failed: {e}");
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let info = ConnectionInfo {
                            id: self.next_id,
                            peer_addr,
                            secure: self.implicit_tls,
                        };
                        self.next_id += 1;
                        tasks.spawn(serve(
                            stream,
                            info,
                            self.registry.clone(),
                            self.settings.clone(),
                            self.make_handler.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!("Accept failed: {e}");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        debug!(remaining = tasks.len(), "Waiting for connections to close");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Connection task failed: {e}");
            }
        }
        drop(self.listener);
    }
}

async fn serve<F, H>(
    stream: TcpStream,
    info: ConnectionInfo,
    registry: Arc<Registry>,
    settings: Arc<Settings>,
    make_handler: Arc<F>,
) where
    F: Fn(&ConnectionInfo) -> H + Send + Sync + 'static,
    H: Handler,
{
    let id = info.id;
    let token = registry.register(id, info.peer_addr);
    debug!(id, peer = %info.peer_addr, "Accepted connection");

    let transport = match (info.secure, settings.tls.as_ref()) {
        (false, _) => Ok(Transport::Plain(stream)),
        (true, Some(tls)) => tokio::select! {
            secured = Transport::accept(stream, tls, settings.timeout) => secured,
            () = token.cancelled() => Err(Error::Closed),
        },
        (true, None) => Err(Error::TlsUnavailable),
    };

    match transport {
        Ok(transport) => {
            let handler = (*make_handler)(&info);
            Connection::new(info, transport, handler, settings, token)
                .run()
                .await;
        }
        Err(e) => warn!(id, peer = %info.peer_addr, "Implicit TLS failed: {e}"),
    }

    registry.unregister(id);
}
