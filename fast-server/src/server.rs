//! TCP server implementation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};

use crate::connection;
use crate::error::ServerError;
use crate::handler::{MethodRegistry, RpcHandler};

/// A full-duplex byte channel the server can dispatch on. The protocol
/// assumes in-order delivery but nothing TCP-specific.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
        }
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// A Fast RPC server: a method registry plus a dispatcher for any number
/// of connections.
///
/// Connections are independent and run in parallel; the registry is the
/// only state they share. `close` begins a graceful shutdown: new requests
/// are refused, in-flight requests complete naturally, and
/// [`Server::conns_destroyed`] resolves once the last connection is gone.
pub struct Server {
    config: ServerConfig,
    registry: Arc<RwLock<MethodRegistry>>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    draining: Arc<AtomicBool>,
    active_conns: watch::Sender<usize>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server.
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let (active_conns, _) = watch::channel(0usize);
        Self {
            config,
            registry: Arc::new(RwLock::new(MethodRegistry::new())),
            stats: Arc::new(ServerStats::default()),
            shutdown,
            draining: Arc::new(AtomicBool::new(false)),
            active_conns,
            running: AtomicBool::new(false),
        }
    }

    /// Registers an RPC method handler. Re-registering a name is an error.
    pub fn register_rpc_method(
        &self,
        name: &str,
        handler: impl RpcHandler,
    ) -> Result<(), ServerError> {
        self.registry.write().register(name, handler)
    }

    /// Accepts connections until `close` is called.
    pub async fn run(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("server listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            stream.set_nodelay(true).ok();
                            self.serve_connection(stream, addr.to_string());
                        }
                        Err(e) => {
                            tracing::error!("accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("server no longer accepting connections");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Attaches the dispatcher to an accepted connection. The transport
    /// only needs to be an in-order byte channel.
    pub fn serve_connection(&self, transport: impl Transport, peer: impl Into<String>) {
        let peer = peer.into();
        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        self.active_conns.send_modify(|n| *n += 1);

        let registry = self.registry.clone();
        let stats = self.stats.clone();
        let draining = self.draining.clone();
        let shutdown = self.shutdown.subscribe();
        let active_conns = self.active_conns.clone();

        tokio::spawn(async move {
            let result = connection::handle_connection(
                transport,
                peer.clone(),
                registry,
                stats.clone(),
                draining,
                shutdown,
            )
            .await;

            if let Err(e) = result {
                tracing::debug!("[{}] connection error: {}", peer, e);
                stats.errors_total.fetch_add(1, Ordering::Relaxed);
            }

            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            active_conns.send_modify(|n| *n -= 1);
            tracing::info!("client disconnected: {}", peer);
        });
    }

    /// Initiates graceful shutdown: the accept loop stops, fresh requests
    /// are refused with a server-closing error, and connections close as
    /// their in-flight requests drain.
    pub fn close(&self) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("server draining");
        let _ = self.shutdown.send(());
        // Wake conns_destroyed waiters even if no connection ever existed.
        self.active_conns.send_modify(|_| {});
    }

    /// Resolves once `close` has been called and the last connection has
    /// been destroyed.
    pub async fn conns_destroyed(&self) {
        let mut rx = self.active_conns.subscribe();
        loop {
            if self.draining.load(Ordering::SeqCst) && *rx.borrow() == 0 {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Returns whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}
