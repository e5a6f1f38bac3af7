//! `Server` — binds a listener and drives the reactor loop (spec.md §6
//! "Server address syntax", configuration surface).

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::config::ServerConfig;
use crate::conn::ConnState;
use crate::logger::{Level, Logger, TracingLogger};
use crate::pool::WorkerPool;
use crate::reactor::{self, CloseHandler, PacketHandler, PingHandler, ReactorDeps};
use crate::timeout::TimeoutTable;
use crate::upgrade::Upgrader;

/// Parses spec.md §6's `tcp://host:port` server address syntax into a
/// `SocketAddr`.
pub fn parse_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    let rest = addr.strip_prefix("tcp://").unwrap_or(addr);
    rest.parse::<SocketAddr>()
        .map_err(|e| anyhow::anyhow!("invalid server address '{addr}': {e}"))
}

/// Builder for [`Server`] — the `With*` options surface from spec.md §6,
/// rendered as method chaining (the idiomatic Rust shape for Go's
/// functional options).
pub struct ServerBuilder {
    config: ServerConfig,
    upgrader: Upgrader,
    handler: Option<PacketHandler>,
    on_ping: Option<PingHandler>,
    on_close: Option<CloseHandler>,
    logger: Arc<dyn Logger>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            config: ServerConfig::default(),
            upgrader: Upgrader::new(),
            handler: None,
            on_ping: None,
            on_close: None,
            logger: Arc::new(TracingLogger),
        }
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_conn_timeout(mut self, d: Duration) -> Self {
        self.config.conn_timeout = d;
        self
    }

    pub fn with_worker_pool(mut self, size: usize, nonblocking: bool, idle_expiry: Duration) -> Self {
        self.config.worker_pool.size = size;
        self.config.worker_pool.nonblocking = nonblocking;
        self.config.worker_pool.idle_expiry = idle_expiry;
        self
    }

    pub fn with_upgrader(mut self, upgrader: Upgrader) -> Self {
        self.upgrader = upgrader;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Install the Packet handler (spec.md §6 `WithHandler`). Typically
    /// this is [`crate::engine::ProtocolEngine::use_handler`]'s return
    /// value, but any `Packet -> impl Future<Output=()>` closure works.
    pub fn with_handler<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(reactor::Packet) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |packet| {
            Box::pin(f(packet)) as Pin<Box<dyn Future<Output = ()> + Send>>
        }));
        self
    }

    /// Install an already-boxed handler — what
    /// [`crate::engine::ProtocolEngine::use_handler`] returns.
    pub fn with_packet_handler(mut self, handler: PacketHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_on_ping_handler<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<ConnState>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_ping = Some(Arc::new(move |conn| {
            Box::pin(f(conn)) as Pin<Box<dyn Future<Output = ()> + Send>>
        }));
        self
    }

    pub fn with_on_close_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(Arc<ConnState>, Option<String>) + Send + Sync + 'static,
    {
        self.on_close = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> anyhow::Result<Server> {
        let handler = self
            .handler
            .ok_or_else(|| anyhow::anyhow!("with_handler must be set before build()"))?;

        let worker_pool = Arc::new(WorkerPool::new(
            self.config.worker_pool.size,
            self.config.worker_pool.nonblocking,
            self.config.worker_pool.idle_expiry,
        ));

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let logger = Arc::clone(&self.logger);
        let on_close = self.on_close.unwrap_or_else(reactor::noop_on_close);
        let on_close_for_table = Arc::clone(&on_close);

        let timeout_table = TimeoutTable::new(
            self.config.conn_timeout,
            Arc::new(move |conn: Arc<ConnState>| {
                if conn.claim_close() {
                    on_close_for_table(conn, Some("timeout".to_string()));
                }
            }),
            Arc::clone(&logger),
        );

        let deps = Arc::new(ReactorDeps {
            upgrader: Arc::new(self.upgrader),
            worker_pool,
            timeout_table,
            conn_timeout: self.config.conn_timeout,
            handler,
            on_ping: self.on_ping.unwrap_or_else(reactor::default_on_ping),
            on_close,
            logger,
        });

        Ok(Server {
            deps,
            sweep_period: self.config.sweep_period,
            shutdown_tx,
            shutdown_rx,
        })
    }
}

/// A bound, running (once [`Server::serve`] is called) WebSocket server.
pub struct Server {
    deps: Arc<ReactorDeps>,
    sweep_period: Duration,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Bind `addr` (spec.md §6 `tcp://host:port`) and accept connections
    /// until [`Server::stop`] is called or the listener errors out.
    pub async fn serve(&self, addr: &str) -> anyhow::Result<()> {
        let socket_addr = parse_addr(addr)?;
        let listener = TcpListener::bind(socket_addr).await?;
        self.deps.logger.log(Level::Info, "server", &format_args!("listening on {socket_addr}"));

        let sweeper = self.deps.timeout_table.spawn_sweeper(self.sweep_period);
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    self.deps.logger.log(Level::Info, "server", &"shutdown signal received — draining");
                    break;
                }

                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(c) => c,
                        Err(e) => {
                            self.deps.logger.log(Level::Error, "server", &format_args!("accept error: {e}"));
                            continue;
                        }
                    };
                    let deps = Arc::clone(&self.deps);
                    let conn_shutdown = self.shutdown_rx.clone();
                    tokio::spawn(async move {
                        reactor::serve_connection(stream, peer, deps, conn_shutdown).await;
                    });
                }
            }
        }

        sweeper.abort();
        Ok(())
    }

    /// Ask the reactor to drain (spec.md §5 `Stop(ctx)`). In-flight
    /// worker tasks are not cancelled; connection tasks observe the
    /// shutdown signal on their next `select!` wakeup.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn engine_deps(&self) -> Arc<ReactorDeps> {
        Arc::clone(&self.deps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_scheme() {
        let addr = parse_addr("tcp://127.0.0.1:9001").unwrap();
        assert_eq!(addr.port(), 9001);
    }

    #[test]
    fn parses_bare_socket_addr() {
        let addr = parse_addr("127.0.0.1:9001").unwrap();
        assert_eq!(addr.port(), 9001);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_addr("not-an-address").is_err());
    }
}
