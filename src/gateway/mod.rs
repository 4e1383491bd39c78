//! WebSocket Gateway
//!
//! Accepts TCP connections, performs the WebSocket upgrade with path
//! routing, and hands each upgraded connection to the relay as either a
//! client peer or a service worker.

mod handshake;

pub use handshake::{query_param, route, Paths, Route, DEFAULT_PROTOCOL};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::messaging::Dispatcher;
use crate::relay::{Relay, StaticService};
use crate::session::{Connection, SessionOptions, WsSession};

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// Upgrade paths
    pub paths: Paths,
    /// Maximum concurrent connections (0 = unbounded)
    pub max_connections: usize,
    /// Per-connection session options
    pub session: SessionOptions,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            paths: Paths {
                client: "/client/conn".to_string(),
                worker: "/service/conn".to_string(),
            },
            max_connections: 100_000,
            session: SessionOptions::default(),
        }
    }
}

impl From<&Config> for GatewayConfig {
    fn from(config: &Config) -> Self {
        Self {
            bind_addr: config.server.bind,
            paths: Paths {
                client: config.server.client_path.clone(),
                worker: config.server.worker_path.clone(),
            },
            max_connections: config.server.max_connections,
            session: config.session.options(),
        }
    }
}

/// Decrements the live connection count when dropped
struct ConnectionGuard(Arc<AtomicUsize>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The gateway server
pub struct Gateway {
    config: GatewayConfig,
    relay: Arc<Relay>,
    /// Live connections, including those still in the handshake
    connections: Arc<AtomicUsize>,
    /// Shutdown signal
    shutdown: broadcast::Sender<()>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, relay: Arc<Relay>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            relay,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown,
        }
    }

    /// Build a gateway, dispatcher and relay from loaded configuration,
    /// registering every configured service
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_config(config: &Config) -> Self {
        let relay = Relay::new(Dispatcher::new(config.topic.cache_max));
        for service in &config.services {
            relay.add_service(Arc::new(StaticService::from_config(service)));
        }
        Self::new(GatewayConfig::from(config), Arc::new(relay))
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        info!(
            "WebSocket gateway listening on {} (client: {}, worker: {})",
            listener.local_addr()?,
            self.config.paths.client,
            self.config.paths.worker
        );

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Gateway shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("New TCP connection from {}", addr);
                        self.handle_connection(stream, addr);
                    }
                    Err(e) => {
                        error!("Failed to accept TCP connection: {}", e);
                    }
                }
            }
        }
    }

    /// Handle a new connection
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let max = self.config.max_connections;
        let current = self.connections.fetch_add(1, Ordering::AcqRel);
        let guard = ConnectionGuard(self.connections.clone());
        if max > 0 && current >= max {
            warn!("Connection limit {} reached, dropping {}", max, addr);
            return;
        }

        let relay = self.relay.clone();
        let paths = self.config.paths.clone();
        let options = self.config.session.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let _guard = guard;

            let mut routed = None;
            let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
                routed = Some(handshake::route(req, &paths, &relay, addr)?);
                Ok(response)
            };
            let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
                Ok(ws) => ws,
                Err(e) => {
                    debug!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };
            let Some(routed) = routed else {
                return;
            };

            let session = WsSession::new(ws, options);
            let conn: Arc<dyn Connection> = Arc::new(session.clone());
            let serve = async move {
                match routed {
                    Route::Client(info) => relay.serve_peer(info, conn).await,
                    Route::Worker { service } => relay.serve_worker(&service, conn).await,
                }
            };
            tokio::pin!(serve);

            tokio::select! {
                biased;

                result = &mut serve => {
                    if let Err(e) = result {
                        debug!("Connection error from {}: {}", addr, e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("Connection {} shutting down", addr);
                    // Closing the session ends the relay loop, which detaches
                    session.close().await;
                    let _ = serve.await;
                }
            }
        });
    }

    /// Stop accepting and close every connection
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        self.relay.dispatcher()
    }

    /// Attached client peers
    pub fn peer_count(&self) -> usize {
        self.relay.peers().count()
    }

    /// Attached service workers
    pub fn worker_count(&self) -> usize {
        self.relay.workers().count()
    }

    /// Open TCP connections, including those mid-handshake
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }
}
