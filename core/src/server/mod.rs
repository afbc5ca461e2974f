/*
 * mod.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Portiere, an asynchronous HTTP and WebSocket server.
 *
 * Portiere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Portiere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Portiere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Server orchestrator: listeners (plain + optional TLS), accept loops,
//! connection limit, statistics, router swap and shutdown.

pub mod connection;
pub mod files;
pub mod ratelimit;
pub mod router;
pub mod workers;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::config::{RateLimitConfig, ServerConfig};
use crate::net;
use crate::stats::ServerStats;
use connection::Connection;
use files::StaticFiles;
use ratelimit::RateLimiter;
use router::{CompressionSettings, Router};

/// State shared by every connection.
pub(crate) struct ServerShared {
    pub(crate) router: RwLock<Arc<Router>>,
    pub(crate) stats: Arc<ServerStats>,
    pub(crate) keep_alive_timeout: Duration,
    pub(crate) max_request_size: usize,
    pub(crate) ws_max_frame_size: usize,
}

impl ServerShared {
    /// Snapshot of the current router; reconfiguration swaps the Arc.
    pub(crate) fn router(&self) -> Arc<Router> {
        self.router.read().unwrap().clone()
    }
}

/// Cloneable trigger that stops the accept loops.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// The server: bound listeners plus the shared dispatch state. Construct
/// with `bind`, then `run` until a `ShutdownHandle` fires.
pub struct Server {
    shared: Arc<ServerShared>,
    listener: TcpListener,
    tls: Option<(TcpListener, TlsAcceptor)>,
    rate_limiter: Option<Arc<RateLimiter>>,
    max_connections: u64,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    /// Bind listeners and finish wiring the router from the configuration:
    /// compression settings, the static file service, and (first in the
    /// middleware chain, so it gates everything) the configured rate limiter.
    pub async fn bind(config: ServerConfig, mut router: Router) -> io::Result<Server> {
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

        router.set_compression(CompressionSettings::from_config(&config));
        if config.serve_static_files {
            router.set_static_files(StaticFiles::from_config(&config));
        }
        let rate_limiter = config.rate_limit.as_ref().map(|rl| {
            let limiter = Arc::new(RateLimiter::new(rl));
            router.prepend_middleware(ratelimit::middleware(limiter.clone(), None));
            limiter
        });

        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let tls = if config.enable_https {
            let acceptor = net::build_acceptor(&config)?;
            let tls_listener =
                TcpListener::bind((config.host.as_str(), config.https_port)).await?;
            Some((tls_listener, acceptor))
        } else {
            None
        };

        let shared = Arc::new(ServerShared {
            router: RwLock::new(Arc::new(router)),
            stats: Arc::new(ServerStats::new()),
            keep_alive_timeout: Duration::from_secs(config.keep_alive_timeout.max(1)),
            max_request_size: config.max_request_size,
            ws_max_frame_size: config.websocket_max_frame_size,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Server {
            shared,
            listener,
            tls,
            rate_limiter,
            max_connections: config.max_connections,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn tls_addr(&self) -> Option<SocketAddr> {
        self.tls
            .as_ref()
            .and_then(|(l, _)| l.local_addr().ok())
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        self.shared.stats.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Swap the route table and middleware; in-flight requests finish on the
    /// old router.
    pub fn set_router(&self, router: Router) {
        *self.shared.router.write().unwrap() = Arc::new(router);
    }

    /// Reconfigure the rate limiter (no-op when none was configured).
    pub fn update_rate_limit(&self, config: &RateLimitConfig) {
        if let Some(limiter) = &self.rate_limiter {
            limiter.update_config(config);
        }
    }

    /// Accept until shutdown. TLS and plain listeners each run their own
    /// accept loop; per-connection tasks outlive the loops and drain.
    pub async fn run(self) -> io::Result<()> {
        if let Some(limiter) = &self.rate_limiter {
            ratelimit::spawn_cleanup(limiter.clone(), self.shutdown_rx.clone());
        }

        let mut tls_task = None;
        if let Some((tls_listener, acceptor)) = self.tls {
            let shared = self.shared.clone();
            let shutdown = self.shutdown_rx.clone();
            let max = self.max_connections;
            tracing::info!(
                "[server] https listening on {}",
                tls_listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
            );
            tls_task = Some(tokio::spawn(accept_loop_tls(
                tls_listener,
                acceptor,
                shared,
                shutdown,
                max,
            )));
        }

        tracing::info!(
            "[server] http listening on {}",
            self.listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
        );
        accept_loop_plain(
            self.listener,
            self.shared.clone(),
            self.shutdown_rx.clone(),
            self.max_connections,
        )
        .await;

        if let Some(task) = tls_task {
            let _ = task.await;
        }
        tracing::info!("[server] accept loops stopped");
        Ok(())
    }
}

/// Admit the socket unless the connection limit is reached. Returns true if
/// admitted (counters already incremented).
fn admit(shared: &Arc<ServerShared>, max_connections: u64, peer: SocketAddr) -> bool {
    let active = shared.stats.active_connections.load(Ordering::Relaxed);
    if max_connections > 0 && active >= max_connections {
        tracing::warn!("[server] refusing {}: connection limit reached", peer);
        return false;
    }
    shared.stats.total_connections.fetch_add(1, Ordering::Relaxed);
    shared.stats.active_connections.fetch_add(1, Ordering::Relaxed);
    true
}

async fn accept_loop_plain(
    listener: TcpListener,
    shared: Arc<ServerShared>,
    mut shutdown: watch::Receiver<bool>,
    max_connections: u64,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(x) => x,
                    Err(e) => {
                        tracing::debug!("[server] accept error: {}", e);
                        continue;
                    }
                };
                if !admit(&shared, max_connections, peer) {
                    continue; // dropping the socket refuses the connection
                }
                let shared = shared.clone();
                tokio::spawn(async move {
                    Connection::new(socket, peer, shared.clone()).run().await;
                    shared.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
                });
            }
        }
    }
}

async fn accept_loop_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    shared: Arc<ServerShared>,
    mut shutdown: watch::Receiver<bool>,
    max_connections: u64,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(x) => x,
                    Err(e) => {
                        tracing::debug!("[server] tls accept error: {}", e);
                        continue;
                    }
                };
                if !admit(&shared, max_connections, peer) {
                    continue;
                }
                let shared = shared.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    handshake_and_run(acceptor, socket, peer, shared.clone()).await;
                    shared.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
                });
            }
        }
    }
}

/// TLS handshake under the same inactivity timeout as reads, then the normal
/// connection loop over the encrypted stream.
async fn handshake_and_run(
    acceptor: TlsAcceptor,
    socket: TcpStream,
    peer: SocketAddr,
    shared: Arc<ServerShared>,
) {
    let handshake = net::accept_tls(&acceptor, socket);
    match tokio::time::timeout(shared.keep_alive_timeout, handshake).await {
        Ok(Ok(stream)) => {
            Connection::new(stream, peer, shared).run().await;
        }
        Ok(Err(e)) => {
            tracing::debug!("[server] tls handshake with {} failed: {}", peer, e);
        }
        Err(_) => {
            tracing::debug!("[server] tls handshake with {} timed out", peer);
        }
    }
}
