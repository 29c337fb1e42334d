//! TCP accept loop, admission control, and shutdown wiring.
//!
//! The machine's console accepts at most [`MAX_CONNECTIONS`] concurrent
//! clients. A connection beyond that is answered with a single error
//! line and closed before it ever reaches the framer. Admission seats
//! are RAII guards, so a slot is released on every exit path of the
//! connection task that holds it.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use gantry_core::catalog::Catalog;
use gantry_core::clock::MachineClock;
use gantry_core::vfs::VirtualFs;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::connection;
use crate::dispatch::Dispatcher;

/// Concurrent-connection ceiling, matching the machine's two console
/// channels.
pub const MAX_CONNECTIONS: usize = 2;

/// Reply written to a connection denied admission.
const TOO_MANY_CONNECTIONS: &[u8] = b"error:too many connections\n";

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 2222,
        }
    }
}

/// Bounded registry of active connections.
///
/// The mutex is held only for O(1) map updates; everything slow happens
/// outside it.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    seats: Arc<Mutex<HashMap<SocketAddr, Instant>>>,
    capacity: usize,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            seats: Arc::new(Mutex::new(HashMap::new())),
            capacity,
        }
    }

    /// Claims a seat for `peer`, or `None` when the registry is full.
    #[must_use]
    pub fn try_claim(&self, peer: SocketAddr) -> Option<ConnectionSeat> {
        let mut seats = self.seats.lock().expect("lock poisoned");
        if seats.len() >= self.capacity {
            return None;
        }
        seats.insert(peer, Instant::now());
        Some(ConnectionSeat {
            seats: Arc::clone(&self.seats),
            peer,
        })
    }

    /// Number of currently admitted connections.
    #[must_use]
    pub fn active(&self) -> usize {
        self.seats.lock().expect("lock poisoned").len()
    }
}

/// RAII admission slot; dropping it frees the seat.
#[derive(Debug)]
pub struct ConnectionSeat {
    seats: Arc<Mutex<HashMap<SocketAddr, Instant>>>,
    peer: SocketAddr,
}

impl Drop for ConnectionSeat {
    fn drop(&mut self) {
        self.seats.lock().expect("lock poisoned").remove(&self.peer);
    }
}

/// The bound server, ready to run.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    dispatcher: Dispatcher,
    registry: ConnectionRegistry,
}

impl Server {
    /// Binds the listener and wires the shared machine state.
    ///
    /// # Errors
    ///
    /// Propagates the bind failure (address in use, permission, …); the
    /// binary turns that into a non-zero exit.
    pub async fn bind(
        config: &ServerConfig,
        catalog: Arc<Catalog>,
        vfs: Arc<VirtualFs>,
        clock: Arc<MachineClock>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        Ok(Self {
            listener,
            dispatcher: Dispatcher::new(catalog, vfs, clock),
            registry: ConnectionRegistry::new(MAX_CONNECTIONS),
        })
    }

    /// Address the listener actually bound (port 0 resolves here).
    ///
    /// # Errors
    ///
    /// Propagates the socket query failure.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until the shutdown signal flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            addr = %self.listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            "mock CNC server listening"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,

                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(%err, "accept failed");
                            continue;
                        }
                    };
                    self.admit(stream, peer, shutdown.clone());
                }
            }
        }

        info!("listener closed, waiting for connections to wind down");
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr, shutdown: watch::Receiver<bool>) {
        match self.registry.try_claim(peer) {
            Some(seat) => {
                let dispatcher = self.dispatcher.clone();
                tokio::spawn(async move {
                    connection::serve(stream, peer, dispatcher, shutdown).await;
                    drop(seat);
                });
            }
            None => {
                warn!(%peer, active = self.registry.active(), "rejecting connection, server full");
                tokio::spawn(async move {
                    let mut stream = stream;
                    let _ = stream.write_all(TOO_MANY_CONNECTIONS).await;
                    let _ = stream.shutdown().await;
                    debug!(%peer, "rejected connection closed");
                });
            }
        }
    }
}
