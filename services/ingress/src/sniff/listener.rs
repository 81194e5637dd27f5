//! Sniffing listener.
//!
//! Wraps a raw listener. Every accepted connection gets its own sniff task;
//! credentialed connections go to the [`Forwarder`], everything else is
//! rewound and queued for [`SniffingListener::accept`], so the caller sees
//! those connections exactly as if nothing had read from them.
//!
//! ```text
//! raw accept -> sniff task -> Matched    -> Forwarder -> shutdown
//!                          -> Fallback   -> unread -> delivery queue -> accept()
//!                          -> Disconnected (dropped)
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use portshare_credential::{Header, Validator};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, Instrument};

use super::conn::{Connection, RawListener};
use super::forward::Forwarder;
use super::rewind::Rewind;
use super::sniffer::{HeaderSniffer, Sniffed};
use crate::config::ListenerConfig;
use crate::error::ListenerError;

/// Statistics for a sniffing listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Raw connections accepted.
    pub connections_accepted: AtomicU64,
    /// Raw accept failures.
    pub accept_errors: AtomicU64,
    /// Connections handed to the forwarder.
    pub forwarded: AtomicU64,
    /// Connections rewound and queued for `accept`.
    pub delivered: AtomicU64,
    /// Peers that hung up mid-header.
    pub disconnected: AtomicU64,
    /// Rewound connections closed because the listener had closed.
    pub closed_on_shutdown: AtomicU64,
    /// Forwarded sessions that ended with an error.
    pub forward_errors: AtomicU64,
    /// Payload bytes read from credentialed clients.
    pub bytes_read: AtomicU64,
    /// Payload bytes written to credentialed clients.
    pub bytes_written: AtomicU64,
}

impl ListenerStats {
    /// Connections that have reached a terminal fate.
    pub fn settled(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
            + self.delivered.load(Ordering::Relaxed)
            + self.disconnected.load(Ordering::Relaxed)
            + self.closed_on_shutdown.load(Ordering::Relaxed)
    }
}

/// State shared between the listener handle and its tasks.
#[derive(Debug)]
struct Shared {
    /// One-shot closed signal; only ever moves from false to true.
    closed: watch::Sender<bool>,
    stats: ListenerStats,
}

impl Shared {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Flip the closed signal. Returns true for the call that flipped it.
    fn close(&self) -> bool {
        self.closed.send_if_modified(|closed| {
            if *closed {
                return false;
            }
            *closed = true;
            true
        })
    }

    /// Resolves once the listener is closed.
    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// A listener that separates credentialed connections from ordinary ones.
pub struct SniffingListener<C> {
    local_addr: Option<SocketAddr>,
    /// Delivery queue. The mutex only serializes concurrent `accept` callers;
    /// sniff tasks enqueue through their own senders without touching it.
    queue: Mutex<mpsc::Receiver<Rewind<C>>>,
    shared: Arc<Shared>,
}

impl<C: Connection> SniffingListener<C> {
    /// Wrap `raw` and start its dispatch loop on the current runtime.
    pub fn wrap<L>(
        raw: L,
        validator: Arc<dyn Validator>,
        forwarder: Arc<dyn Forwarder>,
        config: ListenerConfig,
    ) -> Self
    where
        L: RawListener<Conn = C>,
    {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            closed,
            stats: ListenerStats::default(),
        });
        let local_addr = raw.local_addr().ok();

        let dispatch = Dispatch {
            raw,
            accept_error_backoff: config.accept_error_backoff,
            handler: Arc::new(Handler {
                sniffer: HeaderSniffer::with_config(validator, config.sniff),
                forwarder,
                queue: queue_tx,
                shared: Arc::clone(&shared),
                verbose: config.verbose,
            }),
        };

        let span = match local_addr {
            Some(addr) => tracing::info_span!("sniffing_listener", local_addr = %addr),
            None => tracing::info_span!("sniffing_listener"),
        };
        tokio::spawn(dispatch.run().instrument(span));

        Self {
            local_addr,
            queue: Mutex::new(queue_rx),
            shared,
        }
    }

    /// Wait for the next connection that did not carry a valid header.
    ///
    /// Fails with [`ListenerError::Closed`] once the listener is closed,
    /// even if connections are still queued.
    pub async fn accept(&self) -> Result<Rewind<C>, ListenerError> {
        if self.shared.is_closed() {
            self.try_drain();
            return Err(ListenerError::Closed);
        }

        let mut queue = tokio::select! {
            biased;
            _ = self.shared.closed() => {
                self.try_drain();
                return Err(ListenerError::Closed);
            }
            queue = self.queue.lock() => queue,
        };

        tokio::select! {
            biased;
            _ = self.shared.closed() => {
                drain(&mut queue);
                Err(ListenerError::Closed)
            }
            conn = queue.recv() => conn.ok_or(ListenerError::Closed),
        }
    }
}

impl<C> SniffingListener<C> {
    /// Close the listener. Idempotent; always succeeds.
    ///
    /// Stops the dispatch loop, which drops the raw listener, and closes any
    /// connections still waiting in the delivery queue.
    pub fn close(&self) -> Result<(), ListenerError> {
        if self.shared.close() {
            debug!("Sniffing listener closed");
        }
        self.try_drain();
        Ok(())
    }

    /// Drop queued connections unless an `accept` holds the queue; that
    /// caller drains it when it sees the close.
    fn try_drain(&self) {
        if let Ok(mut queue) = self.queue.try_lock() {
            drain(&mut queue);
        }
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Address of the wrapped raw listener, if it reported one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.shared.stats
    }
}

/// Close the queue and drop everything still in it.
fn drain<C>(queue: &mut mpsc::Receiver<Rewind<C>>) {
    queue.close();
    while queue.try_recv().is_ok() {}
}

impl SniffingListener<TcpStream> {
    /// Bind a TCP socket and wrap it.
    pub async fn bind(
        addr: SocketAddr,
        validator: Arc<dyn Validator>,
        forwarder: Arc<dyn Forwarder>,
        config: ListenerConfig,
    ) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            queue_capacity = config.queue_capacity,
            "Listener bound"
        );

        Ok(Self::wrap(listener, validator, forwarder, config))
    }
}

impl<C> Drop for SniffingListener<C> {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Raw accept loop.
struct Dispatch<L: RawListener> {
    raw: L,
    accept_error_backoff: Duration,
    handler: Arc<Handler<L::Conn>>,
}

impl<L: RawListener> Dispatch<L> {
    async fn run(self) {
        let shared = Arc::clone(&self.handler.shared);
        info!("Sniffing listener started");

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shared.closed() => break,
                accepted = self.raw.accept() => accepted,
            };

            match accepted {
                Ok(conn) => {
                    shared
                        .stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);

                    let span = match conn.peer_addr() {
                        Ok(peer) => tracing::info_span!("connection", peer = %peer),
                        Err(_) => tracing::info_span!("connection"),
                    };
                    let handler = Arc::clone(&self.handler);
                    tokio::spawn(async move { handler.handle(conn).await }.instrument(span));
                }
                Err(e) => {
                    if shared.is_closed() {
                        break;
                    }
                    shared.stats.accept_errors.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "Accept error");

                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::select! {
                        biased;
                        _ = shared.closed() => break,
                        _ = tokio::time::sleep(self.accept_error_backoff) => {}
                    }
                }
            }
        }

        info!("Sniffing listener stopped");
    }
}

/// Per-connection handling shared by all sniff tasks of one listener.
struct Handler<C> {
    sniffer: HeaderSniffer,
    forwarder: Arc<dyn Forwarder>,
    queue: mpsc::Sender<Rewind<C>>,
    shared: Arc<Shared>,
    verbose: bool,
}

impl<C: Connection> Handler<C> {
    async fn handle(&self, conn: C) {
        match self.sniffer.sniff(conn).await {
            Sniffed::Matched { conn, header } => self.forward(conn, header).await,
            Sniffed::Fallback { conn, reason } => {
                debug!(reason = %reason, "Not a credentialed connection, rewinding");
                self.deliver(conn).await;
            }
            Sniffed::Disconnected { consumed } => {
                self.shared
                    .stats
                    .disconnected
                    .fetch_add(1, Ordering::Relaxed);
                debug!(consumed = consumed, "Peer closed before sending a header");
            }
        }
    }

    /// Queue a rewound connection for `accept`, or close it if the listener
    /// closes first.
    async fn deliver(&self, mut conn: Rewind<C>) {
        let permit = tokio::select! {
            biased;
            _ = self.shared.closed() => None,
            permit = self.queue.reserve() => permit.ok(),
        };

        match permit {
            Some(permit) => {
                self.shared.stats.delivered.fetch_add(1, Ordering::Relaxed);
                permit.send(conn);
            }
            None => {
                self.shared
                    .stats
                    .closed_on_shutdown
                    .fetch_add(1, Ordering::Relaxed);
                debug!("Listener closed, dropping rewound connection");
                let _ = conn.shutdown().await;
            }
        }
    }

    async fn forward(&self, conn: Rewind<C>, header: Header) {
        if self.verbose {
            info!("Handling credentialed connection");
        }

        let (mut reader, mut writer) = tokio::io::split(conn);
        let result = self.forwarder.handle(&mut reader, &mut writer).await;

        let mut conn = reader.unsplit(writer);
        if let Err(e) = conn.shutdown().await {
            debug!(error = %e, "Shutdown after forwarding failed");
        }

        let stats = &self.shared.stats;
        match result {
            Ok((bytes_read, bytes_written)) => {
                stats.bytes_read.fetch_add(bytes_read, Ordering::Relaxed);
                stats
                    .bytes_written
                    .fetch_add(bytes_written, Ordering::Relaxed);
                self.sniffer
                    .validator()
                    .consume(&header, bytes_read, bytes_written);

                debug!(
                    bytes_read = bytes_read,
                    bytes_written = bytes_written,
                    "Credentialed connection closed"
                );
            }
            Err(e) => {
                stats.forward_errors.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "Forwarding error");
            }
        }
        // Last, so a settled count implies traffic is already accounted.
        stats.forwarded.fetch_add(1, Ordering::Relaxed);
    }
}
