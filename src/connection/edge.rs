//! High-availability edge connections.
//!
//! [`EdgeSupervisor`] keeps `ha_connections` slots connected to the edge. Slot
//! 0 is dialed first and the remaining slots start once it is serving, so a
//! misconfigured edge fails fast instead of N times in parallel. Each slot
//! retries on its own [`BackoffHandler`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnIndex, Event, EventKind, EventSink};
use crate::constants::backoff::BASE_DELAY;
use crate::constants::tunnel::DIAL_TIMEOUT;
use crate::errors;
use crate::retry::BackoffHandler;

/// Handle a connector uses to report progress of one connection attempt.
pub struct ConnectionObserver {
    index: ConnIndex,
    sink: Arc<dyn EventSink>,
    connected: AtomicBool,
    wake: Notify,
}

impl ConnectionObserver {
    pub fn new(index: ConnIndex, sink: Arc<dyn EventSink>) -> Self {
        Self {
            index,
            sink,
            connected: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn index(&self) -> ConnIndex {
        self.index
    }

    /// Marks the connection as serving traffic.
    pub fn connected(&self) {
        tracing::info!(conn_index = %self.index, "Connection registered with edge");
        self.emit(EventKind::Connected);
        self.connected.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn set_url(&self, url: impl Into<String>) {
        self.emit(EventKind::SetUrl(url.into()));
    }

    /// Returns whether `connected` was reported since the last call.
    fn take_connected(&self) -> bool {
        self.connected.swap(false, Ordering::SeqCst)
    }

    fn emit(&self, kind: EventKind) {
        self.sink.on_tunnel_event(Event::new(self.index, kind));
    }
}

/// Transport for a single edge connection.
#[async_trait]
pub trait EdgeConnector: Send + Sync + 'static {
    /// Opens one connection and serves it until it ends or `cancel` fires.
    ///
    /// Implementations call [`ConnectionObserver::connected`] once the
    /// connection serves traffic.
    async fn serve(
        &self,
        observer: &ConnectionObserver,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;
}

pub struct EdgeSupervisor {
    connector: Arc<dyn EdgeConnector>,
    sink: Arc<dyn EventSink>,
    ha_connections: u8,
    retries: u32,
    base_delay: Duration,
}

impl EdgeSupervisor {
    pub fn new(
        connector: Arc<dyn EdgeConnector>,
        sink: Arc<dyn EventSink>,
        ha_connections: u8,
        retries: u32,
    ) -> Self {
        Self {
            connector,
            sink,
            ha_connections: ha_connections.max(1),
            retries,
            base_delay: BASE_DELAY,
        }
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Runs every slot until `cancel` fires.
    ///
    /// Fails when the first connection cannot be established within its
    /// retry budget, or when a slot stops with an error.
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut slots = JoinSet::new();
        let first_connected = Arc::new(Notify::new());

        slots.spawn(
            self.slot(ConnIndex::new(0))
                .run(Some(first_connected.clone()), cancel.clone()),
        );

        tokio::select! {
            _ = first_connected.notified() => {}
            Some(joined) = slots.join_next() => {
                return flatten(joined).context(errors::edge::FIRST_CONNECTION_FAILED);
            }
        }

        for index in 1..self.ha_connections {
            slots.spawn(self.slot(ConnIndex::new(index)).run(None, cancel.clone()));
        }

        let mut failure = None;
        while let Some(joined) = slots.join_next().await {
            if let Err(e) = flatten(joined) {
                tracing::error!("Edge connection stopped: {:#}", e);
                failure.get_or_insert(e);
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn slot(&self, index: ConnIndex) -> Slot {
        Slot {
            index,
            connector: self.connector.clone(),
            sink: self.sink.clone(),
            retries: self.retries,
            base_delay: self.base_delay,
        }
    }
}

struct Slot {
    index: ConnIndex,
    connector: Arc<dyn EdgeConnector>,
    sink: Arc<dyn EventSink>,
    retries: u32,
    base_delay: Duration,
}

impl Slot {
    async fn run(
        self,
        mut first_connected: Option<Arc<Notify>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let observer = ConnectionObserver::new(self.index, self.sink.clone());
        // Until slot 0 has connected once, its retries are bounded. Zero
        // retries would turn every reset into a permanent failure.
        let mut backoff = BackoffHandler::new(self.retries.max(1), first_connected.is_none())
            .with_base_delay(self.base_delay);

        loop {
            observer.emit(EventKind::RegisteringTunnel);

            let served = self.connector.serve(&observer, cancel.clone());
            tokio::pin!(served);
            let result = loop {
                tokio::select! {
                    biased;
                    _ = observer.wake.notified() => {
                        if observer.take_connected() {
                            mark_connected(&mut backoff, &mut first_connected);
                        }
                    }
                    result = &mut served => break result,
                }
            };
            // The connector may report connected and return in the same poll.
            if observer.take_connected() {
                mark_connected(&mut backoff, &mut first_connected);
            }

            if cancel.is_cancelled() {
                observer.emit(EventKind::Unregistering);
                observer.emit(EventKind::Disconnected);
                tracing::info!(conn_index = %self.index, "Edge connection unregistered");
                return Ok(());
            }

            observer.emit(EventKind::Disconnected);
            observer.emit(EventKind::Reconnecting);

            match result {
                Ok(()) => {
                    tracing::info!(
                        conn_index = %self.index,
                        "Edge connection closed, reconnecting"
                    );
                }
                Err(e) => {
                    let delay = backoff.get_max_backoff_duration(&cancel);
                    tracing::warn!(
                        conn_index = %self.index,
                        retry_in = ?delay,
                        "Edge connection failed: {:#}",
                        e
                    );
                    if !backoff.backoff(&cancel).await {
                        observer.emit(EventKind::Disconnected);
                        if cancel.is_cancelled() {
                            return Ok(());
                        }
                        return Err(e.context(errors::edge::retries_exhausted(
                            self.index.get(),
                            backoff.retries(),
                        )));
                    }
                }
            }
        }
    }
}

fn mark_connected(backoff: &mut BackoffHandler, first_connected: &mut Option<Arc<Notify>>) {
    backoff.set_grace_period();
    backoff.retry_forever = true;
    if let Some(first) = first_connected.take() {
        first.notify_one();
    }
}

fn flatten(joined: Result<anyhow::Result<()>, JoinError>) -> anyhow::Result<()> {
    match joined {
        Ok(result) => result,
        Err(join_error) => Err(anyhow::anyhow!(errors::edge::slot_panicked(
            &join_error.to_string()
        ))),
    }
}

/// Connector dialing the edge over plain TCP and piping the edge stream to
/// the origin once the edge starts sending.
#[derive(Debug, Clone)]
pub struct TcpEdgeConnector {
    edge: String,
    origin: String,
}

impl TcpEdgeConnector {
    pub fn new(edge: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            edge: edge.into(),
            origin: origin.into(),
        }
    }
}

#[async_trait]
impl EdgeConnector for TcpEdgeConnector {
    async fn serve(
        &self,
        observer: &ConnectionObserver,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut edge = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            dialed = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&self.edge)) => dialed
                .map_err(|_| anyhow::anyhow!(errors::edge::dial_timeout(&self.edge)))?
                .with_context(|| errors::edge::dial_failed(&self.edge))?,
        };

        observer.connected();
        if let Ok(peer) = edge.peer_addr() {
            observer.set_url(peer.to_string());
        }

        let mut probe = [0u8; 1];
        let pending = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            peeked = edge.peek(&mut probe) => peeked.context(errors::edge::READ_FAILED)?,
        };
        anyhow::ensure!(pending > 0, errors::edge::closed_by_edge(&self.edge));

        let mut origin = TcpStream::connect(&self.origin)
            .await
            .with_context(|| errors::edge::origin_unreachable(&self.origin))?;

        tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            copied = tokio::io::copy_bidirectional(&mut edge, &mut origin) => {
                let (to_origin, to_edge) = copied.context(errors::edge::PROXY_FAILED)?;
                tracing::debug!(
                    conn_index = %observer.index(),
                    to_origin,
                    to_edge,
                    "Edge stream finished"
                );
                Ok(())
            }
        }
    }
}
