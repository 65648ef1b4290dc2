// SPDX-License-Identifier: MIT OR Apache-2.0
//! Outbound connections and connection lifecycle events.
//!
//! At most one connection per remote node id exists. Connects to the same
//! node are serialized through a per-node async lock so concurrent callers
//! share one handshake. Listener callbacks run on a dedicated event task,
//! never on the caller's thread, and each connection produces exactly one
//! connected and at most one disconnected event.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Instant,
};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
    error::{Result, TransportError},
    fault::FaultInjector,
    node::{NodeDescriptor, NodeId, Version},
    transport::{Channel, ConnectMode, Transport},
};

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

impl ConnectionState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Open => 1,
            Self::Closed => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            _ => Self::Closed,
        }
    }
}

/// An established link to a remote node.
pub struct Connection {
    node: NodeDescriptor,
    channel: Arc<dyn Channel>,
    version: Version,
    mode: ConnectMode,
    state: AtomicU8,
    opened_at: Instant,
}

impl Connection {
    fn new(node: NodeDescriptor, channel: Arc<dyn Channel>, local: Version, mode: ConnectMode) -> Self {
        let version = local.min(channel.peer_version());
        Self {
            node,
            channel,
            version,
            mode,
            state: AtomicU8::new(ConnectionState::Open.as_u8()),
            opened_at: Instant::now(),
        }
    }

    #[must_use]
    pub const fn node(&self) -> &NodeDescriptor {
        &self.node
    }

    /// Negotiated version: the lower of the two sides' versions.
    #[must_use]
    pub const fn version(&self) -> Version {
        self.version
    }

    #[must_use]
    pub const fn mode(&self) -> ConnectMode {
        self.mode
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open && self.channel.is_open()
    }

    #[must_use]
    pub const fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub(crate) fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// Moves the connection to `Closed`. Only the first call returns `true`.
    fn mark_closed(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Open.as_u8(),
                ConnectionState::Closed.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("node", &self.node.id)
            .field("version", &self.version)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Observer of node connect and disconnect events.
pub trait ConnectionListener: Send + Sync {
    fn on_node_connected(&self, _node: &NodeDescriptor) {}

    fn on_node_disconnected(&self, _node: &NodeDescriptor) {}
}

#[derive(Debug)]
enum ConnectionEvent {
    Connected(NodeDescriptor),
    Disconnected(NodeDescriptor),
}

type Listeners = Vec<Arc<dyn ConnectionListener>>;

/// Tracks outbound connections by remote node id.
pub struct ConnectionRegistry {
    connections: DashMap<NodeId, Arc<Connection>>,
    connect_locks: DashMap<NodeId, Arc<tokio::sync::Mutex<()>>>,
    listeners: ArcSwap<Listeners>,
    events_tx: mpsc::UnboundedSender<(ConnectionEvent, Arc<Listeners>)>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<(ConnectionEvent, Arc<Listeners>)>>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            connections: DashMap::new(),
            connect_locks: DashMap::new(),
            listeners: ArcSwap::from_pointee(Vec::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Spawns the task that delivers events to listeners. Only the first
    /// call has an effect.
    pub fn start(&self) {
        let Some(mut rx) = self.events_rx.lock().take() else {
            return;
        };
        tokio::spawn(async move {
            while let Some((event, listeners)) = rx.recv().await {
                for listener in listeners.iter() {
                    let outcome = catch_unwind(AssertUnwindSafe(|| match &event {
                        ConnectionEvent::Connected(node) => listener.on_node_connected(node),
                        ConnectionEvent::Disconnected(node) => listener.on_node_disconnected(node),
                    }));
                    if outcome.is_err() {
                        tracing::warn!(?event, "connection listener panicked");
                    }
                }
            }
        });
    }

    /// Registers a listener. It only sees events for transitions that
    /// happen after this call.
    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(listener.clone());
            next
        });
    }

    /// Returns `true` if `listener` was registered.
    pub fn remove_listener(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        let before = self.listeners.load().len();
        self.listeners.rcu(|current| {
            current
                .iter()
                .filter(|l| !Arc::ptr_eq(l, listener))
                .cloned()
                .collect::<Listeners>()
        });
        self.listeners.load().len() < before
    }

    /// Connects to `node` unless an open connection already exists.
    ///
    /// A registered connection whose channel has already died is retired
    /// first: it emits its disconnect event and is passed to `on_stale`
    /// before the replacement is registered.
    ///
    /// # Errors
    ///
    /// Returns `Connect` if a fault rule targets `node` or the transport
    /// fails to establish a channel.
    pub async fn connect(
        &self,
        node: &NodeDescriptor,
        mode: ConnectMode,
        transport: &dyn Transport,
        faults: &FaultInjector,
        local_version: Version,
        on_stale: impl FnOnce(&Arc<Connection>),
    ) -> Result<Arc<Connection>> {
        faults.check_connect(node)?;
        if let Some(existing) = self.open_connection(&node.id) {
            return Ok(existing);
        }

        let lock = self
            .connect_locks
            .entry(node.id.clone())
            .or_default()
            .value()
            .clone();
        let result = self
            .connect_serialized(node, mode, transport, local_version, lock, on_stale)
            .await;
        self.connect_locks
            .remove_if(&node.id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn connect_serialized(
        &self,
        node: &NodeDescriptor,
        mode: ConnectMode,
        transport: &dyn Transport,
        local_version: Version,
        lock: Arc<tokio::sync::Mutex<()>>,
        on_stale: impl FnOnce(&Arc<Connection>),
    ) -> Result<Arc<Connection>> {
        let _guard = lock.lock().await;

        if let Some(existing) = self.open_connection(&node.id) {
            return Ok(existing);
        }
        let stale = self.connections.get(&node.id).map(|c| c.value().clone());
        if let Some(stale) = stale {
            if self.finish(&stale) {
                tracing::debug!(node = %node, "retired dead connection");
                on_stale(&stale);
            }
        }

        let channel = transport.connect(node, mode).await.map_err(|e| match e {
            e @ TransportError::Connect { .. } => e,
            other => TransportError::Connect {
                node: node.id.clone(),
                reason: other.to_string(),
            },
        })?;

        let connection = Arc::new(Connection::new(node.clone(), channel, local_version, mode));
        self.connections.insert(node.id.clone(), connection.clone());
        tracing::debug!(
            node = %node,
            version = %connection.version,
            mode = ?mode,
            "node connected"
        );
        let _ = self
            .events_tx
            .send((ConnectionEvent::Connected(node.clone()), self.listeners.load_full()));
        Ok(connection)
    }

    fn open_connection(&self, node_id: &str) -> Option<Arc<Connection>> {
        self.connections
            .get(node_id)
            .map(|c| c.value().clone())
            .filter(|c| c.is_open())
    }

    /// Closes the connection to `node_id`, emitting one disconnect event.
    /// Returns the connection if this call closed it.
    pub fn close(&self, node_id: &str) -> Option<Arc<Connection>> {
        let connection = self.connections.get(node_id).map(|c| c.value().clone())?;
        self.finish(&connection)
            .then(|| {
                connection.channel.close();
                connection
            })
    }

    /// Handles a transport-reported channel close. Returns the connection
    /// the channel belonged to if this call closed it.
    pub fn on_channel_closed(&self, channel_id: u64) -> Option<Arc<Connection>> {
        let connection = self
            .connections
            .iter()
            .find(|c| c.value().channel.id() == channel_id)
            .map(|c| c.value().clone())?;
        self.finish(&connection).then_some(connection)
    }

    fn finish(&self, connection: &Arc<Connection>) -> bool {
        if !connection.mark_closed() {
            return false;
        }
        self.connections
            .remove_if(&connection.node.id, |_, current| Arc::ptr_eq(current, connection));
        tracing::debug!(node = %connection.node, "node disconnected");
        let _ = self
            .events_tx
            .send((
                ConnectionEvent::Disconnected(connection.node.clone()),
                self.listeners.load_full(),
            ));
        true
    }

    /// Closes every connection. Returns the connections closed.
    pub fn close_all(&self) -> Vec<Arc<Connection>> {
        let ids: Vec<NodeId> = self.connections.iter().map(|c| c.key().clone()).collect();
        ids.iter().filter_map(|id| self.close(id)).collect()
    }

    #[must_use]
    pub fn get(&self, node_id: &str) -> Option<Arc<Connection>> {
        self.open_connection(node_id)
    }

    #[must_use]
    pub fn is_connected(&self, node_id: &str) -> bool {
        self.open_connection(node_id).is_some()
    }

    #[must_use]
    pub fn state(&self, node_id: &str) -> Option<ConnectionState> {
        self.connections.get(node_id).map(|c| c.value().state())
    }

    /// Ids of nodes with an open connection.
    #[must_use]
    pub fn connected_nodes(&self) -> Vec<NodeId> {
        self.connections
            .iter()
            .filter(|c| c.value().is_open())
            .map(|c| c.key().clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
