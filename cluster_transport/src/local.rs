// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-process transport.
//!
//! Every started [`LocalTransport`] registers under a generated address in
//! a process-wide table. A connection is a pair of linked channel halves;
//! each half owns an unbounded queue drained by one pump task, which keeps
//! frames in send order. Closing either half closes both and notifies each
//! owning endpoint once.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, LazyLock, OnceLock, Weak,
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::{
    error::{Result, TransportError},
    node::{NodeDescriptor, TransportAddress, Version},
    transport::{next_channel_id, Channel, ConnectMode, InboundSink, LocalIdentity, Transport},
};

static ENDPOINTS: LazyLock<DashMap<String, Weak<Endpoint>>> = LazyLock::new(DashMap::new);

static NEXT_ADDRESS: AtomicU64 = AtomicU64::new(1);

struct Endpoint {
    address: String,
    identity: LocalIdentity,
    sink: Weak<dyn InboundSink>,
    /// Channel halves owned by this endpoint.
    channels: DashMap<u64, Arc<LocalChannel>>,
}

impl Endpoint {
    fn transport_address(&self) -> TransportAddress {
        TransportAddress::Local(self.address.clone())
    }
}

/// One half of an in-process connection.
struct LocalChannel {
    id: u64,
    owner: Weak<Endpoint>,
    remote_address: TransportAddress,
    peer_version: Version,
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    peer: OnceLock<Weak<LocalChannel>>,
    closed: AtomicBool,
}

impl LocalChannel {
    fn new(
        owner: &Arc<Endpoint>,
        remote_address: TransportAddress,
        peer_version: Version,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            id: next_channel_id(),
            owner: Arc::downgrade(owner),
            remote_address,
            peer_version,
            tx: Mutex::new(Some(tx)),
            peer: OnceLock::new(),
            closed: AtomicBool::new(false),
        });
        (channel, rx)
    }

    fn peer(&self) -> Option<Arc<LocalChannel>> {
        self.peer.get().and_then(Weak::upgrade)
    }

    fn shutdown(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the sender lets the pump drain and exit.
        self.tx.lock().take();

        if let Some(owner) = self.owner.upgrade() {
            owner.channels.remove(&self.id);
            if let Some(sink) = owner.sink.upgrade() {
                let channel: Arc<dyn Channel> = self.clone();
                sink.on_channel_closed(&channel);
            }
        }

        if let Some(peer) = self.peer() {
            peer.shutdown();
        }
    }
}

impl Channel for LocalChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn send(&self, frame: Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| TransportError::ChannelClosed),
            None => Err(TransportError::ChannelClosed),
        }
    }

    fn close(&self) {
        if let Some(owner) = self.owner.upgrade() {
            if let Some(me) = owner.channels.get(&self.id).map(|c| c.value().clone()) {
                me.shutdown();
                return;
            }
        }
        // Owner gone or half already detached: close the peer side directly.
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.tx.lock().take();
            if let Some(peer) = self.peer() {
                peer.shutdown();
            }
        }
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn remote_address(&self) -> TransportAddress {
        self.remote_address.clone()
    }

    fn peer_version(&self) -> Version {
        self.peer_version
    }
}

/// Delivers frames sent on one half to the endpoint owning the other half.
async fn pump(mut rx: mpsc::UnboundedReceiver<Bytes>, receiver: Weak<LocalChannel>) {
    while let Some(frame) = rx.recv().await {
        let Some(receiver) = receiver.upgrade() else {
            break;
        };
        if !receiver.is_open() {
            continue;
        }
        let Some(sink) = receiver.owner.upgrade().and_then(|e| e.sink.upgrade()) else {
            continue;
        };
        let channel: Arc<dyn Channel> = receiver;
        sink.on_frame(&channel, frame);
    }
}

/// Transport connecting services that live in the same process.
#[derive(Default)]
pub struct LocalTransport {
    endpoint: RwLock<Option<Arc<Endpoint>>>,
}

impl LocalTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open channel halves owned by this transport.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.endpoint
            .read()
            .as_ref()
            .map_or(0, |e| e.channels.len())
    }

    fn local(&self) -> Result<Arc<Endpoint>> {
        self.endpoint.read().clone().ok_or(TransportError::Stopped)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn start(
        &self,
        identity: LocalIdentity,
        sink: Weak<dyn InboundSink>,
    ) -> Result<TransportAddress> {
        let mut slot = self.endpoint.write();
        if let Some(endpoint) = slot.as_ref() {
            return Ok(endpoint.transport_address());
        }

        let address = NEXT_ADDRESS.fetch_add(1, Ordering::Relaxed).to_string();
        let endpoint = Arc::new(Endpoint {
            address: address.clone(),
            identity,
            sink,
            channels: DashMap::new(),
        });
        ENDPOINTS.insert(address, Arc::downgrade(&endpoint));
        tracing::debug!(
            node = %endpoint.identity.node_id,
            address = %endpoint.address,
            "local transport started"
        );
        let bound = endpoint.transport_address();
        *slot = Some(endpoint);
        Ok(bound)
    }

    async fn connect(&self, node: &NodeDescriptor, mode: ConnectMode) -> Result<Arc<dyn Channel>> {
        let local = self.local()?;
        let TransportAddress::Local(address) = &node.address else {
            return Err(TransportError::Connect {
                node: node.id.clone(),
                reason: format!("local transport cannot reach {}", node.address),
            });
        };

        let remote = ENDPOINTS
            .get(address)
            .and_then(|entry| entry.value().upgrade())
            .ok_or_else(|| TransportError::Connect {
                node: node.id.clone(),
                reason: format!("no local transport bound at {}", node.address),
            })?;

        let peer_version = match mode {
            ConnectMode::Full => {
                if remote.identity.node_id != node.id {
                    return Err(TransportError::Connect {
                        node: node.id.clone(),
                        reason: format!(
                            "peer ID mismatch: expected {}, got {}",
                            node.id, remote.identity.node_id
                        ),
                    });
                }
                remote.identity.version
            },
            ConnectMode::Light => node.version,
        };

        let (outbound, outbound_rx) =
            LocalChannel::new(&local, remote.transport_address(), peer_version);
        let (inbound, inbound_rx) =
            LocalChannel::new(&remote, local.transport_address(), local.identity.version);
        let _ = outbound.peer.set(Arc::downgrade(&inbound));
        let _ = inbound.peer.set(Arc::downgrade(&outbound));

        local.channels.insert(outbound.id, outbound.clone());
        remote.channels.insert(inbound.id, inbound.clone());

        tokio::spawn(pump(outbound_rx, Arc::downgrade(&inbound)));
        tokio::spawn(pump(inbound_rx, Arc::downgrade(&outbound)));

        tracing::debug!(
            local = %local.identity.node_id,
            remote = %node.id,
            channel = outbound.id,
            "local channel opened"
        );
        Ok(outbound)
    }

    async fn stop(&self) {
        let Some(endpoint) = self.endpoint.write().take() else {
            return;
        };
        ENDPOINTS.remove(&endpoint.address);

        let channels: Vec<_> = endpoint
            .channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for channel in channels {
            channel.shutdown();
        }
        tracing::debug!(node = %endpoint.identity.node_id, "local transport stopped");
    }

    fn bound_address(&self) -> Option<TransportAddress> {
        self.endpoint.read().as_ref().map(|e| e.transport_address())
    }
}
