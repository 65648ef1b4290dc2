// SPDX-License-Identifier: MIT OR Apache-2.0
//! Byte transport abstraction.
//!
//! A [`Transport`] moves opaque frames between nodes. The service above it
//! owns encoding, correlation and timeouts; an engine only establishes
//! channels, preserves per-channel send order, and reports inbound frames
//! and channel closure to its [`InboundSink`].

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    error::Result,
    node::{NodeDescriptor, NodeId, TransportAddress, Version},
};

/// How much verification a connect performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectMode {
    /// Handshake and verify the remote node id.
    #[default]
    Full,
    /// Skip remote id verification.
    Light,
}

/// Identity a transport presents during handshakes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub node_id: NodeId,
    pub version: Version,
}

/// An established bidirectional channel.
pub trait Channel: Send + Sync {
    /// Unique id of this channel within the process.
    fn id(&self) -> u64;

    /// Enqueues a frame. Never blocks; frames on one channel are delivered
    /// in the order they were enqueued.
    ///
    /// # Errors
    ///
    /// Returns `ChannelClosed` once the channel is closed.
    fn send(&self, frame: Bytes) -> Result<()>;

    /// Closes the channel. Idempotent.
    fn close(&self);

    fn is_open(&self) -> bool;

    fn remote_address(&self) -> TransportAddress;

    /// Protocol version the remote side announced.
    fn peer_version(&self) -> Version;
}

/// Receiver of everything a transport observes.
pub trait InboundSink: Send + Sync {
    /// A frame arrived on `channel`. Responses to requests go back over the
    /// same channel.
    fn on_frame(&self, channel: &Arc<dyn Channel>, frame: Bytes);

    /// `channel` closed, locally or remotely. Called once per channel.
    fn on_channel_closed(&self, channel: &Arc<dyn Channel>);
}

/// Byte-level I/O engine.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Starts accepting inbound channels and returns the bound address.
    ///
    /// The sink is held weakly; frames arriving after it is dropped are
    /// discarded.
    async fn start(&self, identity: LocalIdentity, sink: Weak<dyn InboundSink>)
        -> Result<TransportAddress>;

    /// Opens a channel to `node`.
    async fn connect(&self, node: &NodeDescriptor, mode: ConnectMode) -> Result<Arc<dyn Channel>>;

    /// Closes every channel and stops accepting.
    async fn stop(&self);

    fn bound_address(&self) -> Option<TransportAddress>;
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique channel id.
pub fn next_channel_id() -> u64 {
    NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)
}
