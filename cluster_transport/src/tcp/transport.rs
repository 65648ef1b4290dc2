//! TCP transport implementation.
//!
//! Implements the [`Transport`] trait over tokio TCP streams. Each channel
//! owns a reader task feeding the inbound sink and a writer task draining an
//! unbounded queue, so sends never block and keep their order.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::{broadcast, mpsc},
    task::{AbortHandle, JoinHandle},
    time::timeout,
};

use super::{
    config::TcpTransportConfig,
    framing::{Handshake, LengthDelimitedCodec},
};
use crate::{
    error::{Result, TransportError},
    node::{NodeDescriptor, TransportAddress, Version},
    transport::{next_channel_id, Channel, ConnectMode, InboundSink, LocalIdentity, Transport},
};

/// State that exists while the transport is started.
struct Running {
    identity: LocalIdentity,
    sink: Weak<dyn InboundSink>,
    bound: SocketAddr,
    channels: DashMap<u64, Arc<TcpChannel>>,
    shutdown_tx: broadcast::Sender<()>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    stopping: AtomicBool,
}

/// One TCP connection, inbound or outbound.
struct TcpChannel {
    id: u64,
    owner: Weak<Running>,
    remote_address: SocketAddr,
    peer_version: Version,
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    reader: Mutex<Option<AbortHandle>>,
    closed: AtomicBool,
}

impl TcpChannel {
    fn shutdown(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // The writer drains what is queued, then drops the write half.
        self.tx.lock().take();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }

        if let Some(owner) = self.owner.upgrade() {
            owner.channels.remove(&self.id);
            if let Some(sink) = owner.sink.upgrade() {
                let channel: Arc<dyn Channel> = self.clone();
                sink.on_channel_closed(&channel);
            }
        }
        tracing::debug!(channel = self.id, remote = %self.remote_address, "tcp channel closed");
    }
}

impl Channel for TcpChannel {
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
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.tx.lock().take();
            if let Some(reader) = self.reader.lock().take() {
                reader.abort();
            }
        }
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn remote_address(&self) -> TransportAddress {
        TransportAddress::Inet(self.remote_address)
    }

    fn peer_version(&self) -> Version {
        self.peer_version
    }
}

/// TCP-based transport implementation.
pub struct TcpTransport {
    config: TcpTransportConfig,
    codec: LengthDelimitedCodec,
    running: RwLock<Option<Arc<Running>>>,
}

impl TcpTransport {
    /// Create a new TCP transport.
    ///
    /// This does not start listening; the service calls `start()`.
    #[must_use]
    pub fn new(config: TcpTransportConfig) -> Self {
        Self {
            codec: LengthDelimitedCodec::new(config.max_message_size),
            config,
            running: RwLock::new(None),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &TcpTransportConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.read().is_some()
    }

    /// Number of open channels, inbound and outbound.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.running.read().as_ref().map_or(0, |r| r.channels.len())
    }

    fn current(&self) -> Result<Arc<Running>> {
        self.running.read().clone().ok_or(TransportError::Stopped)
    }

    fn configure_socket(stream: &TcpStream, config: &TcpTransportConfig) -> Result<()> {
        stream.set_nodelay(true)?;

        if config.keepalive {
            let socket = socket2::SockRef::from(stream);
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(config.keepalive_interval_secs));
            socket.set_tcp_keepalive(&keepalive)?;
        }

        Ok(())
    }

    fn spawn_accept_loop(
        &self,
        listener: TcpListener,
        running: Weak<Running>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let config = self.config.clone();
        let codec = self.codec;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                let Some(running) = running.upgrade() else {
                                    break;
                                };
                                let config = config.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = Self::handle_incoming_connection(
                                        stream, addr, running, &config, codec,
                                    ).await {
                                        tracing::warn!("Failed to handle incoming connection from {}: {}", addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                }
            }
        })
    }

    async fn handle_incoming_connection(
        mut stream: TcpStream,
        addr: SocketAddr,
        running: Arc<Running>,
        config: &TcpTransportConfig,
        codec: LengthDelimitedCodec,
    ) -> Result<()> {
        Self::configure_socket(&stream, config)?;

        let peer = timeout(
            config.connect_timeout(),
            Handshake::read_from(&mut stream, config.max_handshake_size),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            operation: "handshake",
            timeout_ms: config.connect_timeout_ms,
        })??;

        Handshake::new(&running.identity.node_id, running.identity.version)
            .write_to_with_timeout(&mut stream, config.io_timeout())
            .await?;

        tracing::debug!(peer = %peer.node_id, %addr, "accepted tcp connection");
        Self::spawn_channel(&running, stream, addr, peer.message_version(), codec, config.io_timeout());
        Ok(())
    }

    async fn connect_to_peer(
        &self,
        running: &Arc<Running>,
        node: &NodeDescriptor,
        address: SocketAddr,
        mode: ConnectMode,
    ) -> Result<Arc<TcpChannel>> {
        let mut stream = timeout(self.config.connect_timeout(), TcpStream::connect(address))
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "connect",
                timeout_ms: self.config.connect_timeout_ms,
            })??;

        Self::configure_socket(&stream, &self.config)?;

        Handshake::new(&running.identity.node_id, running.identity.version)
            .write_to_with_timeout(&mut stream, self.config.io_timeout())
            .await?;

        let peer = timeout(
            self.config.connect_timeout(),
            Handshake::read_from(&mut stream, self.config.max_handshake_size),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            operation: "handshake",
            timeout_ms: self.config.connect_timeout_ms,
        })??;

        let peer_version = match mode {
            ConnectMode::Full => {
                if peer.node_id != node.id {
                    return Err(TransportError::Handshake(format!(
                        "peer ID mismatch: expected {}, got {}",
                        node.id, peer.node_id
                    )));
                }
                peer.message_version()
            },
            ConnectMode::Light => node.version,
        };

        Ok(Self::spawn_channel(
            running,
            stream,
            address,
            peer_version,
            self.codec,
            self.config.io_timeout(),
        ))
    }

    fn spawn_channel(
        running: &Arc<Running>,
        stream: TcpStream,
        remote_address: SocketAddr,
        peer_version: Version,
        codec: LengthDelimitedCodec,
        io_timeout: Duration,
    ) -> Arc<TcpChannel> {
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(TcpChannel {
            id: next_channel_id(),
            owner: Arc::downgrade(running),
            remote_address,
            peer_version,
            tx: Mutex::new(Some(tx)),
            reader: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        running.channels.insert(channel.id, channel.clone());

        let reader_task = tokio::spawn(Self::reader_loop(reader, codec, Arc::downgrade(&channel)));
        *channel.reader.lock() = Some(reader_task.abort_handle());
        tokio::spawn(Self::writer_loop(
            writer,
            rx,
            codec,
            io_timeout,
            Arc::downgrade(&channel),
        ));

        if running.stopping.load(Ordering::SeqCst) {
            channel.shutdown();
        }
        channel
    }

    async fn reader_loop(mut reader: OwnedReadHalf, codec: LengthDelimitedCodec, channel: Weak<TcpChannel>) {
        loop {
            match codec.read_frame(&mut reader).await {
                Ok(Some(frame)) => {
                    let Some(channel) = channel.upgrade() else {
                        break;
                    };
                    let Some(sink) = channel.owner.upgrade().and_then(|r| r.sink.upgrade()) else {
                        break;
                    };
                    let channel: Arc<dyn Channel> = channel;
                    sink.on_frame(&channel, frame);
                },
                Ok(None) => {
                    // Connection closed gracefully
                    break;
                },
                Err(e) => {
                    tracing::debug!("Read error: {}", e);
                    break;
                },
            }
        }
        if let Some(channel) = channel.upgrade() {
            channel.shutdown();
        }
    }

    async fn writer_loop(
        mut writer: OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<Bytes>,
        codec: LengthDelimitedCodec,
        io_timeout: Duration,
        channel: Weak<TcpChannel>,
    ) {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = codec
                .write_frame_with_timeout(&mut writer, &frame, io_timeout)
                .await
            {
                tracing::debug!("Write error: {}", e);
                if let Some(channel) = channel.upgrade() {
                    channel.shutdown();
                }
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn start(
        &self,
        identity: LocalIdentity,
        sink: Weak<dyn InboundSink>,
    ) -> Result<TransportAddress> {
        if let Some(running) = self.running.read().as_ref() {
            return Ok(TransportAddress::Inet(running.bound));
        }

        let listener = TcpListener::bind(self.config.bind_address).await?;
        let bound = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let running = Arc::new(Running {
            identity,
            sink,
            bound,
            channels: DashMap::new(),
            shutdown_tx,
            accept_task: Mutex::new(None),
            stopping: AtomicBool::new(false),
        });
        let accept = self.spawn_accept_loop(listener, Arc::downgrade(&running), shutdown_rx);
        *running.accept_task.lock() = Some(accept);

        tracing::debug!(node = %running.identity.node_id, %bound, "tcp transport started");
        *self.running.write() = Some(running);
        Ok(TransportAddress::Inet(bound))
    }

    async fn connect(&self, node: &NodeDescriptor, mode: ConnectMode) -> Result<Arc<dyn Channel>> {
        let running = self.current()?;
        let TransportAddress::Inet(address) = node.address else {
            return Err(TransportError::Connect {
                node: node.id.clone(),
                reason: format!("tcp transport cannot reach {}", node.address),
            });
        };
        let channel = self.connect_to_peer(&running, node, address, mode).await?;
        tracing::debug!(
            local = %running.identity.node_id,
            remote = %node.id,
            channel = channel.id,
            "tcp channel opened"
        );
        Ok(channel)
    }

    async fn stop(&self) {
        let Some(running) = self.running.write().take() else {
            return;
        };
        running.stopping.store(true, Ordering::SeqCst);

        // Send shutdown signal
        let _ = running.shutdown_tx.send(());
        let accept = running.accept_task.lock().take();
        if let Some(task) = accept {
            let _ = timeout(Duration::from_secs(5), task).await;
        }

        let channels: Vec<_> = running
            .channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for channel in channels {
            channel.shutdown();
        }
        tracing::debug!(node = %running.identity.node_id, "tcp transport stopped");
    }

    fn bound_address(&self) -> Option<TransportAddress> {
        self.running
            .read()
            .as_ref()
            .map(|r| TransportAddress::Inet(r.bound))
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.stopping.store(true, Ordering::SeqCst);
            let _ = running.shutdown_tx.send(());
        }
    }
}
