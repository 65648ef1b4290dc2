// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end request/response behavior between services on the in-process
//! transport.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use cluster_transport::{
    executor::names,
    fault::{SIMULATED_DISCONNECT, SIMULATED_UNRESPONSIVE},
    versioned_message, ConnectionListener, EmptyMessage, NodeDescriptor, RemoteError,
    RequestOptions, ResponseHandler, ResponseOptions, StringMessage, Tracer, TransportChannel,
    TransportError, TransportService, TransportSettings, Version,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;

const VERSION_A: Version = Version::from_id(99);
const VERSION_B: Version = Version::from_id(199);

struct Cluster {
    a: TransportService,
    b: TransportService,
    node_a: NodeDescriptor,
    node_b: NodeDescriptor,
    events_a: Arc<CountingListener>,
    events_b: Arc<CountingListener>,
}

#[derive(Default)]
struct CountingListener {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
}

impl ConnectionListener for CountingListener {
    fn on_node_connected(&self, _node: &NodeDescriptor) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_node_disconnected(&self, _node: &NodeDescriptor) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }
}

async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn service(name: &str, version: Version) -> (TransportService, NodeDescriptor, Arc<CountingListener>) {
    let service = TransportService::local(TransportSettings::new(name), version).unwrap();
    let events = Arc::new(CountingListener::default());
    service.add_connection_listener(events.clone());
    let node = service.start().await.unwrap();
    (service, node, events)
}

/// Two nodes at different versions, each connected to the other and to
/// itself.
async fn cluster() -> Cluster {
    init_tracing();
    let (a, node_a, events_a) = service("node_a", VERSION_A).await;
    let (b, node_b, events_b) = service("node_b", VERSION_B).await;

    a.connect_to_node(&node_b).await.unwrap();
    a.connect_to_node(&node_a).await.unwrap();
    b.connect_to_node(&node_a).await.unwrap();
    b.connect_to_node(&node_b).await.unwrap();

    wait_until(|| {
        events_a.connected.load(Ordering::SeqCst) == 2
            && events_b.connected.load(Ordering::SeqCst) == 2
    })
    .await;

    Cluster {
        a,
        b,
        node_a,
        node_b,
        events_a,
        events_b,
    }
}

impl Cluster {
    async fn stop(self) {
        self.a.stop().await;
        self.b.stop().await;
    }
}

fn reply_hello(request: StringMessage, channel: TransportChannel) -> cluster_transport::HandlerResult {
    assert_eq!(request.message, "moshe");
    channel.send_response(&StringMessage::new("hello moshe"))?;
    Ok(())
}

struct OneshotHandler<T> {
    executor: &'static str,
    tx: Mutex<Option<oneshot::Sender<Result<T, TransportError>>>>,
}

impl<T> OneshotHandler<T> {
    fn new(executor: &'static str) -> (Self, oneshot::Receiver<Result<T, TransportError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                executor,
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    fn resolve(&self, outcome: Result<T, TransportError>) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(outcome);
        }
    }
}

impl ResponseHandler for OneshotHandler<StringMessage> {
    type Response = StringMessage;

    fn new_instance(&self) -> StringMessage {
        StringMessage::default()
    }

    fn executor(&self) -> &str {
        self.executor
    }

    fn handle_response(&self, response: StringMessage) {
        self.resolve(Ok(response));
    }

    fn handle_exception(&self, error: TransportError) {
        self.resolve(Err(error));
    }
}

#[tokio::test]
async fn test_hello_world() {
    let cluster = cluster().await;
    cluster
        .b
        .register_handler_fn("internal:sayHello", names::GENERIC, reply_hello)
        .unwrap();

    let (handler, rx) = OneshotHandler::new(names::GENERIC);
    cluster
        .a
        .send_request(
            &cluster.node_b,
            "internal:sayHello",
            &StringMessage::new("moshe"),
            RequestOptions::new(),
            handler,
        )
        .unwrap();
    assert_eq!(rx.await.unwrap().unwrap().message, "hello moshe");

    let reply: StringMessage = cluster
        .a
        .submit_request(
            &cluster.node_b,
            "internal:sayHello",
            &StringMessage::new("moshe"),
            RequestOptions::new().with_timeout_ms(3000),
        )
        .await
        .unwrap();
    assert_eq!(reply.message, "hello moshe");
    assert_eq!(cluster.a.pending_count(), 0);

    cluster.stop().await;
}

#[tokio::test]
async fn test_hello_world_compressed() {
    let cluster = cluster().await;
    cluster
        .b
        .register_handler_fn(
            "internal:sayHello",
            names::GENERIC,
            |request: StringMessage, channel: TransportChannel| {
                assert_eq!(request.message, "moshe");
                channel.send_response_with(
                    &StringMessage::new("hello moshe"),
                    ResponseOptions::default().with_compress(true),
                )?;
                Ok(())
            },
        )
        .unwrap();

    let reply: StringMessage = cluster
        .a
        .submit_request(
            &cluster.node_b,
            "internal:sayHello",
            &StringMessage::new("moshe"),
            RequestOptions::new().with_compress(true),
        )
        .await
        .unwrap();
    assert_eq!(reply.message, "hello moshe");

    cluster.stop().await;
}

#[tokio::test]
async fn test_empty_message_both_ways() {
    let cluster = cluster().await;
    cluster
        .b
        .register_handler_fn(
            "internal:empty",
            names::SAME,
            |_: EmptyMessage, channel: TransportChannel| {
                channel.send_response(&EmptyMessage::default())?;
                Ok(())
            },
        )
        .unwrap();

    let reply: EmptyMessage = cluster
        .a
        .submit_request(
            &cluster.node_b,
            "internal:empty",
            &EmptyMessage::default(),
            RequestOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(reply, EmptyMessage::default());

    cluster.stop().await;
}

#[tokio::test]
async fn test_empty_message_compressed() {
    let cluster = cluster().await;
    cluster
        .b
        .register_handler_fn(
            "internal:empty",
            names::GENERIC,
            |_: EmptyMessage, channel: TransportChannel| {
                channel.send_response_with(
                    &EmptyMessage::default(),
                    ResponseOptions::default().with_compress(true),
                )?;
                Ok(())
            },
        )
        .unwrap();

    let reply: EmptyMessage = cluster
        .a
        .submit_request(
            &cluster.node_b,
            "internal:empty",
            &EmptyMessage::default(),
            RequestOptions::new().with_compress(true),
        )
        .await
        .unwrap();
    assert_eq!(reply, EmptyMessage::default());
    wait_until(|| cluster.b.stats().responses_sent == 1).await;

    cluster.stop().await;
}

#[tokio::test]
async fn test_handler_error_reaches_caller() {
    let cluster = cluster().await;
    cluster
        .b
        .register_handler_fn(
            "internal:sayHelloException",
            names::GENERIC,
            |request: StringMessage, _channel: TransportChannel| {
                assert_eq!(request.message, "moshe");
                Err("bad message !!!".into())
            },
        )
        .unwrap();

    let err = cluster
        .a
        .submit_request::<StringMessage>(
            &cluster.node_b,
            "internal:sayHelloException",
            &StringMessage::new("moshe"),
            RequestOptions::new(),
        )
        .await
        .unwrap_err();

    assert!(err.is_remote(), "unexpected error: {err}");
    let remote = err.remote_error().unwrap();
    assert_eq!(remote.message, "bad message !!!");
    assert_eq!(remote.error_type, "handler_failure");
    assert_eq!(remote.node, "node_b");
    assert_eq!(remote.action, "internal:sayHelloException");

    cluster.stop().await;
}

#[tokio::test]
async fn test_handler_panic_becomes_remote_error() {
    let cluster = cluster().await;
    cluster
        .b
        .register_handler_fn(
            "internal:panic",
            names::GENERIC,
            |_: StringMessage, _channel: TransportChannel| -> cluster_transport::HandlerResult {
                panic!("handler exploded")
            },
        )
        .unwrap();

    let err = cluster
        .a
        .submit_request::<StringMessage>(
            &cluster.node_b,
            "internal:panic",
            &StringMessage::new("x"),
            RequestOptions::new().with_timeout_ms(3000),
        )
        .await
        .unwrap_err();
    let remote = err.remote_error().unwrap();
    assert_eq!(remote.error_type, "panic");
    assert_eq!(remote.message, "handler exploded");

    cluster.stop().await;
}

#[tokio::test]
async fn test_unknown_action() {
    let cluster = cluster().await;

    let err = cluster
        .a
        .submit_request::<StringMessage>(
            &cluster.node_b,
            "internal:missing",
            &StringMessage::new("x"),
            RequestOptions::new(),
        )
        .await
        .unwrap_err();
    let remote = err.remote_error().unwrap();
    assert_eq!(remote.error_type, "action_not_found");
    assert_eq!(remote.message, "no handler found for action [internal:missing]");

    cluster.stop().await;
}

#[tokio::test]
async fn test_duplicate_handler_rejected() {
    let cluster = cluster().await;
    cluster
        .b
        .register_handler_fn("internal:sayHello", names::GENERIC, reply_hello)
        .unwrap();
    let err = cluster
        .b
        .register_handler_fn("internal:sayHello", names::SAME, reply_hello)
        .unwrap_err();
    assert!(matches!(err, TransportError::DuplicateHandler(_)));

    cluster.stop().await;
}

#[tokio::test]
async fn test_disconnect_listener_fires_once() {
    let cluster = cluster().await;

    assert!(cluster.a.disconnect_from_node(&cluster.node_b));
    assert!(!cluster.a.disconnect_from_node(&cluster.node_b));
    assert!(!cluster.a.node_connected(&cluster.node_b));

    wait_until(|| cluster.events_a.disconnected.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cluster.events_a.disconnected.load(Ordering::SeqCst), 1);

    let err = cluster
        .a
        .submit_request::<StringMessage>(
            &cluster.node_b,
            "internal:sayHello",
            &StringMessage::new("moshe"),
            RequestOptions::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err.root_cause(),
        TransportError::NodeNotConnected { .. }
    ));

    cluster.stop().await;
}

#[tokio::test]
async fn test_notify_on_shutdown() {
    let cluster = cluster().await;
    cluster
        .b
        .register_handler_fn(
            "internal:stall",
            names::GENERIC,
            |_: StringMessage, _channel: TransportChannel| Ok(()),
        )
        .unwrap();

    let pending = cluster.a.submit_request::<StringMessage>(
        &cluster.node_b,
        "internal:stall",
        &StringMessage::new("x"),
        RequestOptions::new(),
    );
    wait_until(|| cluster.b.stats().requests_received == 1).await;

    cluster.b.stop().await;

    let err = pending.await.unwrap_err();
    assert!(
        matches!(err, TransportError::NodeDisconnected { ref action, .. } if action == "internal:stall"),
        "unexpected error: {err}"
    );
    wait_until(|| cluster.events_a.disconnected.load(Ordering::SeqCst) >= 1).await;
    assert!(!cluster.a.node_connected(&cluster.node_b));

    cluster.a.stop().await;
}

#[tokio::test]
async fn test_timeout_without_response() {
    let cluster = cluster().await;
    cluster
        .b
        .register_handler_fn(
            "internal:sayHelloTimeoutNoResponse",
            names::GENERIC,
            |request: StringMessage, _channel: TransportChannel| {
                assert_eq!(request.message, "moshe");
                Ok(())
            },
        )
        .unwrap();

    let started = Instant::now();
    let err = cluster
        .a
        .submit_request::<StringMessage>(
            &cluster.node_b,
            "internal:sayHelloTimeoutNoResponse",
            &StringMessage::new("moshe"),
            RequestOptions::new().with_timeout_ms(100),
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.is_timeout(), "unexpected error: {err}");
    assert!(elapsed >= Duration::from_millis(100), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(1), "fired late: {elapsed:?}");
    match err {
        TransportError::ReceiveTimeout {
            node,
            action,
            timeout_ms,
            ..
        } => {
            assert_eq!(node, "node_b");
            assert_eq!(action, "internal:sayHelloTimeoutNoResponse");
            assert_eq!(timeout_ms, 100);
        },
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(cluster.a.stats().timeouts, 1);
    assert_eq!(cluster.a.pending_count(), 0);

    cluster.stop().await;
}

#[tokio::test]
async fn test_timeout_with_delayed_responses() {
    let cluster = cluster().await;
    cluster
        .b
        .register_handler_fn(
            "internal:sayHelloTimeoutDelayedResponse",
            names::GENERIC,
            |request: StringMessage, channel: TransportChannel| {
                let delay: u64 = request.message.parse()?;
                std::thread::sleep(Duration::from_millis(delay));
                channel.send_response(&StringMessage::new(format!("hello {delay}")))?;
                Ok(())
            },
        )
        .unwrap();

    let err = cluster
        .a
        .submit_request::<StringMessage>(
            &cluster.node_b,
            "internal:sayHelloTimeoutDelayedResponse",
            &StringMessage::new("300"),
            RequestOptions::new().with_timeout_ms(100),
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "unexpected error: {err}");

    // The late response is logged and discarded.
    wait_until(|| cluster.a.stats().late_responses == 1).await;

    let futures: Vec<_> = (0..10u64)
        .map(|i| {
            cluster.a.submit_request::<StringMessage>(
                &cluster.node_b,
                "internal:sayHelloTimeoutDelayedResponse",
                &StringMessage::new(i.to_string()),
                RequestOptions::new().with_timeout_ms(3000),
            )
        })
        .collect();
    for (i, future) in futures.into_iter().enumerate() {
        assert_eq!(future.await.unwrap().message, format!("hello {i}"));
    }
    assert_eq!(cluster.a.stats().timeouts, 1);

    cluster.stop().await;
}

#[derive(Default)]
struct RecordingTracer {
    events: Mutex<Vec<String>>,
}

impl RecordingTracer {
    fn record(&self, event: String) {
        self.events.lock().push(event);
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.events.lock())
    }

    fn len(&self) -> usize {
        self.events.lock().len()
    }
}

impl Tracer for RecordingTracer {
    fn request_sent(
        &self,
        _node: &NodeDescriptor,
        _request_id: u64,
        action: &str,
        _options: &RequestOptions,
    ) {
        self.record(format!("request_sent {action}"));
    }

    fn request_received(&self, _request_id: u64, action: &str) {
        self.record(format!("request_received {action}"));
    }

    fn response_sent(&self, _request_id: u64, action: &str) {
        self.record(format!("response_sent {action}"));
    }

    fn error_sent(&self, _request_id: u64, action: &str, _error: &RemoteError) {
        self.record(format!("error_sent {action}"));
    }

    fn response_received(&self, _request_id: u64, _node: &NodeDescriptor, action: &str) {
        self.record(format!("response_received {action}"));
    }
}

#[tokio::test]
async fn test_tracer_include_exclude() {
    let cluster = cluster().await;
    cluster
        .b
        .register_handler_fn(
            "internal:test",
            names::GENERIC,
            |_: StringMessage, channel: TransportChannel| {
                channel.send_response(&StringMessage::new("ok"))?;
                Ok(())
            },
        )
        .unwrap();
    cluster
        .b
        .register_handler_fn(
            "internal:testError",
            names::GENERIC,
            |_: StringMessage, _channel: TransportChannel| Err("boom".into()),
        )
        .unwrap();

    let tracer_a = Arc::new(RecordingTracer::default());
    let tracer_b = Arc::new(RecordingTracer::default());
    cluster.a.add_tracer(tracer_a.clone());
    cluster.b.add_tracer(tracer_b.clone());

    let settings = |name: &str| {
        TransportSettings::new(name)
            .with_trace_include(["*"])
            .with_trace_exclude(["*Error"])
    };
    cluster.a.apply_settings(&settings("node_a"));
    cluster.b.apply_settings(&settings("node_b"));

    let _: StringMessage = cluster
        .a
        .submit_request(
            &cluster.node_b,
            "internal:test",
            &StringMessage::new("x"),
            RequestOptions::new(),
        )
        .await
        .unwrap();
    wait_until(|| tracer_b.len() == 2).await;
    assert_eq!(
        tracer_a.take(),
        vec!["request_sent internal:test", "response_received internal:test"]
    );
    assert_eq!(
        tracer_b.take(),
        vec!["request_received internal:test", "response_sent internal:test"]
    );

    let err = cluster
        .a
        .submit_request::<StringMessage>(
            &cluster.node_b,
            "internal:testError",
            &StringMessage::new("x"),
            RequestOptions::new(),
        )
        .await
        .unwrap_err();
    assert!(err.is_remote());
    // The filter only gates the sending side; the receiver traces everything.
    wait_until(|| tracer_b.len() == 2).await;
    assert_eq!(
        tracer_b.take(),
        vec![
            "request_received internal:testError",
            "error_sent internal:testError"
        ]
    );
    assert!(tracer_a.take().is_empty());

    // Filters update live: clearing the exclusion traces the sender again.
    cluster.a.apply_settings(&TransportSettings::new("node_a"));
    let _ = cluster
        .a
        .submit_request::<StringMessage>(
            &cluster.node_b,
            "internal:testError",
            &StringMessage::new("x"),
            RequestOptions::new(),
        )
        .await;
    assert_eq!(
        tracer_a.take(),
        vec![
            "request_sent internal:testError",
            "response_received internal:testError"
        ]
    );

    cluster.stop().await;
}

versioned_message! {
    struct Version0Request {
        value1: i32 => since Version::V_0,
    }
}

versioned_message! {
    struct Version1Request {
        value1: i32 => since Version::V_0,
        value2: i32 => since VERSION_B,
    }
}

versioned_message! {
    struct Version0Response {
        value1: i32 => since Version::V_0,
    }
}

versioned_message! {
    struct Version1Response {
        value1: i32 => since Version::V_0,
        value2: i32 => since VERSION_B,
    }
}

fn register_version_handlers(cluster: &Cluster) {
    cluster
        .a
        .register_handler_fn(
            "internal:version",
            names::SAME,
            |request: Version0Request, channel: TransportChannel| {
                assert_eq!(request.value1, 1);
                channel.send_response(&Version0Response { value1: 1 })?;
                Ok(())
            },
        )
        .unwrap();
    cluster
        .b
        .register_handler_fn(
            "internal:version",
            names::SAME,
            |request: Version1Request, channel: TransportChannel| {
                assert_eq!(request.value1, 1);
                let expected = if channel.version().on_or_after(VERSION_B) { 2 } else { 0 };
                assert_eq!(request.value2, expected);
                channel.send_response(&Version1Response {
                    value1: 1,
                    value2: 2,
                })?;
                Ok(())
            },
        )
        .unwrap();
}

#[tokio::test]
async fn test_old_node_to_new_node() {
    let cluster = cluster().await;
    register_version_handlers(&cluster);
    assert_eq!(cluster.a.connection_version(&cluster.node_b), Some(VERSION_A));

    let reply: Version0Response = cluster
        .a
        .submit_request(
            &cluster.node_b,
            "internal:version",
            &Version0Request { value1: 1 },
            RequestOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(reply.value1, 1);

    cluster.stop().await;
}

#[tokio::test]
async fn test_new_node_to_old_node() {
    let cluster = cluster().await;
    register_version_handlers(&cluster);
    assert_eq!(cluster.b.connection_version(&cluster.node_a), Some(VERSION_A));

    let reply: Version1Response = cluster
        .b
        .submit_request(
            &cluster.node_a,
            "internal:version",
            &Version1Request {
                value1: 1,
                value2: 2,
            },
            RequestOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(reply.value1, 1);
    assert_eq!(reply.value2, 0);

    cluster.stop().await;
}

#[tokio::test]
async fn test_new_fields_dropped_on_old_connection() {
    let cluster = cluster().await;
    register_version_handlers(&cluster);

    let reply: Version1Response = cluster
        .a
        .submit_request(
            &cluster.node_b,
            "internal:version",
            &Version1Request {
                value1: 1,
                value2: 2,
            },
            RequestOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(reply.value1, 1);
    assert_eq!(reply.value2, 0);

    cluster.stop().await;
}

#[tokio::test]
async fn test_new_node_to_itself_keeps_new_fields() {
    let cluster = cluster().await;
    register_version_handlers(&cluster);
    assert_eq!(cluster.b.connection_version(&cluster.node_b), Some(VERSION_B));

    let reply: Version1Response = cluster
        .b
        .submit_request(
            &cluster.node_b,
            "internal:version",
            &Version1Request {
                value1: 1,
                value2: 2,
            },
            RequestOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(reply.value1, 1);
    assert_eq!(reply.value2, 2);

    cluster.stop().await;
}

#[tokio::test]
async fn test_fail_to_send_rule() {
    let cluster = cluster().await;
    cluster
        .b
        .register_handler_fn("internal:sayHello", names::GENERIC, reply_hello)
        .unwrap();
    cluster.a.add_fail_to_send_no_connect_rule(&cluster.node_b);

    let (handler, rx) = OneshotHandler::new(names::SAME);
    let returned = cluster
        .a
        .send_request(
            &cluster.node_b,
            "internal:sayHello",
            &StringMessage::new("moshe"),
            RequestOptions::new(),
            handler,
        )
        .unwrap_err();
    let delivered = rx.await.unwrap().unwrap_err();
    for err in [&returned, &delivered] {
        assert!(matches!(err, TransportError::SendRequest { .. }), "unexpected error: {err}");
        assert!(err.root_cause().is_connect_failure());
        assert!(err.to_string().ends_with(SIMULATED_DISCONNECT));
    }

    let err = cluster.a.connect_to_node(&cluster.node_b).await.unwrap_err();
    assert!(err.to_string().ends_with(SIMULATED_DISCONNECT));
    let err = cluster
        .a
        .connect_to_node_light(&cluster.node_b)
        .await
        .unwrap_err();
    assert!(err.to_string().ends_with(SIMULATED_DISCONNECT));

    cluster.a.clear_rule(&cluster.node_b);
    let reply: StringMessage = cluster
        .a
        .submit_request(
            &cluster.node_b,
            "internal:sayHello",
            &StringMessage::new("moshe"),
            RequestOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(reply.message, "hello moshe");

    cluster.stop().await;
}

#[tokio::test]
async fn test_unresponsive_rule() {
    let cluster = cluster().await;
    cluster
        .b
        .register_handler_fn("internal:sayHello", names::GENERIC, reply_hello)
        .unwrap();
    cluster.a.add_unresponsive_rule(&cluster.node_b);

    let err = cluster
        .a
        .submit_request::<StringMessage>(
            &cluster.node_b,
            "internal:sayHello",
            &StringMessage::new("moshe"),
            RequestOptions::new().with_timeout_ms(100),
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "unexpected error: {err}");
    assert_eq!(cluster.b.stats().requests_received, 0);
    assert_eq!(cluster.a.faults().dropped_count(), 1);

    let err = cluster.a.connect_to_node(&cluster.node_b).await.unwrap_err();
    assert!(err.to_string().ends_with(SIMULATED_UNRESPONSIVE));
    let err = cluster
        .a
        .connect_to_node_light(&cluster.node_b)
        .await
        .unwrap_err();
    assert!(err.to_string().ends_with(SIMULATED_UNRESPONSIVE));

    cluster.a.clear_all_rules();
    let reply: StringMessage = cluster
        .a
        .submit_request(
            &cluster.node_b,
            "internal:sayHello",
            &StringMessage::new("moshe"),
            RequestOptions::new().with_timeout_ms(3000),
        )
        .await
        .unwrap();
    assert_eq!(reply.message, "hello moshe");

    cluster.stop().await;
}

#[tokio::test]
async fn test_remote_address_on_inbound_requests() {
    let cluster = cluster().await;
    cluster
        .b
        .register_handler_fn(
            "internal:whoami",
            names::SAME,
            |_: EmptyMessage, channel: TransportChannel| {
                channel.send_response(&StringMessage::new(channel.remote_address().to_string()))?;
                Ok(())
            },
        )
        .unwrap();

    let reply: StringMessage = cluster
        .a
        .submit_request(
            &cluster.node_b,
            "internal:whoami",
            &EmptyMessage::default(),
            RequestOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(reply.message, cluster.node_a.address.to_string());

    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sends() {
    let cluster = cluster().await;
    cluster
        .b
        .register_handler_fn(
            "internal:echo",
            names::GENERIC,
            |request: StringMessage, channel: TransportChannel| {
                channel.send_response(&request)?;
                Ok(())
            },
        )
        .unwrap();

    let mut tasks = Vec::new();
    for t in 0..8 {
        let service = cluster.a.clone();
        let target = cluster.node_b.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..25 {
                let message = format!("{t}-{i}");
                let reply: StringMessage = service
                    .submit_request(
                        &target,
                        "internal:echo",
                        &StringMessage::new(message.clone()),
                        RequestOptions::new().with_timeout_ms(5000),
                    )
                    .await
                    .unwrap();
                assert_eq!(reply.message, message);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let stats = cluster.a.stats();
    assert_eq!(stats.requests_sent, 200);
    assert_eq!(stats.responses_received, 200);
    assert_eq!(cluster.a.pending_count(), 0);
    wait_until(|| cluster.b.stats().responses_sent == 200).await;

    cluster.stop().await;
}

#[tokio::test]
async fn test_send_after_stop() {
    let cluster = cluster().await;
    let node_b = cluster.node_b.clone();
    let a = cluster.a.clone();
    cluster.stop().await;

    let err = a
        .submit_request::<StringMessage>(
            &node_b,
            "internal:sayHello",
            &StringMessage::new("moshe"),
            RequestOptions::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Stopped));
    assert!(!a.is_started());
}

#[tokio::test]
async fn test_stop_fails_pending_requests() {
    let cluster = cluster().await;
    cluster
        .b
        .register_handler_fn(
            "internal:stall",
            names::GENERIC,
            |_: StringMessage, _channel: TransportChannel| Ok(()),
        )
        .unwrap();

    let pending = cluster.a.submit_request::<StringMessage>(
        &cluster.node_b,
        "internal:stall",
        &StringMessage::new("x"),
        RequestOptions::new(),
    );
    wait_until(|| cluster.b.stats().requests_received == 1).await;
    cluster.a.stop().await;

    let err = pending.await.unwrap_err();
    assert!(
        matches!(
            err,
            TransportError::Stopped | TransportError::NodeDisconnected { .. }
        ),
        "unexpected error: {err}"
    );
    assert_eq!(cluster.a.pending_count(), 0);
    wait_until(|| cluster.events_b.disconnected.load(Ordering::SeqCst) >= 1).await;

    cluster.b.stop().await;
}
