//! Supervisor behaviour against a scripted transport.
//!
//! Runs on tokio's paused clock: sleeping in a test lets every ready task run
//! and then jumps virtual time forward, so timer-driven paths are exact.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use mercury_core::{
    AccessTokenProvider, CallEvent, CloseDetail, ConnectRequest, Connection, ConnectionId,
    ConnectionState, ConnectionSupervisor, Connector, DeviceReregistrationStrategy, EventDispatcher,
    EventSink, StaticTokenProvider, SupervisorHandle, TransportError,
};

#[derive(Default)]
struct FakeState {
    requests: Vec<ConnectRequest>,
    sinks: Vec<EventSink>,
    opens: Vec<ConnectionId>,
    closes: Vec<ConnectionId>,
    sent: Vec<(ConnectionId, String)>,
    fail_sends: bool,
}

#[derive(Default)]
struct FakeNet {
    state: Mutex<FakeState>,
}

impl FakeNet {
    fn requests(&self) -> Vec<ConnectRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    fn opens(&self) -> usize {
        self.state.lock().unwrap().opens.len()
    }

    fn closes(&self) -> usize {
        self.state.lock().unwrap().closes.len()
    }

    fn sent(&self) -> Vec<(ConnectionId, String)> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Sink of the most recently created connection
    fn sink(&self) -> EventSink {
        self.state.lock().unwrap().sinks.last().cloned().unwrap()
    }

    fn fail_sends(&self) {
        self.state.lock().unwrap().fail_sends = true;
    }
}

struct FakeConnector(Arc<FakeNet>);

impl Connector for FakeConnector {
    fn create(&self, request: ConnectRequest, sink: EventSink) -> Box<dyn Connection> {
        let id = sink.connection();
        let mut state = self.0.state.lock().unwrap();
        state.requests.push(request);
        state.sinks.push(sink);
        Box::new(FakeConnection {
            id,
            net: Arc::clone(&self.0),
        })
    }
}

struct FakeConnection {
    id: ConnectionId,
    net: Arc<FakeNet>,
}

impl Connection for FakeConnection {
    fn open(&mut self) {
        self.net.state.lock().unwrap().opens.push(self.id);
    }

    fn close(&mut self) {
        self.net.state.lock().unwrap().closes.push(self.id);
    }

    fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        let mut state = self.net.state.lock().unwrap();
        if state.fail_sends {
            return Err(TransportError::NotConnected);
        }
        state.sent.push((self.id, text));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingDispatcher {
    prepared: AtomicUsize,
    events: Mutex<Vec<CallEvent>>,
}

impl RecordingDispatcher {
    fn events(&self) -> Vec<CallEvent> {
        self.events.lock().unwrap().clone()
    }

    fn prepared(&self) -> usize {
        self.prepared.load(Ordering::SeqCst)
    }
}

impl EventDispatcher for RecordingDispatcher {
    fn prepare_for_calls(&self) {
        self.prepared.fetch_add(1, Ordering::SeqCst);
    }

    fn handle(&self, event: CallEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[derive(Default)]
struct CountingStrategy {
    calls: AtomicUsize,
}

impl CountingStrategy {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DeviceReregistrationStrategy for CountingStrategy {
    fn reregister_device(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Token provider that answers after a delay
struct SlowTokens(Duration);

impl AccessTokenProvider for SlowTokens {
    fn access_token(&self) -> BoxFuture<'static, Option<String>> {
        let delay = self.0;
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Some("late-token".to_string())
        })
    }
}

/// Logged-out session: every request yields nothing
#[derive(Default)]
struct NoTokens {
    asked: AtomicUsize,
}

impl AccessTokenProvider for NoTokens {
    fn access_token(&self) -> BoxFuture<'static, Option<String>> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { None })
    }
}

struct Harness {
    net: Arc<FakeNet>,
    dispatcher: Arc<RecordingDispatcher>,
    strategy: Arc<CountingStrategy>,
    handle: SupervisorHandle,
}

const ENDPOINT: &str = "wss://events.example.com/v1";
const CALL_FRAME: &str = r#"{"id":"1","data":{"eventType":"locus.call"}}"#;

fn harness_with_tokens(tokens: Arc<dyn AccessTokenProvider>) -> Harness {
    let net = Arc::new(FakeNet::default());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let strategy = Arc::new(CountingStrategy::default());

    let weak: Weak<CountingStrategy> = Arc::downgrade(&strategy);
    let weak: Weak<dyn DeviceReregistrationStrategy> = weak;
    let handle = ConnectionSupervisor::new(
        Arc::new(FakeConnector(Arc::clone(&net))),
        tokens,
        dispatcher.clone(),
    )
    .with_reregistration_strategy(weak)
    .spawn();

    Harness {
        net,
        dispatcher,
        strategy,
        handle,
    }
}

fn harness() -> Harness {
    harness_with_tokens(Arc::new(StaticTokenProvider::new("token")))
}

/// Let queued work run; advances virtual time by one millisecond
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

impl Harness {
    async fn open(&self) {
        self.handle.connect(ENDPOINT);
        settle().await;
        self.net.sink().opened();
        settle().await;
        assert_eq!(self.handle.state(), ConnectionState::Open);
    }
}

#[tokio::test(start_paused = true)]
async fn connect_builds_authorized_request() {
    let h = harness();

    h.handle.connect(ENDPOINT);
    settle().await;

    let requests = h.net.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].endpoint, ENDPOINT);
    assert_eq!(requests[0].authorization(), "Bearer token");
    assert!(requests[0].voice_video);
    assert_eq!(h.net.opens(), 1);
    assert_eq!(h.handle.state(), ConnectionState::Connecting);
}

#[tokio::test(start_paused = true)]
async fn scenario_open_ack_and_batched_delivery() {
    let h = harness();
    h.open().await;
    assert_eq!(h.dispatcher.prepared(), 1);

    h.net.sink().text(CALL_FRAME);
    settle().await;

    // Ack goes out immediately, delivery waits for the batch tick
    let sent = h.net.sent();
    assert_eq!(sent.len(), 1);
    let ack: serde_json::Value = serde_json::from_str(&sent[0].1).unwrap();
    assert_eq!(ack, serde_json::json!({"type": "ack", "messageId": "1"}));
    assert!(h.dispatcher.events().is_empty());

    sleep_ms(600).await;
    let events = h.dispatcher.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "locus.call");

    sleep_ms(2000).await;
    assert_eq!(h.dispatcher.events().len(), 1, "event delivered exactly once");
}

#[tokio::test(start_paused = true)]
async fn batch_preserves_order_and_filters() {
    let h = harness();
    h.open().await;

    let sink = h.net.sink();
    sink.text(r#"{"id":"a","data":{"eventType":"locus.first"}}"#);
    sink.text(r#"{"id":"b","data":{"eventType":"conversation.activity"}}"#);
    sink.text(r#"{"id":"c","data":{"eventType":"locus.bad","locus":{"participants":7}}}"#);
    sink.text(r#"{"id":"d","data":{"eventType":"locus.second"}}"#);
    settle().await;

    assert_eq!(h.net.sent().len(), 4, "every frame is acknowledged");

    sleep_ms(600).await;
    let types: Vec<String> = h
        .dispatcher
        .events()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(types, vec!["locus.first", "locus.second"]);
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_dropped_without_closing() {
    let h = harness();
    h.open().await;

    let sink = h.net.sink();
    sink.text("not json");
    sink.text(r#"{"data":{"eventType":"locus.call"}}"#);
    sink.text(CALL_FRAME);
    settle().await;

    assert_eq!(h.net.sent().len(), 1);
    assert_eq!(h.net.closes(), 0);
    assert_eq!(h.handle.state(), ConnectionState::Open);

    sleep_ms(600).await;
    assert_eq!(h.dispatcher.events().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn ack_failure_does_not_block_buffering() {
    let h = harness();
    h.open().await;
    h.net.fail_sends();

    h.net.sink().text(CALL_FRAME);
    sleep_ms(600).await;

    assert!(h.net.sent().is_empty());
    assert_eq!(h.dispatcher.events().len(), 1);
    assert_eq!(h.handle.state(), ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn scenario_recoverable_then_abnormal_close() {
    let h = harness();
    h.handle.connect(ENDPOINT);
    settle().await;
    assert_eq!(h.net.opens(), 1);

    // Recoverable: reconnect on the same handle after 0.5s
    h.net.sink().closed(Some(CloseDetail::new(1000, "going away")));
    sleep_ms(497).await;
    assert_eq!(h.net.opens(), 1);
    sleep_ms(5).await;
    assert_eq!(h.net.opens(), 2);
    assert_eq!(h.net.requests().len(), 1, "handle is reused");
    assert_eq!(h.handle.state(), ConnectionState::Connecting);

    // Abnormal: handle dropped, re-registration after 1.0s instead of reconnect
    h.net.sink().closed(Some(CloseDetail::new(4001, "device not found")));
    sleep_ms(997).await;
    assert_eq!(h.strategy.calls(), 0);
    sleep_ms(5).await;
    assert_eq!(h.strategy.calls(), 1);
    assert_eq!(h.net.opens(), 2);
    assert_eq!(h.handle.state(), ConnectionState::Idle);

    // The discarded handle is gone: a new connect builds a fresh one
    h.handle.connect(ENDPOINT);
    settle().await;
    assert_eq!(h.net.requests().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn close_code_above_normal_escalates() {
    let h = harness();
    h.open().await;

    h.net.sink().closed(Some(CloseDetail::new(1011, "internal error")));
    sleep_ms(600).await;

    assert_eq!(h.strategy.calls(), 1);
    assert_eq!(h.net.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn open_before_escalation_cancels_reregistration() {
    let h = harness();
    h.open().await;

    h.net.sink().closed(Some(CloseDetail::new(4001, "device not found")));
    settle().await;
    assert_eq!(h.handle.state(), ConnectionState::Idle);

    // Caller reconnects before the 0.5s escalation delay runs out
    h.open().await;
    assert_eq!(h.net.requests().len(), 2);

    sleep_ms(600).await;
    assert_eq!(h.strategy.calls(), 0);
    assert_eq!(h.handle.state(), ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn successful_open_resets_backoff() {
    let h = harness();
    h.open().await;

    // Two drops grow the delay to 1s
    h.net.sink().closed(Some(CloseDetail::new(1000, "drop")));
    sleep_ms(501).await;
    h.net.sink().closed(Some(CloseDetail::new(1000, "drop")));
    sleep_ms(1001).await;
    assert_eq!(h.net.opens(), 3);

    h.net.sink().opened();
    settle().await;
    assert_eq!(h.dispatcher.prepared(), 2);

    // Back to 0.5s
    h.net.sink().closed(Some(CloseDetail::new(1000, "drop")));
    sleep_ms(502).await;
    assert_eq!(h.net.opens(), 4);
}

#[tokio::test(start_paused = true)]
async fn scenario_handshake_timeout_reconnects() {
    let h = harness();
    h.handle.connect(ENDPOINT);
    settle().await;
    assert_eq!(h.net.opens(), 1);

    sleep_ms(59_000).await;
    assert_eq!(h.net.opens(), 1);

    sleep_ms(1_500).await;
    assert_eq!(h.net.opens(), 2, "timeout reconnects exactly once");
    assert_eq!(h.net.requests().len(), 1, "handle kept");
    assert_eq!(h.handle.state(), ConnectionState::Connecting);

    // Backoff untouched by the timeout: first retry delay is still 0.5s
    h.net.sink().closed(Some(CloseDetail::new(1000, "drop")));
    sleep_ms(502).await;
    assert_eq!(h.net.opens(), 3);
}

#[tokio::test(start_paused = true)]
async fn open_cancels_connect_timeout() {
    let h = harness();
    h.open().await;

    sleep_ms(120_000).await;
    assert_eq!(h.net.opens(), 1);
    assert_eq!(h.handle.state(), ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn connect_twice_while_open_is_idempotent() {
    let h = harness();
    h.open().await;

    h.handle.connect(ENDPOINT);
    h.handle.connect(ENDPOINT);
    settle().await;

    assert_eq!(h.net.requests().len(), 1);
    assert_eq!(h.net.opens(), 1);
    assert_eq!(h.dispatcher.prepared(), 1);
    assert_eq!(h.handle.state(), ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn connect_during_token_fetch_fetches_once() {
    let h = harness_with_tokens(Arc::new(SlowTokens(Duration::from_secs(1))));

    h.handle.connect(ENDPOINT);
    h.handle.connect(ENDPOINT);
    sleep_ms(1_100).await;

    assert_eq!(h.net.requests().len(), 1);
    assert_eq!(h.net.requests()[0].bearer_token, "late-token");
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_intentional_and_idempotent() {
    let h = harness();
    h.open().await;

    h.handle.disconnect();
    settle().await;
    assert_eq!(h.net.closes(), 1);
    assert_eq!(h.handle.state(), ConnectionState::Closing);

    // The transport confirms; neither code leads to a retry
    h.net.sink().closed(Some(CloseDetail::new(4001, "bye")));
    settle().await;
    assert_eq!(h.handle.state(), ConnectionState::Idle);

    h.handle.disconnect();
    sleep_ms(60_000).await;
    assert_eq!(h.net.closes(), 1);
    assert_eq!(h.net.opens(), 1);
    assert_eq!(h.strategy.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn disconnect_stops_batch_delivery() {
    let h = harness();
    h.open().await;

    h.net.sink().text(CALL_FRAME);
    settle().await;
    h.handle.disconnect();
    sleep_ms(2_000).await;

    assert!(h.dispatcher.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn disconnect_without_connection_is_noop() {
    let h = harness();
    h.handle.disconnect();
    settle().await;

    assert_eq!(h.net.closes(), 0);
    assert_eq!(h.handle.state(), ConnectionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn token_arriving_after_disconnect_is_ignored() {
    let h = harness_with_tokens(Arc::new(SlowTokens(Duration::from_secs(1))));

    h.handle.connect(ENDPOINT);
    settle().await;
    h.handle.disconnect();
    sleep_ms(2_000).await;

    assert!(h.net.requests().is_empty());
    assert_eq!(h.handle.state(), ConnectionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn missing_token_aborts_connect() {
    let tokens = Arc::new(NoTokens::default());
    let h = harness_with_tokens(tokens.clone());

    h.handle.connect(ENDPOINT);
    sleep_ms(120_000).await;

    assert!(h.net.requests().is_empty());
    assert_eq!(h.handle.state(), ConnectionState::Idle);
    assert_eq!(tokens.asked.load(Ordering::SeqCst), 1, "no automatic retry");

    // Not stuck: the next connect asks again
    h.handle.connect(ENDPOINT);
    settle().await;
    assert_eq!(tokens.asked.load(Ordering::SeqCst), 2);
    assert!(h.net.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn close_without_detail_is_not_retried() {
    let h = harness();
    h.open().await;

    h.net.sink().closed(None);
    sleep_ms(60_000).await;

    assert_eq!(h.net.opens(), 1);
    assert_eq!(h.strategy.calls(), 0);
    assert_eq!(h.handle.state(), ConnectionState::Idle);

    // The handle is still held, so connect re-opens it
    h.handle.connect(ENDPOINT);
    settle().await;
    assert_eq!(h.net.requests().len(), 1);
    assert_eq!(h.net.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn events_from_superseded_connection_are_ignored() {
    let h = harness();
    h.open().await;
    let old = h.net.sink();

    old.closed(Some(CloseDetail::new(4001, "invalid")));
    sleep_ms(600).await;
    h.handle.connect(ENDPOINT);
    settle().await;
    assert_eq!(h.net.requests().len(), 2);

    old.text(CALL_FRAME);
    old.opened();
    settle().await;

    assert!(h.net.sent().is_empty());
    assert_eq!(h.handle.state(), ConnectionState::Connecting);
}

#[tokio::test(start_paused = true)]
async fn dropped_strategy_is_tolerated() {
    let net = Arc::new(FakeNet::default());
    let strategy = Arc::new(CountingStrategy::default());
    let weak: Weak<CountingStrategy> = Arc::downgrade(&strategy);
    let weak: Weak<dyn DeviceReregistrationStrategy> = weak;

    let handle = ConnectionSupervisor::new(
        Arc::new(FakeConnector(Arc::clone(&net))),
        Arc::new(StaticTokenProvider::new("token")),
        Arc::new(RecordingDispatcher::default()),
    )
    .spawn();
    handle.set_reregistration_strategy(weak);
    drop(strategy);

    handle.connect(ENDPOINT);
    settle().await;
    net.sink().closed(Some(CloseDetail::new(4001, "invalid")));
    sleep_ms(600).await;

    assert!(handle.is_running());
    assert_eq!(handle.state(), ConnectionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_connection_and_stops() {
    let h = harness();
    h.open().await;

    let mut states = h.handle.subscribe();
    h.handle.shutdown();
    settle().await;

    assert_eq!(h.net.closes(), 1);
    assert!(!h.handle.is_running());
    assert_eq!(*states.borrow_and_update(), ConnectionState::Idle);

    // Requests after shutdown are ignored
    h.handle.connect(ENDPOINT);
    settle().await;
    assert_eq!(h.net.requests().len(), 1);
}
