//! Connection supervisor
//!
//! Owns the single event connection and keeps it alive. Every input (caller
//! requests, transport callbacks, timer firings, credential results) is a
//! [`Command`] on one unbounded queue drained by one task, so supervisor state
//! is never touched concurrently and needs no locks.
//!
//! ```text
//!            connect                 opened
//! ┌──────┐ ──────────> ┌────────────┐ ──────> ┌──────┐
//! │ Idle │             │ Connecting │         │ Open │
//! └──────┘ <────────── └────────────┘         └──────┘
//!    ^ ^   close (retry     ^  │ timeout          │  │
//!    │ │   scheduled)       │  └──> reconnect ────┘  │ close
//!    │ └────────────────────┼────────────────────────┘
//!    │                      └── reconnect after backoff
//!    │  closed        ┌─────────┐  disconnect
//!    └─────────────── │ Closing │ <──────────── Open
//!                     └─────────┘
//! ```
//!
//! Close classification: a close code above [`NORMAL_CLOSURE_CODE`] means the
//! server invalidated the session, so the handle is dropped and device
//! re-registration runs after the backoff delay. Anything else keeps the
//! handle and re-opens it after the backoff delay.
//!
//! [`NORMAL_CLOSURE_CODE`]: crate::protocol::NORMAL_CLOSURE_CODE

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::ack::AckEmitter;
use crate::auth::AccessTokenProvider;
use crate::backoff::{BackoffConfig, BackoffCounter};
use crate::batcher::{DEFAULT_BATCH_INTERVAL, DEFAULT_CALL_PREFIX, MessageBatcher};
use crate::dispatch::{DeviceReregistrationStrategy, EventDispatcher};
use crate::protocol::{CloseDetail, InboundFrame};
use crate::state::ConnectionState;
use crate::timeout::{ArmId, ConnectionTimeoutGuard, DEFAULT_CONNECT_TIMEOUT};
use crate::transport::{
    ConnectRequest, Connection, ConnectionId, Connector, EventSink, TransportEvent,
};

/// Runtime settings of a supervisor
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    pub connect_timeout: Duration,
    pub batch_interval: Duration,
    pub backoff: BackoffConfig,
    /// `eventType` prefixes that are decoded and dispatched
    pub call_prefixes: Vec<String>,
    pub voice_video: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            batch_interval: DEFAULT_BATCH_INTERVAL,
            backoff: BackoffConfig::default(),
            call_prefixes: vec![DEFAULT_CALL_PREFIX.to_string()],
            voice_video: true,
        }
    }
}

pub(crate) enum Command {
    Connect {
        endpoint: String,
    },
    Credentials {
        epoch: u64,
        endpoint: String,
        token: Option<String>,
    },
    Disconnect,
    SetReregistration(Weak<dyn DeviceReregistrationStrategy>),
    Transport {
        connection: ConnectionId,
        event: TransportEvent,
    },
    ConnectTimeout(ArmId),
    FlushTick(ArmId),
    Retry(RetryAction),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryAction {
    Reconnect,
    Reregister,
}

/// Result of handling one command
enum Flow {
    Continue,
    Stop,
}

/// Builder for the supervisor task
pub struct ConnectionSupervisor {
    config: SupervisorConfig,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn AccessTokenProvider>,
    dispatcher: Arc<dyn EventDispatcher>,
    reregistration: Option<Weak<dyn DeviceReregistrationStrategy>>,
}

impl ConnectionSupervisor {
    pub fn new(
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn AccessTokenProvider>,
        dispatcher: Arc<dyn EventDispatcher>,
    ) -> Self {
        Self {
            config: SupervisorConfig::default(),
            connector,
            tokens,
            dispatcher,
            reregistration: None,
        }
    }

    pub fn with_config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_reregistration_strategy(
        mut self,
        strategy: Weak<dyn DeviceReregistrationStrategy>,
    ) -> Self {
        self.reregistration = Some(strategy);
        self
    }

    /// Start the supervisor task on the current tokio runtime
    pub fn spawn(self) -> SupervisorHandle {
        let (queue, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let task = SupervisorTask {
            backoff: BackoffCounter::new(self.config.backoff),
            guard: ConnectionTimeoutGuard::new(self.config.connect_timeout),
            batcher: MessageBatcher::new(
                self.config.batch_interval,
                self.config.call_prefixes.clone(),
            ),
            acks: AckEmitter::new(),
            config: self.config,
            connector: self.connector,
            tokens: self.tokens,
            dispatcher: self.dispatcher,
            reregistration: self.reregistration,
            queue: queue.clone(),
            state_tx,
            state: ConnectionState::Idle,
            handle: None,
            next_connection: 0,
            epoch: 0,
            fetching: false,
            retry: None,
        };
        tokio::spawn(task.run(rx));

        SupervisorHandle {
            queue,
            state: state_rx,
        }
    }
}

/// Cloneable front end of a running supervisor.
///
/// Requests are queued and handled in order; none of them fail. Requests made
/// after shutdown are logged and dropped.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    queue: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl SupervisorHandle {
    pub fn connect(&self, endpoint: impl Into<String>) {
        self.send(Command::Connect {
            endpoint: endpoint.into(),
        });
    }

    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    pub fn set_reregistration_strategy(&self, strategy: Weak<dyn DeviceReregistrationStrategy>) {
        self.send(Command::SetReregistration(strategy));
    }

    /// Close any connection, cancel all timers and stop the task
    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.queue.is_closed()
    }

    fn send(&self, command: Command) {
        if self.queue.send(command).is_err() {
            tracing::warn!("supervisor has stopped, ignoring request");
        }
    }
}

struct ActiveConnection {
    id: ConnectionId,
    endpoint: String,
    conn: Box<dyn Connection>,
}

struct SupervisorTask {
    config: SupervisorConfig,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn AccessTokenProvider>,
    dispatcher: Arc<dyn EventDispatcher>,
    reregistration: Option<Weak<dyn DeviceReregistrationStrategy>>,

    queue: mpsc::UnboundedSender<Command>,
    state_tx: watch::Sender<ConnectionState>,
    state: ConnectionState,

    /// `None` after an explicit disconnect or an escalation
    handle: Option<ActiveConnection>,
    next_connection: ConnectionId,

    /// Bumped on disconnect so late credential results are recognisable
    epoch: u64,
    fetching: bool,

    backoff: BackoffCounter,
    guard: ConnectionTimeoutGuard,
    batcher: MessageBatcher,
    acks: AckEmitter,
    retry: Option<JoinHandle<()>>,
}

impl SupervisorTask {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            if let Flow::Stop = self.handle_command(command) {
                break;
            }
        }
        self.teardown();
    }

    fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Connect { endpoint } => self.connect(endpoint),
            Command::Credentials {
                epoch,
                endpoint,
                token,
            } => self.on_credentials(epoch, endpoint, token),
            Command::Disconnect => self.disconnect(),
            Command::SetReregistration(strategy) => self.reregistration = Some(strategy),
            Command::Transport { connection, event } => self.on_transport(connection, event),
            Command::ConnectTimeout(arm) => self.on_connect_timeout(arm),
            Command::FlushTick(arm) => self.on_flush_tick(arm),
            Command::Retry(action) => self.on_retry(action),
            Command::Shutdown => return Flow::Stop,
        }
        Flow::Continue
    }

    fn connect(&mut self, endpoint: String) {
        if let Some(active) = &self.handle {
            if active.endpoint != endpoint {
                tracing::warn!(
                    current = %active.endpoint,
                    requested = %endpoint,
                    "connection already exists, reusing it"
                );
            }
            self.open_handle();
            return;
        }

        if self.fetching {
            tracing::debug!("access token request already in flight");
            return;
        }
        self.fetching = true;

        let epoch = self.epoch;
        let tokens = Arc::clone(&self.tokens);
        let queue = self.queue.clone();
        tokio::spawn(async move {
            let token = tokens.access_token().await;
            let _ = queue.send(Command::Credentials {
                epoch,
                endpoint,
                token,
            });
        });
    }

    fn on_credentials(&mut self, epoch: u64, endpoint: String, token: Option<String>) {
        if epoch != self.epoch {
            tracing::debug!("discarding access token that arrived after disconnect");
            return;
        }
        self.fetching = false;

        let Some(token) = token else {
            tracing::warn!("no access token available, not connecting");
            return;
        };

        if self.handle.is_some() {
            self.open_handle();
            return;
        }

        self.next_connection += 1;
        let id = self.next_connection;
        let queue = self.queue.clone();
        let sink = EventSink::new(id, move |connection, event| {
            queue.send(Command::Transport { connection, event }).is_ok()
        });
        let request = ConnectRequest {
            endpoint: endpoint.clone(),
            bearer_token: token,
            voice_video: self.config.voice_video,
        };

        tracing::info!(connection = id, endpoint = %endpoint, "creating event connection");
        let conn = self.connector.create(request, sink);
        self.handle = Some(ActiveConnection { id, endpoint, conn });
        self.open_handle();
    }

    fn disconnect(&mut self) {
        if self.fetching {
            tracing::info!("abandoning in-flight access token request");
            self.fetching = false;
            self.epoch += 1;
        }

        if self.handle.is_none() {
            tracing::warn!("disconnect requested without a connection");
            return;
        }
        if !self.state.is_open() {
            tracing::warn!(
                state = %self.state,
                "disconnect requested while connection is not open"
            );
            return;
        }

        self.batcher.stop();
        self.guard.cancel();
        self.set_state(ConnectionState::Closing);

        // Dropping the handle is what marks the coming close as intentional
        if let Some(mut active) = self.handle.take() {
            tracing::info!(connection = active.id, "disconnecting");
            active.conn.close();
        }
    }

    fn reconnect(&mut self) {
        if self.handle.is_none() {
            tracing::warn!("reconnect requested without a connection");
            return;
        }
        if self.state.is_open() {
            tracing::warn!("reconnect requested while connection is open");
            return;
        }
        self.open_handle();
    }

    fn open_handle(&mut self) {
        if self.state.is_open() {
            tracing::warn!("connection is already open");
            return;
        }
        let Some(active) = self.handle.as_mut() else {
            return;
        };

        tracing::info!(connection = active.id, endpoint = %active.endpoint, "opening connection");
        active.conn.open();
        if self.guard.is_armed() {
            tracing::debug!("restarting connect timeout for the new attempt");
        }
        self.guard.arm(&self.queue, Command::ConnectTimeout);
        self.set_state(ConnectionState::Connecting);
    }

    fn on_transport(&mut self, connection: ConnectionId, event: TransportEvent) {
        let current = self.handle.as_ref().map(|active| active.id);

        match event {
            TransportEvent::Opened if current == Some(connection) => self.on_open(),
            TransportEvent::Text(text) if current == Some(connection) => self.on_text(&text),
            TransportEvent::Closed(detail) if current.is_none() || current == Some(connection) => {
                self.on_close(detail)
            }
            _ => tracing::debug!(connection, "ignoring event from superseded connection"),
        }
    }

    fn on_open(&mut self) {
        if self.state.is_open() {
            tracing::debug!("duplicate open notification");
            return;
        }

        // An open session supersedes any pending reconnect or re-registration
        if let Some(retry) = self.retry.take() {
            retry.abort();
        }

        self.backoff.reset();
        self.batcher.start(&self.queue, Command::FlushTick);
        self.guard.cancel();
        self.set_state(ConnectionState::Open);
        tracing::info!("event connection open");

        self.dispatcher.prepare_for_calls();
    }

    fn on_text(&mut self, text: &str) {
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed frame");
                return;
            }
        };

        if let Some(active) = self.handle.as_mut() {
            self.acks.acknowledge(&frame.id, active.conn.as_mut());
        }

        tracing::debug!(
            id = %frame.id,
            event_type = frame.event_type().unwrap_or_default(),
            pending = self.batcher.len() + 1,
            "frame queued"
        );
        self.batcher.enqueue(frame.into());
    }

    fn on_close(&mut self, detail: Option<CloseDetail>) {
        self.batcher.stop();
        self.guard.cancel();

        // A close that carries no detail is neither retried nor escalated, even
        // when the handle is still held. The caller has to connect again.
        let Some(detail) = detail else {
            tracing::info!("connection closed without detail, not retrying");
            self.set_state(ConnectionState::Idle);
            return;
        };

        if self.handle.is_none() {
            tracing::info!(code = detail.code, "connection closed after disconnect");
            self.set_state(ConnectionState::Idle);
            return;
        }

        let delay = self.backoff.next();
        self.set_state(ConnectionState::Idle);

        if detail.is_abnormal() {
            self.handle = None;
            tracing::warn!(
                code = detail.code,
                reason = %detail.reason,
                delay_ms = delay.as_millis() as u64,
                "session invalidated, re-registering device after delay"
            );
            self.schedule(delay, RetryAction::Reregister);
        } else {
            tracing::info!(
                code = detail.code,
                reason = %detail.reason,
                delay_ms = delay.as_millis() as u64,
                "connection dropped, reconnecting after delay"
            );
            self.schedule(delay, RetryAction::Reconnect);
        }
    }

    fn on_connect_timeout(&mut self, arm: ArmId) {
        if !self.guard.fire(arm) {
            tracing::trace!(arm, "stale connect timeout");
            return;
        }
        tracing::warn!(
            timeout_ms = self.guard.interval().as_millis() as u64,
            "connect attempt timed out, reconnecting"
        );
        self.reconnect();
    }

    fn on_flush_tick(&mut self, arm: ArmId) {
        if !self.batcher.accepts(arm) {
            return;
        }

        let report = self.batcher.flush();
        if !report.events.is_empty() {
            tracing::debug!(
                events = report.events.len(),
                dropped = report.decode_failures,
                "dispatching call events"
            );
        }
        for event in report.events {
            self.dispatcher.handle(event);
        }
    }

    fn on_retry(&mut self, action: RetryAction) {
        self.retry = None;
        match action {
            RetryAction::Reconnect => self.reconnect(),
            RetryAction::Reregister => self.reregister(),
        }
    }

    fn reregister(&mut self) {
        match self.reregistration.as_ref().and_then(Weak::upgrade) {
            Some(strategy) => {
                tracing::info!("re-registering device");
                strategy.reregister_device();
            }
            None => tracing::warn!("no device re-registration strategy available"),
        }
    }

    fn schedule(&mut self, delay: Duration, action: RetryAction) {
        if let Some(previous) = self.retry.take() {
            previous.abort();
        }

        let queue = self.queue.clone();
        self.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = queue.send(Command::Retry(action));
        }));
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            tracing::debug!(from = %self.state, to = %state, "connection state changed");
            self.state = state;
            self.state_tx.send_replace(state);
        }
    }

    fn teardown(&mut self) {
        self.guard.cancel();
        self.batcher.stop();
        if let Some(retry) = self.retry.take() {
            retry.abort();
        }
        if let Some(mut active) = self.handle.take() {
            active.conn.close();
        }
        self.set_state(ConnectionState::Idle);
        tracing::info!(
            acks_sent = self.acks.sent(),
            acks_failed = self.acks.failed(),
            "supervisor stopped"
        );
    }
}
