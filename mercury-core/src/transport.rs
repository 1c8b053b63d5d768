//! Abstract message-oriented connection consumed by the supervisor
//!
//! A [`Connector`] turns a [`ConnectRequest`] into a [`Connection`]. The
//! connection reports everything that happens to it through the [`EventSink`]
//! it was created with; it never calls back into the supervisor directly.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::CloseDetail;

/// Identifies one connection handle for the lifetime of a supervisor
pub type ConnectionId = u64;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection is not open")]
    NotConnected,

    #[error("Invalid connect request: {0}")]
    InvalidRequest(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Everything needed to open the event connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub endpoint: String,
    pub bearer_token: String,
    /// Ask the transport for low-latency framing suitable for voice/video
    pub voice_video: bool,
}

impl ConnectRequest {
    /// Value of the `Authorization` header
    pub fn authorization(&self) -> String {
        format!("Bearer {}", self.bearer_token)
    }
}

/// Something that happened on a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    /// `None` when the connection ended without any close detail
    Closed(Option<CloseDetail>),
    Text(String),
}

type Forward = dyn Fn(ConnectionId, TransportEvent) -> bool + Send + Sync;

/// Where a connection reports its events
#[derive(Clone)]
pub struct EventSink {
    connection: ConnectionId,
    forward: Arc<Forward>,
}

impl EventSink {
    /// `forward` returns `false` once the receiving side is gone
    pub fn new<F>(connection: ConnectionId, forward: F) -> Self
    where
        F: Fn(ConnectionId, TransportEvent) -> bool + Send + Sync + 'static,
    {
        Self {
            connection,
            forward: Arc::new(forward),
        }
    }

    /// Sink that feeds a plain channel
    pub fn channel(connection: ConnectionId) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self::new(connection, move |_, event| tx.send(event).is_ok());
        (sink, rx)
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn opened(&self) {
        self.emit(TransportEvent::Opened);
    }

    pub fn closed(&self, detail: Option<CloseDetail>) {
        self.emit(TransportEvent::Closed(detail));
    }

    pub fn text(&self, text: impl Into<String>) {
        self.emit(TransportEvent::Text(text.into()));
    }

    fn emit(&self, event: TransportEvent) {
        if !(self.forward)(self.connection, event) {
            tracing::debug!(
                connection = self.connection,
                "event sink closed, dropping transport event"
            );
        }
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

/// One persistent connection.
///
/// `open` may be called again on the same connection to retry; it replaces any
/// attempt still in progress. Implementations must report the outcome of every
/// `open` and `close` through their sink.
pub trait Connection: Send {
    fn open(&mut self);
    fn close(&mut self);
    fn send_text(&mut self, text: String) -> Result<(), TransportError>;
}

/// Factory for connections
pub trait Connector: Send + Sync {
    fn create(&self, request: ConnectRequest, sink: EventSink) -> Box<dyn Connection>;
}
