//! mercury-core: Supervised persistent event connection
//!
//! This crate provides:
//! - A connection supervisor that connects, reconnects with backoff and
//!   escalates to device re-registration when the session is invalidated
//! - Per-frame acknowledgments and batched delivery of call events
//! - A WebSocket transport built on tokio-tungstenite
//! - TOML configuration

pub mod ack;
pub mod auth;
pub mod backoff;
pub mod batcher;
pub mod config;
pub mod dispatch;
pub mod protocol;
pub mod state;
pub mod supervisor;
pub mod timeout;
pub mod transport;
pub mod ws;

pub use auth::{AccessTokenProvider, StaticTokenProvider};
pub use backoff::{BackoffConfig, BackoffCounter};
pub use config::Config;
pub use dispatch::{DeviceReregistrationStrategy, EventDispatcher};
pub use protocol::{
    CallEvent, CallInfo, ClientMessage, CloseDetail, InboundFrame, NORMAL_CLOSURE_CODE,
};
pub use state::ConnectionState;
pub use supervisor::{ConnectionSupervisor, SupervisorConfig, SupervisorHandle};
pub use transport::{
    ConnectRequest, Connection, ConnectionId, Connector, EventSink, TransportError,
    TransportEvent,
};
pub use ws::WsConnector;
