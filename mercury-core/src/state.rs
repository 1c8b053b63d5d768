//! Connection lifecycle states

use std::fmt;

/// Where the supervised connection is in its lifecycle.
///
/// `Connecting` always has the connect timeout armed; `Open` always has the
/// batch timer running and no connect timeout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Nothing attempted, explicitly disconnected, or waiting out a backoff delay
    #[default]
    Idle,
    /// Open requested, waiting for the handshake
    Connecting,
    /// Handshake complete, frames flowing
    Open,
    /// Explicit close issued, waiting for the transport to confirm
    Closing,
}

impl ConnectionState {
    pub fn is_open(self) -> bool {
        matches!(self, ConnectionState::Open)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}
