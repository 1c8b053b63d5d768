//! Per-frame acknowledgments

use crate::protocol::ClientMessage;
use crate::transport::Connection;

/// Writes an ack for each inbound frame back over the connection it came from.
///
/// Failures are logged and counted, never propagated: a lost ack must not stop
/// the frame from being buffered, and it never closes the connection.
#[derive(Debug, Default)]
pub struct AckEmitter {
    sent: u64,
    failed: u64,
}

impl AckEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the ack was handed to the transport
    pub fn acknowledge(&mut self, message_id: &str, connection: &mut dyn Connection) -> bool {
        let ack = ClientMessage::Ack {
            message_id: message_id.to_string(),
        };

        let text = match serde_json::to_string(&ack) {
            Ok(text) => text,
            Err(e) => {
                self.failed += 1;
                tracing::warn!(message_id, error = %e, "failed to serialize ack");
                return false;
            }
        };

        match connection.send_text(text) {
            Ok(()) => {
                self.sent += 1;
                tracing::debug!(message_id, "ack sent");
                true
            }
            Err(e) => {
                self.failed += 1;
                tracing::warn!(message_id, error = %e, "failed to send ack");
                false
            }
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }
}
