//! Wire types for the event connection
//!
//! All frames are JSON text. The server pushes frames of the form
//! `{"id": "...", "data": {"eventType": "...", ...}}`; the client answers each
//! one with `{"type": "ack", "messageId": "..."}`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Close code of a clean, intentional WebSocket close (RFC 6455 §7.4.1).
/// Anything above it is treated as the server invalidating the session.
pub const NORMAL_CLOSURE_CODE: u16 = 1000;

/// Close code used when a close frame carries no status
pub const NO_STATUS_CODE: u16 = 1005;

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Acknowledge receipt of an inbound frame
    Ack {
        #[serde(rename = "messageId")]
        message_id: String,
    },
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Frame has an empty id")]
    EmptyId,
}

/// Frame pushed by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundFrame {
    pub id: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl InboundFrame {
    /// Parse a text frame. Only `id` is mandatory; a frame without an
    /// `eventType` is still acknowledged but never dispatched.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let frame: InboundFrame = serde_json::from_str(text)?;
        if frame.id.is_empty() {
            return Err(FrameError::EmptyId);
        }
        Ok(frame)
    }

    /// `data.eventType`, if present
    pub fn event_type(&self) -> Option<&str> {
        self.data.get("eventType").and_then(|v| v.as_str())
    }
}

/// Call-signalling event decoded from a frame's `data`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEvent {
    #[serde(rename = "eventType")]
    pub event_type: String,
    #[serde(default, rename = "locus")]
    pub call: CallInfo,
}

/// Call state carried by a call event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInfo {
    pub url: Option<String>,
    pub full_state: Option<FullState>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(rename = "self")]
    pub self_participant: Option<Participant>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullState {
    pub state: Option<String>,
    pub last_active: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub state: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub person: Option<Person>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: Option<String>,
    pub email: Option<String>,
    pub name: Option<String>,
}

/// Why a connection closed, as reported by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseDetail {
    pub code: u16,
    pub reason: String,
}

impl CloseDetail {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Session-level invalidation rather than a transient drop
    pub fn is_abnormal(&self) -> bool {
        self.code > NORMAL_CLOSURE_CODE
    }
}
