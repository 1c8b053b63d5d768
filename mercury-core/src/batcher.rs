//! Buffering of inbound frames and periodic delivery
//!
//! Frames are buffered as they arrive and handed out in one batch per tick.
//! Only frames whose `eventType` starts with a recognised prefix are decoded
//! into [`CallEvent`]s; everything else is dropped at flush time.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::protocol::{CallEvent, InboundFrame};
use crate::timeout::ArmId;

/// Default flush cadence
pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_millis(500);

/// Event type prefix of call-signalling events
pub const DEFAULT_CALL_PREFIX: &str = "locus.";

/// An acknowledged frame waiting for the next flush
#[derive(Debug, Clone, PartialEq)]
pub struct PendingFrame {
    pub id: String,
    pub event_type: String,
    pub data: serde_json::Value,
}

impl From<InboundFrame> for PendingFrame {
    fn from(frame: InboundFrame) -> Self {
        let event_type = frame.event_type().unwrap_or_default().to_string();
        Self {
            id: frame.id,
            event_type,
            data: frame.data,
        }
    }
}

/// Result of one flush
#[derive(Debug, Default, PartialEq)]
pub struct FlushReport {
    /// Decoded call events, in arrival order
    pub events: Vec<CallEvent>,
    /// Call frames that failed to decode
    pub decode_failures: usize,
    /// Frames outside the recognised prefixes
    pub ignored: usize,
}

#[derive(Debug)]
pub struct MessageBatcher {
    interval: Duration,
    prefixes: Vec<String>,
    pending: Vec<PendingFrame>,
    generation: ArmId,
    ticker: Option<JoinHandle<()>>,
}

impl MessageBatcher {
    pub fn new(interval: Duration, prefixes: Vec<String>) -> Self {
        Self {
            interval,
            prefixes,
            pending: Vec::new(),
            generation: 0,
            ticker: None,
        }
    }

    /// Start the periodic flush driver. Does nothing if already running.
    ///
    /// Every `interval` the driver posts `message(arm)` into `notify`; the
    /// receiver should check [`MessageBatcher::accepts`] before flushing.
    pub fn start<M, F>(&mut self, notify: &mpsc::UnboundedSender<M>, message: F) -> ArmId
    where
        M: Send + 'static,
        F: Fn(ArmId) -> M + Send + 'static,
    {
        if self.ticker.is_some() {
            return self.generation;
        }

        self.generation += 1;
        let arm = self.generation;
        let interval = self.interval;
        let notify = notify.clone();
        self.ticker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if notify.send(message(arm)).is_err() {
                    break;
                }
            }
        }));

        tracing::debug!(arm, interval_ms = interval.as_millis() as u64, "batch timer started");
        arm
    }

    /// Stop the driver. Buffered frames stay buffered.
    pub fn stop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
            tracing::debug!(pending = self.len(), "batch timer stopped");
        }
    }

    /// Whether a tick from `arm` belongs to the running driver
    pub fn accepts(&self, arm: ArmId) -> bool {
        self.ticker.is_some() && arm == self.generation
    }

    pub fn enqueue(&mut self, frame: PendingFrame) {
        self.pending.push(frame);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drain the buffer and decode call events.
    ///
    /// The buffer is empty afterwards whatever happened to individual frames.
    pub fn flush(&mut self) -> FlushReport {
        let frames = std::mem::take(&mut self.pending);
        let mut report = FlushReport::default();

        for frame in frames {
            if !self.is_call_event(&frame.event_type) {
                tracing::trace!(
                    id = %frame.id,
                    event_type = %frame.event_type,
                    "ignoring non-call frame"
                );
                report.ignored += 1;
                continue;
            }

            match serde_json::from_value::<CallEvent>(frame.data) {
                Ok(event) => report.events.push(event),
                Err(e) => {
                    tracing::warn!(
                        id = %frame.id,
                        event_type = %frame.event_type,
                        error = %e,
                        "dropping undecodable call event"
                    );
                    report.decode_failures += 1;
                }
            }
        }

        report
    }

    fn is_call_event(&self, event_type: &str) -> bool {
        self.prefixes
            .iter()
            .any(|prefix| event_type.starts_with(prefix.as_str()))
    }
}

impl Default for MessageBatcher {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_INTERVAL, vec![DEFAULT_CALL_PREFIX.to_string()])
    }
}

impl Drop for MessageBatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
