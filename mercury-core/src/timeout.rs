//! Single-shot timer bounding how long a connect attempt may take
//!
//! The guard never touches supervisor state itself. When it expires it posts a
//! message into the supervisor queue; the supervisor then asks the guard
//! whether that firing is still the live one via [`ConnectionTimeoutGuard::fire`].

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default upper bound on the `Connecting` state
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Identifies one arming of a timer
pub type ArmId = u64;

#[derive(Debug)]
pub struct ConnectionTimeoutGuard {
    interval: Duration,
    generation: ArmId,
    task: Option<JoinHandle<()>>,
}

impl ConnectionTimeoutGuard {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            generation: 0,
            task: None,
        }
    }

    /// Start the countdown, cancelling any previous arm first.
    ///
    /// `message` builds the queue message for this arm; it is only sent if the
    /// arm is neither cancelled nor replaced before the interval elapses.
    pub fn arm<M, F>(&mut self, notify: &mpsc::UnboundedSender<M>, message: F) -> ArmId
    where
        M: Send + 'static,
        F: FnOnce(ArmId) -> M + Send + 'static,
    {
        self.cancel();
        self.generation += 1;

        let arm = self.generation;
        let interval = self.interval;
        let notify = notify.clone();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            // Receiver gone means the supervisor shut down
            let _ = notify.send(message(arm));
        }));

        tracing::trace!(arm, timeout_ms = interval.as_millis() as u64, "connect timeout armed");
        arm
    }

    /// Disarm. Safe to call when not armed.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.task.is_some()
    }

    /// Accept a firing delivered through the queue.
    ///
    /// Returns `true` exactly once for the live arm and disarms the guard.
    /// Firings from cancelled or replaced arms return `false`.
    pub fn fire(&mut self, arm: ArmId) -> bool {
        if self.task.is_some() && arm == self.generation {
            self.task = None;
            true
        } else {
            false
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Default for ConnectionTimeoutGuard {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl Drop for ConnectionTimeoutGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}
