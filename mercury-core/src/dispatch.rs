//! Consumers of supervisor output

use crate::protocol::CallEvent;

/// Receives decoded call events.
///
/// Called on the supervisor task, so implementations should hand heavy work
/// off rather than block.
pub trait EventDispatcher: Send + Sync {
    /// The connection is open and call events may start arriving
    fn prepare_for_calls(&self);

    fn handle(&self, event: CallEvent);
}

/// Higher-level recovery invoked when the server invalidates the session.
///
/// The supervisor only keeps a `Weak` reference; the owner decides how long
/// the strategy lives.
pub trait DeviceReregistrationStrategy: Send + Sync {
    fn reregister_device(&self);
}
