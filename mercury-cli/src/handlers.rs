//! Collaborators wired into the supervisor by the CLI

use std::sync::atomic::{AtomicU64, Ordering};

use mercury_core::{CallEvent, DeviceReregistrationStrategy, EventDispatcher, SupervisorHandle};

/// Prints each call event as one JSON line on stdout
#[derive(Debug, Default)]
pub struct PrintingDispatcher {
    delivered: AtomicU64,
}

impl PrintingDispatcher {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    fn render(event: &CallEvent) -> String {
        serde_json::to_string(event)
            .unwrap_or_else(|_| format!("{{\"eventType\":\"{}\"}}", event.event_type))
    }
}

impl EventDispatcher for PrintingDispatcher {
    fn prepare_for_calls(&self) {
        tracing::info!("ready for call events");
    }

    fn handle(&self, event: CallEvent) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            event_type = %event.event_type,
            url = event.call.url.as_deref().unwrap_or_default(),
            participants = event.call.participants.len(),
            "call event"
        );
        println!("{}", Self::render(&event));
    }
}

/// Rebuilds the session from scratch: the supervisor already dropped the old
/// connection, so a fresh connect fetches a new token and a new socket.
pub struct Reconnector {
    supervisor: SupervisorHandle,
    endpoint: String,
}

impl Reconnector {
    pub fn new(supervisor: SupervisorHandle, endpoint: String) -> Self {
        Self {
            supervisor,
            endpoint,
        }
    }
}

impl DeviceReregistrationStrategy for Reconnector {
    fn reregister_device(&self) {
        tracing::info!(endpoint = %self.endpoint, "re-registering: opening a new session");
        self.supervisor.connect(self.endpoint.clone());
    }
}
