//! Lifecycle notifications for registration, authorization and provisioning.
//!
//! Sinks are purely observational. Callers never inspect a result from a sink
//! and a sink must not block on I/O for long.

use tracing::{error, info, warn};

/// Observer for agent lifecycle events.
///
/// Every method has a no-op default so plugins only override what they need.
pub trait EventSink: Send + Sync {
    fn notify_startup(&self) {}
    fn notify_shutdown(&self) {}

    fn notify_registration_required(&self) {}
    fn notify_registration_in_progress(&self) {}
    fn notify_registration_success(&self) {}
    fn notify_registration_failure(&self, _message: &str) {}
    fn notify_authorization_in_progress(&self) {}

    fn notify_certificate_received(&self, _asset_id: &str) {}
    fn notify_certificate_stored(&self, _asset_id: &str) {}
    fn notify_certificate_failure(&self, _asset_id: &str, _message: &str) {}

    fn notify_private_key_received(&self, _asset_id: &str) {}
    fn notify_private_key_stored(&self, _asset_id: &str) {}
    fn notify_private_key_failure(&self, _asset_id: &str, _message: &str) {}
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {}

/// Sink that turns every event into a structured tracing record.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn notify_startup(&self) {
        info!(event = "startup", "Agent starting");
    }

    fn notify_shutdown(&self) {
        info!(event = "shutdown", "Agent shutting down");
    }

    fn notify_registration_required(&self) {
        info!(event = "registration_required", "Device is not registered");
    }

    fn notify_registration_in_progress(&self) {
        info!(event = "registration_in_progress", "Registering device");
    }

    fn notify_registration_success(&self) {
        info!(event = "registration_success", "Device registered");
    }

    fn notify_registration_failure(&self, message: &str) {
        error!(event = "registration_failure", %message, "Device registration failed");
    }

    fn notify_authorization_in_progress(&self) {
        info!(event = "authorization_in_progress", "Authenticating device");
    }

    fn notify_certificate_received(&self, asset_id: &str) {
        info!(event = "certificate_received", asset_id, "Certificate received");
    }

    fn notify_certificate_stored(&self, asset_id: &str) {
        info!(event = "certificate_stored", asset_id, "Certificate stored");
    }

    fn notify_certificate_failure(&self, asset_id: &str, message: &str) {
        warn!(event = "certificate_failure", asset_id, %message, "Certificate not stored");
    }

    fn notify_private_key_received(&self, asset_id: &str) {
        info!(event = "private_key_received", asset_id, "Private key received");
    }

    fn notify_private_key_stored(&self, asset_id: &str) {
        info!(event = "private_key_stored", asset_id, "Private key stored");
    }

    fn notify_private_key_failure(&self, asset_id: &str, message: &str) {
        warn!(event = "private_key_failure", asset_id, %message, "Private key not stored");
    }
}

/// Sink that records event names, for assertions in tests across the workspace.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: parking_lot::Mutex<Vec<String>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded event names in arrival order.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.as_str() == name).count()
    }

    fn push(&self, name: &str) {
        self.events.lock().push(name.to_string());
    }
}

impl EventSink for RecordingEventSink {
    fn notify_startup(&self) {
        self.push("startup");
    }
    fn notify_shutdown(&self) {
        self.push("shutdown");
    }
    fn notify_registration_required(&self) {
        self.push("registration_required");
    }
    fn notify_registration_in_progress(&self) {
        self.push("registration_in_progress");
    }
    fn notify_registration_success(&self) {
        self.push("registration_success");
    }
    fn notify_registration_failure(&self, _message: &str) {
        self.push("registration_failure");
    }
    fn notify_authorization_in_progress(&self) {
        self.push("authorization_in_progress");
    }
    fn notify_certificate_received(&self, _asset_id: &str) {
        self.push("certificate_received");
    }
    fn notify_certificate_stored(&self, _asset_id: &str) {
        self.push("certificate_stored");
    }
    fn notify_certificate_failure(&self, _asset_id: &str, _message: &str) {
        self.push("certificate_failure");
    }
    fn notify_private_key_received(&self, _asset_id: &str) {
        self.push("private_key_received");
    }
    fn notify_private_key_stored(&self, _asset_id: &str) {
        self.push("private_key_stored");
    }
    fn notify_private_key_failure(&self, _asset_id: &str, _message: &str) {
        self.push("private_key_failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_counts() {
        let sink = RecordingEventSink::new();
        sink.notify_certificate_stored("a-1");
        sink.notify_private_key_failure("a-1", "disk full");
        sink.notify_certificate_stored("a-2");

        assert_eq!(sink.count("certificate_stored"), 2);
        assert_eq!(sink.count("private_key_failure"), 1);
        assert_eq!(sink.events().len(), 3);
    }

    #[test]
    fn test_default_methods_are_noops() {
        let sink = NoopEventSink;
        sink.notify_startup();
        sink.notify_registration_failure("denied");
    }
}
