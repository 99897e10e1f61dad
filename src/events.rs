//! Kubernetes Event recording for topology reconciliation.
//!
//! Events are **fire-and-forget**: `emit` never blocks the reconcile pass and
//! never returns an error. A failed event must never break reconciliation.

use std::sync::Arc;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use parking_lot::Mutex;
use tracing::warn;

use crate::document::Document;

/// Sink for status events about reconciled objects
pub trait EventSink: Send + Sync {
    /// Record an event on `object`; best-effort and non-blocking
    fn emit(&self, object: &Document, type_: EventType, reason: &str, message: String);
}

/// Production sink wrapping `kube::runtime::events::Recorder`.
///
/// Each event is published on its own task so the caller never waits on the
/// API server.
pub struct KubeEventSink {
    recorder: Arc<Recorder>,
}

impl KubeEventSink {
    /// Create a sink reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        Self {
            recorder: Arc::new(Recorder::new(client, reporter(controller_name))),
        }
    }
}

fn reporter(controller_name: &str) -> Reporter {
    Reporter {
        controller: controller_name.to_string(),
        instance: None,
    }
}

impl EventSink for KubeEventSink {
    fn emit(&self, object: &Document, type_: EventType, reason: &str, message: String) {
        let recorder = Arc::clone(&self.recorder);
        let reference = object.object_reference();
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(message),
            action: actions::RECONCILE.to_string(),
            secondary: None,
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(reason, "no runtime available, dropping event");
            return;
        };
        handle.spawn(async move {
            if let Err(e) = recorder.publish(&event, &reference).await {
                warn!(
                    reason = %event.reason,
                    object = ?reference.name,
                    error = %e,
                    "Failed to publish Kubernetes event"
                );
            }
        });
    }
}

/// Sink discarding every event
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _object: &Document, _type_: EventType, _reason: &str, _message: String) {}
}

/// An event captured by [`RecordingEventSink`]
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    /// Reference to the object the event is about
    pub object: ObjectReference,
    /// Normal or Warning
    pub type_: EventType,
    /// Machine-readable reason
    pub reason: String,
    /// Human-readable message
    pub message: String,
}

/// Sink keeping events in memory, for tests and dry runs
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded so far, oldest first
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Reasons of the events recorded so far, oldest first
    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.reason.clone()).collect()
    }

    /// Forget recorded events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, object: &Document, type_: EventType, reason: &str, message: String) {
        self.events.lock().push(RecordedEvent {
            object: object.object_reference(),
            type_,
            reason: reason.to_string(),
            message,
        });
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// An object was created from the topology
    pub const TOPOLOGY_CREATE: &str = "TopologyCreate";
    /// An object was patched toward the topology
    pub const TOPOLOGY_UPDATE: &str = "TopologyUpdate";
    /// An object no longer in the topology was deleted
    pub const TOPOLOGY_DELETE: &str = "TopologyDelete";
    /// A reconcile pass failed
    pub const TOPOLOGY_RECONCILE_FAILED: &str = "TopologyReconcileFailed";
    /// The cluster's class cannot be reconciled as is
    pub const INVALID_BLUEPRINT: &str = "InvalidBlueprint";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
}
