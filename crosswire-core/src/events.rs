// ABOUTME: Observer-list event fan-out for request and job lifecycle notifications
// ABOUTME: A failing listener is logged and never blocks delivery to the others

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Lifecycle notifications emitted by the registry and scheduler.
///
/// Channel adapters and status tooling subscribe to these; the core never
/// calls a channel directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    RequestCreated {
        request_id: String,
        child_session_key: String,
        parent_session_key: String,
    },
    RequestResolved {
        request_id: String,
        resolved_by_session_key: String,
    },
    RequestTimedOut {
        request_id: String,
    },
    RequestCancelled {
        request_id: String,
    },
    RequestOrphaned {
        request_id: String,
    },
    JobStarted {
        job_id: String,
        name: String,
    },
    JobCompleted {
        job_id: String,
        name: String,
    },
    JobFailed {
        job_id: String,
        name: String,
        error: String,
    },
}

impl GatewayEvent {
    /// Get the event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RequestCreated { .. } => "request_created",
            Self::RequestResolved { .. } => "request_resolved",
            Self::RequestTimedOut { .. } => "request_timed_out",
            Self::RequestCancelled { .. } => "request_cancelled",
            Self::RequestOrphaned { .. } => "request_orphaned",
            Self::JobStarted { .. } => "job_started",
            Self::JobCompleted { .. } => "job_completed",
            Self::JobFailed { .. } => "job_failed",
        }
    }
}

type Listener = Box<dyn Fn(&GatewayEvent) -> anyhow::Result<()> + Send + Sync>;

/// Explicit observer list: register/unregister callbacks, synchronous fan-out.
#[derive(Default)]
pub struct Observers {
    listeners: Mutex<HashMap<u64, Listener>>,
    next_id: AtomicU64,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; returns a token for unregister.
    pub fn register<F>(&self, listener: F) -> u64
    where
        F: Fn(&GatewayEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        listeners.insert(id, Box::new(listener));
        id
    }

    pub fn unregister(&self, id: u64) -> bool {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        listeners.remove(&id).is_some()
    }

    /// Fan the event out to every listener. A listener returning an error is
    /// logged; the remaining listeners still receive the event.
    pub fn emit(&self, event: &GatewayEvent) {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (id, listener) in listeners.iter() {
            if let Err(e) = listener(event) {
                tracing::warn!(
                    listener_id = id,
                    event = event.event_type(),
                    error = %e,
                    "Event listener failed"
                );
            }
        }
    }
}
