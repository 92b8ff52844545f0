// ABOUTME: Injected collaborator seams: agent execution, system events, heartbeat nudges
// ABOUTME: The scheduler core dispatches work through these traits and never touches a model

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cron::JobRecord;

/// Result classification for one injected agent execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Error,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Ok => write!(f, "ok"),
            RunStatus::Error => write!(f, "error"),
        }
    }
}

/// Outcome of one agent-turn or system-event dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRunOutcome {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobRunOutcome {
    pub fn ok(summary: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Ok,
            summary: Some(summary.into()),
            error: None,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Error,
            summary: None,
            error: Some(error.into()),
        }
    }
}

/// A lightweight event handed to the main agent session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemEvent {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub created_at_ms: u64,
}

/// Execution surface the gateway injects into the scheduler core.
///
/// `run_isolated_job` and `run_main_turn` are infallible by contract: the
/// implementation converts its own failures into an error outcome so the
/// scheduler loop never sees an escaped exception.
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    /// Enqueue a lightweight event onto the main agent session.
    async fn enqueue_system_event(&self, event: SystemEvent) -> anyhow::Result<()>;

    /// Nudge the liveness mechanism so queued events are picked up promptly.
    fn request_heartbeat_now(&self);

    /// Run one isolated agent turn for the given job.
    async fn run_isolated_job(
        &self,
        job: &JobRecord,
        message: &str,
        timeout_ms: Option<u64>,
    ) -> JobRunOutcome;

    /// Run an agent turn inside the shared main session.
    async fn run_main_turn(&self, job: &JobRecord, message: &str) -> JobRunOutcome;
}
