// ABOUTME: Subprocess-backed agent dispatcher plus the in-process system event queue
// ABOUTME: Isolated turns spawn the configured agent command with a hard timeout

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Notify;

use crate::config::RunnerConfig;
use crosswire_core::clock::{Clock, SystemClock};
use crosswire_core::cron::JobRecord;
use crosswire_core::dispatch::{AgentDispatcher, JobRunOutcome, SystemEvent};

/// Events retained for the /events inspection endpoint
const EVENT_BACKLOG: usize = 256;
const SUMMARY_MAX_CHARS: usize = 400;

/// Agent dispatcher for the gateway binary. Isolated turns run the
/// configured command as a throwaway subprocess; main-session turns and
/// system events land on an in-process queue the main session drains.
pub struct ProcessAgentRunner {
    config: RunnerConfig,
    events: Mutex<VecDeque<SystemEvent>>,
    heartbeat: Notify,
}

impl ProcessAgentRunner {
    pub fn new(config: RunnerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            events: Mutex::new(VecDeque::new()),
            heartbeat: Notify::new(),
        })
    }

    /// Recent system events, oldest first.
    pub fn recent_events(&self) -> Vec<SystemEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Resolves on the next heartbeat nudge.
    pub async fn heartbeat_signalled(&self) {
        self.heartbeat.notified().await;
    }

    async fn run_command(&self, message: &str, timeout_ms: Option<u64>) -> Result<String> {
        let Some(command) = &self.config.command else {
            anyhow::bail!("no agent runner command configured");
        };

        let mut child = Command::new(command)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn agent command '{}'", command))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(message.as_bytes())
                .await
                .context("Failed to write job message to agent stdin")?;
            stdin
                .shutdown()
                .await
                .context("Failed to close agent stdin")?;
        }

        let timeout =
            Duration::from_millis(timeout_ms.unwrap_or(self.config.timeout_secs * 1_000));
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow::anyhow!("agent run timed out after {}ms", timeout.as_millis()))?
            .context("Failed to collect agent output")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "agent command exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn summarize(text: &str) -> String {
    if text.chars().count() > SUMMARY_MAX_CHARS {
        let truncated: String = text.chars().take(SUMMARY_MAX_CHARS).collect();
        format!("{}...", truncated)
    } else {
        text.to_string()
    }
}

#[async_trait]
impl AgentDispatcher for ProcessAgentRunner {
    async fn enqueue_system_event(&self, event: SystemEvent) -> Result<()> {
        let mut events = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if events.len() >= EVENT_BACKLOG {
            events.pop_front();
        }
        tracing::debug!(text = %event.text, job_id = ?event.job_id, "System event enqueued");
        events.push_back(event);
        Ok(())
    }

    fn request_heartbeat_now(&self) {
        self.heartbeat.notify_one();
    }

    async fn run_isolated_job(
        &self,
        job: &JobRecord,
        message: &str,
        timeout_ms: Option<u64>,
    ) -> JobRunOutcome {
        tracing::info!(job_id = %job.id, name = %job.name, "Running isolated agent turn");
        match self.run_command(message, timeout_ms).await {
            Ok(stdout) if stdout.is_empty() => {
                JobRunOutcome::error("agent returned an empty response")
            }
            Ok(stdout) => JobRunOutcome::ok(summarize(&stdout)),
            Err(e) => JobRunOutcome::error(e.to_string()),
        }
    }

    async fn run_main_turn(&self, job: &JobRecord, message: &str) -> JobRunOutcome {
        // The shared main session consumes its prompts from the event queue
        let event = SystemEvent {
            text: message.to_string(),
            job_id: Some(job.id.clone()),
            created_at_ms: SystemClock.now_ms(),
        };
        match self.enqueue_system_event(event).await {
            Ok(()) => {
                self.request_heartbeat_now();
                JobRunOutcome::ok("queued for main session")
            }
            Err(e) => JobRunOutcome::error(e.to_string()),
        }
    }
}
