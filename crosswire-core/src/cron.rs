// ABOUTME: Cron job scheduling: due-job selection, per-job failure isolation, backoff, stuck runs
// ABOUTME: Jobs dispatch through an injected AgentDispatcher; time comes from the injected Clock

use chrono::{TimeZone, Utc};
use cron::Schedule as CronExpression;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::config::CronConfig;
use crate::dispatch::{AgentDispatcher, JobRunOutcome, RunStatus, SystemEvent};
use crate::error::{ErrorKind, RegistryError, RegistryResult};
use crate::events::{GatewayEvent, Observers};
use crate::metrics;
use crate::store::JobStore;

/// Recurrence rule for a job. `Every` is the primary shape; `Cron` is the
/// extensibility variant, evaluated with the same cron machinery the rest of
/// the gateway uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobSchedule {
    /// Fixed interval, optionally aligned to an anchor timestamp
    Every {
        every_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anchor_ms: Option<u64>,
    },
    /// Cron expression evaluated in the given IANA timezone (UTC when absent)
    Cron {
        expr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tz: Option<String>,
    },
}

impl JobSchedule {
    pub fn validate(&self) -> RegistryResult<()> {
        match self {
            JobSchedule::Every { every_ms, .. } => {
                if *every_ms == 0 {
                    return Err(RegistryError::new(
                        ErrorKind::InvalidInput,
                        "schedule interval must be at least 1ms",
                    ));
                }
                Ok(())
            }
            JobSchedule::Cron { expr, tz } => {
                if CronExpression::from_str(&normalize_cron_expr(expr)).is_err() {
                    return Err(RegistryError::new(
                        ErrorKind::InvalidInput,
                        format!("invalid cron expression: {}", expr),
                    ));
                }
                if let Some(tz) = tz {
                    if tz.parse::<chrono_tz::Tz>().is_err() {
                        return Err(RegistryError::new(
                            ErrorKind::InvalidInput,
                            format!("invalid timezone: {}", tz),
                        ));
                    }
                }
                Ok(())
            }
        }
    }

    /// Next fire time strictly after `now_ms`, or None when it cannot be
    /// computed (e.g. a cron expression with no future occurrence).
    pub fn next_after_ms(&self, now_ms: u64) -> Option<u64> {
        match self {
            JobSchedule::Every { every_ms, anchor_ms } => {
                let every = (*every_ms).max(1);
                match anchor_ms {
                    Some(anchor) if *anchor <= now_ms => {
                        let periods = (now_ms - anchor) / every + 1;
                        Some(anchor + periods * every)
                    }
                    Some(anchor) => Some(*anchor),
                    None => Some(now_ms.saturating_add(every)),
                }
            }
            JobSchedule::Cron { expr, tz } => next_cron_fire_ms(expr, tz.as_deref(), now_ms),
        }
    }

    /// Approximate period, used to order same-tick batches so frequent jobs
    /// are not starved behind rare, heavy ones.
    pub fn interval_hint_ms(&self, now_ms: u64) -> u64 {
        match self {
            JobSchedule::Every { every_ms, .. } => (*every_ms).max(1),
            JobSchedule::Cron { expr, tz } => {
                let Some(first) = next_cron_fire_ms(expr, tz.as_deref(), now_ms) else {
                    return u64::MAX;
                };
                let Some(second) = next_cron_fire_ms(expr, tz.as_deref(), first) else {
                    return u64::MAX;
                };
                second.saturating_sub(first).max(1)
            }
        }
    }
}

/// The cron crate expects 6-field expressions (with seconds); accept the
/// common 5-field form by prepending a zero seconds field.
fn normalize_cron_expr(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    }
}

fn next_cron_fire_ms(expr: &str, tz: Option<&str>, after_ms: u64) -> Option<u64> {
    let schedule = CronExpression::from_str(&normalize_cron_expr(expr)).ok()?;
    let tz: chrono_tz::Tz = tz.unwrap_or("UTC").parse().ok()?;
    let after = Utc
        .timestamp_millis_opt(after_ms as i64)
        .single()?
        .with_timezone(&tz);
    schedule
        .after(&after)
        .next()
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis().max(0) as u64)
}

/// Parse interval expressions like "every 5 minutes" or "every 2 hours" into
/// an `Every` schedule.
pub fn parse_interval_expression(input: &str) -> anyhow::Result<JobSchedule> {
    use anyhow::Context;

    let input = input.trim().to_lowercase();
    let re = regex::Regex::new(
        r"^every\s+(\d+)\s+(second|seconds|sec|secs|minute|minutes|min|mins|hour|hours|hr|hrs|day|days)$",
    )
    .context("invalid interval pattern")?;

    let caps = re.captures(&input).with_context(|| {
        format!(
            "could not parse interval expression '{}'. Try: 'every 5 minutes', 'every 2 hours'",
            input
        )
    })?;
    let amount: u64 = caps[1].parse().context("invalid interval value")?;
    if amount == 0 {
        anyhow::bail!("interval must be at least 1");
    }
    let unit_ms: u64 = match &caps[2] {
        "second" | "seconds" | "sec" | "secs" => 1_000,
        "minute" | "minutes" | "min" | "mins" => 60_000,
        "hour" | "hours" | "hr" | "hrs" => 3_600_000,
        "day" | "days" => 86_400_000,
        other => anyhow::bail!("unknown interval unit: {}", other),
    };
    Ok(JobSchedule::Every {
        every_ms: amount.saturating_mul(unit_ms),
        anchor_ms: None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionTarget {
    /// Run in the shared main agent session
    Main,
    /// Spawn a dedicated, throwaway agent session for this run
    Isolated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    /// Enqueue a lightweight event for the main session
    SystemEvent { text: String },
    /// Run a full agent turn with the given message
    AgentTurn {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Announce results to the configured channel/recipient
    Announce,
    /// Run silently
    None,
}

/// Where and how an isolated run's results are announced. Decoupled from the
/// session target; main-session jobs never carry one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDelivery {
    pub mode: DeliveryMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default)]
    pub best_effort: bool,
}

/// Mutable run bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRunState {
    /// Absent exactly when the job is disabled or has no computed due time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at_ms: Option<u64>,
    /// Set while executing; cleared on completion or detected staleness
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub consecutive_errors: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub schedule: JobSchedule,
    pub session_target: SessionTarget,
    pub payload: JobPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<JobDelivery>,
    #[serde(default)]
    pub state: JobRunState,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl JobRecord {
    /// The job's own execution timeout, if its payload carries one.
    pub fn payload_timeout_ms(&self) -> Option<u64> {
        match &self.payload {
            JobPayload::AgentTurn { timeout_ms, .. } => *timeout_ms,
            JobPayload::SystemEvent { .. } => None,
        }
    }
}

/// Parameters for creating a job
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub schedule: JobSchedule,
    pub session_target: SessionTarget,
    pub payload: JobPayload,
    pub delivery: Option<JobDelivery>,
    pub enabled: bool,
}

/// Partial update to a job definition.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobPatch {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub schedule: Option<JobSchedule>,
    pub session_target: Option<SessionTarget>,
    pub payload: Option<JobPayloadPatch>,
    pub delivery: Option<JobDelivery>,
}

/// Payload patch, accepting the legacy shape where delivery fields lived
/// nested inside the payload (`deliver`, `channel`, `to`,
/// `best_effort_deliver`). Those map onto the job's top-level delivery.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobPayloadPatch {
    pub text: Option<String>,
    pub message: Option<String>,
    pub timeout_ms: Option<u64>,
    pub deliver: Option<bool>,
    pub channel: Option<String>,
    pub to: Option<String>,
    pub best_effort_deliver: Option<bool>,
}

struct CronState {
    jobs: HashMap<String, JobRecord>,
}

/// Sole mutator of job state. Owns the in-memory job table; the store is a
/// write-through shadow.
pub struct CronService {
    state: Mutex<CronState>,
    store: Arc<dyn JobStore>,
    dispatcher: Arc<dyn AgentDispatcher>,
    clock: Arc<dyn Clock>,
    observers: Arc<Observers>,
    config: CronConfig,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl CronService {
    pub async fn load(
        store: Arc<dyn JobStore>,
        dispatcher: Arc<dyn AgentDispatcher>,
        clock: Arc<dyn Clock>,
        observers: Arc<Observers>,
        config: CronConfig,
    ) -> Self {
        let jobs = store.load().await;
        tracing::info!(count = jobs.len(), "Cron job table loaded");
        metrics::set_scheduled_jobs(jobs.len() as u64);
        Self {
            state: Mutex::new(CronState { jobs }),
            store,
            dispatcher,
            clock,
            observers,
            config,
            ticker: Mutex::new(None),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CronState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn persist(&self, snapshot: &HashMap<String, JobRecord>) {
        if let Err(e) = self.store.save(snapshot).await {
            tracing::warn!(
                error = %e,
                "Failed to persist cron jobs; in-memory state remains authoritative"
            );
        }
    }

    pub async fn create_job(&self, new: NewJob) -> RegistryResult<JobRecord> {
        if new.name.trim().is_empty() {
            return Err(RegistryError::new(
                ErrorKind::InvalidInput,
                "job name is required",
            ));
        }
        new.schedule.validate()?;

        let now = self.clock.now_ms();
        let (record, snapshot) = {
            let mut state = self.lock_state();
            let record = JobRecord {
                id: format!("job_{}", uuid::Uuid::new_v4().simple()),
                name: new.name,
                enabled: new.enabled,
                // Delivery routing only makes sense for isolated runs
                delivery: match new.session_target {
                    SessionTarget::Main => None,
                    SessionTarget::Isolated => new.delivery,
                },
                session_target: new.session_target,
                payload: new.payload,
                state: JobRunState {
                    next_run_at_ms: if new.enabled {
                        new.schedule.next_after_ms(now)
                    } else {
                        None
                    },
                    ..JobRunState::default()
                },
                schedule: new.schedule,
                created_at_ms: now,
                updated_at_ms: now,
            };
            state.jobs.insert(record.id.clone(), record.clone());
            metrics::set_scheduled_jobs(state.jobs.len() as u64);
            (record, state.jobs.clone())
        };

        self.persist(&snapshot).await;
        tracing::info!(
            job_id = %record.id,
            name = %record.name,
            enabled = record.enabled,
            next_run_at_ms = ?record.state.next_run_at_ms,
            "Cron job created"
        );
        Ok(record)
    }

    pub async fn delete_job(&self, job_id: &str) -> RegistryResult<()> {
        let snapshot = {
            let mut state = self.lock_state();
            if state.jobs.remove(job_id).is_none() {
                return Err(RegistryError::new(
                    ErrorKind::NotFound,
                    format!("unknown job: {}", job_id),
                ));
            }
            metrics::set_scheduled_jobs(state.jobs.len() as u64);
            state.jobs.clone()
        };
        self.persist(&snapshot).await;
        tracing::info!(job_id = %job_id, "Cron job deleted");
        Ok(())
    }

    pub async fn set_enabled(&self, job_id: &str, enabled: bool) -> RegistryResult<JobRecord> {
        self.apply_job_patch(
            job_id,
            JobPatch {
                enabled: Some(enabled),
                ..JobPatch::default()
            },
        )
        .await
    }

    pub fn get_job(&self, job_id: &str) -> Option<JobRecord> {
        self.lock_state().jobs.get(job_id).cloned()
    }

    /// All jobs, soonest due first, jobs with no computed time last.
    pub fn list_jobs(&self) -> Vec<JobRecord> {
        let state = self.lock_state();
        let mut jobs: Vec<JobRecord> = state.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| {
            match (a.state.next_run_at_ms, b.state.next_run_at_ms) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
            .then_with(|| a.name.cmp(&b.name))
        });
        jobs
    }

    /// Mutate a job definition. Switching the session target to `Main`
    /// clears any delivery configuration; legacy patches that nest delivery
    /// fields inside the payload are mapped onto the top-level delivery.
    pub async fn apply_job_patch(&self, job_id: &str, patch: JobPatch) -> RegistryResult<JobRecord> {
        if let Some(schedule) = &patch.schedule {
            schedule.validate()?;
        }
        let now = self.clock.now_ms();
        let (record, snapshot) = {
            let mut state = self.lock_state();
            let job = state.jobs.get_mut(job_id).ok_or_else(|| {
                RegistryError::new(ErrorKind::NotFound, format!("unknown job: {}", job_id))
            })?;

            if let Some(name) = patch.name {
                job.name = name;
            }
            if let Some(enabled) = patch.enabled {
                job.enabled = enabled;
                if !enabled {
                    job.state.next_run_at_ms = None;
                }
            }
            if let Some(schedule) = patch.schedule {
                // An explicit schedule change resets the computed time; the
                // next recompute fills it from the new rule.
                job.schedule = schedule;
                job.state.next_run_at_ms = None;
            }
            if let Some(payload_patch) = patch.payload {
                apply_payload_patch(job, &payload_patch);
            }
            if let Some(delivery) = patch.delivery {
                job.delivery = Some(delivery);
            }
            if let Some(target) = patch.session_target {
                job.session_target = target;
            }
            if job.session_target == SessionTarget::Main {
                job.delivery = None;
            }
            job.updated_at_ms = now;
            (job.clone(), state.jobs.clone())
        };

        self.persist(&snapshot).await;
        tracing::info!(job_id = %record.id, name = %record.name, "Cron job patched");
        Ok(record)
    }

    /// Fill in missing next-run times and clear stuck runs. Never moves an
    /// existing `next_run_at_ms` — an overdue job stays overdue until it
    /// actually executes, so catch-up runs survive a gateway restart.
    pub async fn recompute_next_runs(&self) {
        let now = self.clock.now_ms();
        let snapshot = {
            let mut state = self.lock_state();
            let mut changed = false;
            for job in state.jobs.values_mut() {
                if let Some(running_at) = job.state.running_at_ms {
                    let threshold = stuck_threshold_ms(&self.config, job);
                    if now.saturating_sub(running_at) > threshold {
                        tracing::warn!(
                            job_id = %job.id,
                            name = %job.name,
                            running_for_ms = now.saturating_sub(running_at),
                            threshold_ms = threshold,
                            "Clearing stuck job run"
                        );
                        job.state.running_at_ms = None;
                        changed = true;
                    }
                }
                if !job.enabled {
                    if job.state.next_run_at_ms.is_some() {
                        job.state.next_run_at_ms = None;
                        changed = true;
                    }
                    continue;
                }
                if job.state.next_run_at_ms.is_none() {
                    job.state.next_run_at_ms = job.schedule.next_after_ms(now);
                    changed = true;
                }
            }
            if !changed {
                return;
            }
            state.jobs.clone()
        };
        self.persist(&snapshot).await;
    }

    /// Execute every due job, shortest-interval first, isolating failures so
    /// one bad job never blocks the rest of the batch. Returns the number of
    /// jobs executed.
    pub async fn run_due_jobs(&self) -> usize {
        let now = self.clock.now_ms();
        let mut due: Vec<(String, u64)> = {
            let state = self.lock_state();
            state
                .jobs
                .values()
                .filter(|j| j.enabled && j.state.running_at_ms.is_none())
                .filter(|j| j.state.next_run_at_ms.is_some_and(|t| t <= now))
                .map(|j| (j.id.clone(), j.schedule.interval_hint_ms(now)))
                .collect()
        };
        if due.is_empty() {
            return 0;
        }
        // Frequent jobs first so heartbeats are not starved behind heavy work
        due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let count = due.len();
        tracing::debug!(count, "Executing due jobs");
        for (job_id, _) in due {
            if let Err(e) = self.execute_job(&job_id, false).await {
                // Execution failures are recorded on the job itself; this
                // fires only for state conflicts such as deletion mid-batch
                tracing::warn!(job_id = %job_id, error = %e, "Skipping due job");
            }
        }
        count
    }

    /// Run a single job now. `forced` runs even a disabled job (manual
    /// trigger); the running-flag guard still applies so executions of the
    /// same job never overlap.
    pub async fn execute_job(&self, job_id: &str, forced: bool) -> RegistryResult<JobRunOutcome> {
        let started_at = self.clock.now_ms();
        let (job, snapshot) = {
            let mut state = self.lock_state();
            let job = state.jobs.get_mut(job_id).ok_or_else(|| {
                RegistryError::new(ErrorKind::NotFound, format!("unknown job: {}", job_id))
            })?;
            if job.state.running_at_ms.is_some() {
                return Err(RegistryError::new(
                    ErrorKind::Conflict,
                    format!("job {} is already running", job_id),
                ));
            }
            if !forced && !job.enabled {
                return Err(RegistryError::new(
                    ErrorKind::Conflict,
                    format!("job {} is disabled", job_id),
                ));
            }
            job.state.running_at_ms = Some(started_at);
            (job.clone(), state.jobs.clone())
        };
        self.persist(&snapshot).await;
        self.observers.emit(&GatewayEvent::JobStarted {
            job_id: job.id.clone(),
            name: job.name.clone(),
        });
        tracing::info!(job_id = %job.id, name = %job.name, forced, "Executing job");

        // The dispatcher contract is infallible: its own failures come back
        // as an error outcome, so nothing can escape past this point and
        // leave the running flag set.
        let outcome = self.dispatch(&job).await;

        let finished_at = self.clock.now_ms();
        let snapshot = {
            let mut state = self.lock_state();
            // The job may have been deleted while its work ran
            let Some(job) = state.jobs.get_mut(job_id) else {
                return Ok(outcome);
            };
            job.state.running_at_ms = None;
            job.state.last_run_at_ms = Some(finished_at);
            match outcome.status {
                RunStatus::Ok => {
                    job.state.consecutive_errors = 0;
                    job.state.last_status = Some(RunStatus::Ok);
                    job.state.last_error = None;
                    job.state.next_run_at_ms = job.schedule.next_after_ms(finished_at);
                }
                RunStatus::Error => {
                    job.state.consecutive_errors += 1;
                    job.state.last_status = Some(RunStatus::Error);
                    job.state.last_error = outcome.error.clone();
                    job.state.next_run_at_ms = Some(backoff_next_run_ms(
                        &job.schedule,
                        finished_at,
                        job.state.consecutive_errors,
                        self.config.backoff_max_exponent,
                    ));
                }
            }
            state.jobs.clone()
        };
        self.persist(&snapshot).await;

        metrics::record_job_duration((finished_at.saturating_sub(started_at)) as f64 / 1_000.0);
        match outcome.status {
            RunStatus::Ok => {
                metrics::record_job_executed("ok");
                self.observers.emit(&GatewayEvent::JobCompleted {
                    job_id: job.id.clone(),
                    name: job.name.clone(),
                });
                tracing::info!(job_id = %job.id, name = %job.name, "Job execution succeeded");
            }
            RunStatus::Error => {
                metrics::record_job_executed("error");
                let error = outcome.error.clone().unwrap_or_else(|| "unknown".to_string());
                self.observers.emit(&GatewayEvent::JobFailed {
                    job_id: job.id.clone(),
                    name: job.name.clone(),
                    error: error.clone(),
                });
                tracing::error!(job_id = %job.id, name = %job.name, error = %error, "Job execution failed");
            }
        }
        Ok(outcome)
    }

    async fn dispatch(&self, job: &JobRecord) -> JobRunOutcome {
        match (&job.payload, job.session_target) {
            (JobPayload::SystemEvent { text }, _) => {
                let event = SystemEvent {
                    text: text.clone(),
                    job_id: Some(job.id.clone()),
                    created_at_ms: self.clock.now_ms(),
                };
                match self.dispatcher.enqueue_system_event(event).await {
                    Ok(()) => {
                        self.dispatcher.request_heartbeat_now();
                        JobRunOutcome::ok("system event enqueued")
                    }
                    Err(e) => JobRunOutcome::error(e.to_string()),
                }
            }
            (JobPayload::AgentTurn { message, timeout_ms }, SessionTarget::Isolated) => {
                self.dispatcher
                    .run_isolated_job(job, message, *timeout_ms)
                    .await
            }
            (JobPayload::AgentTurn { message, .. }, SessionTarget::Main) => {
                self.dispatcher.run_main_turn(job, message).await
            }
        }
    }

    /// Start the recurring tick: recompute next runs, then execute due jobs.
    /// Idempotent; a second start is a no-op while the first is running.
    pub fn start(self: Arc<Self>) {
        let mut guard = self
            .ticker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.is_some() {
            tracing::debug!("Cron loop already running");
            return;
        }
        let service = Arc::clone(&self);
        let interval_ms = self.config.tick_interval_ms.max(1);
        tracing::info!(interval_ms, "Starting cron loop");
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                service.recompute_next_runs().await;
                service.run_due_jobs().await;
            }
        }));
    }

    /// Stop the tick loop. Idempotent.
    pub fn stop(&self) {
        let mut guard = self
            .ticker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = guard.take() {
            handle.abort();
            tracing::info!("Cron loop stopped");
        }
    }
}

impl Drop for CronService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn apply_payload_patch(job: &mut JobRecord, patch: &JobPayloadPatch) {
    match &mut job.payload {
        JobPayload::SystemEvent { text } => {
            if let Some(t) = &patch.text {
                *text = t.clone();
            }
        }
        JobPayload::AgentTurn { message, timeout_ms } => {
            if let Some(m) = &patch.message {
                *message = m.clone();
            }
            if let Some(t) = patch.timeout_ms {
                *timeout_ms = Some(t);
            }
        }
    }

    // Legacy shape: delivery settings nested inside the payload. A non-empty
    // recipient means announce; an explicit deliver=false with no recipient
    // means run silently.
    let has_to = patch.to.as_deref().is_some_and(|t| !t.is_empty());
    if has_to {
        job.delivery = Some(JobDelivery {
            mode: DeliveryMode::Announce,
            channel: patch
                .channel
                .clone()
                .or_else(|| job.delivery.as_ref().and_then(|d| d.channel.clone())),
            to: patch.to.clone(),
            best_effort: patch
                .best_effort_deliver
                .unwrap_or_else(|| job.delivery.as_ref().map(|d| d.best_effort).unwrap_or(false)),
        });
    } else if patch.deliver == Some(false) {
        job.delivery = Some(JobDelivery {
            mode: DeliveryMode::None,
            channel: patch.channel.clone(),
            to: None,
            best_effort: patch.best_effort_deliver.unwrap_or(false),
        });
    } else if patch.deliver.is_some()
        || patch.channel.is_some()
        || patch.best_effort_deliver.is_some()
    {
        let mut delivery = job.delivery.clone().unwrap_or(JobDelivery {
            mode: DeliveryMode::Announce,
            channel: None,
            to: None,
            best_effort: false,
        });
        if let Some(channel) = &patch.channel {
            delivery.channel = Some(channel.clone());
        }
        if let Some(best_effort) = patch.best_effort_deliver {
            delivery.best_effort = best_effort;
        }
        job.delivery = Some(delivery);
    }
}

/// Threshold after which a run marked `running_at_ms` is treated as
/// abandoned: a fixed floor, or twice the job's own timeout when that is
/// longer.
fn stuck_threshold_ms(config: &CronConfig, job: &JobRecord) -> u64 {
    let own = job.payload_timeout_ms().unwrap_or(0).saturating_mul(2);
    config.default_stuck_run_ms.max(own)
}

/// Next run time after a failed execution. A single failure reschedules at
/// the plain interval; from the second consecutive failure on, the delay
/// doubles per failure up to the configured exponent cap.
fn backoff_next_run_ms(
    schedule: &JobSchedule,
    now: u64,
    consecutive_errors: u32,
    max_exponent: u32,
) -> u64 {
    let base = schedule.next_after_ms(now).unwrap_or(now);
    if consecutive_errors < 2 {
        return base;
    }
    let every = schedule.interval_hint_ms(now);
    let exponent = (consecutive_errors - 1).min(max_exponent);
    let delay = every.saturating_mul(1u64 << exponent);
    base.max(now.saturating_add(delay))
}
