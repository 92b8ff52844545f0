// ABOUTME: Cross-session orchestration request registry with caps, rate limits, and waiters
// ABOUTME: A child session asks a parent session a question and awaits exactly one terminal answer

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::RequestLimits;
use crate::error::{ErrorKind, RegistryError, RegistryResult};
use crate::events::{GatewayEvent, Observers};
use crate::metrics;
use crate::store::RequestStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestPriority {
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Resolved,
    Timeout,
    Cancelled,
    Orphaned,
}

impl RequestStatus {
    /// Terminal states are final; no record ever leaves one.
    pub fn is_terminal(self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "pending"),
            RequestStatus::Resolved => write!(f, "resolved"),
            RequestStatus::Timeout => write!(f, "timeout"),
            RequestStatus::Cancelled => write!(f, "cancelled"),
            RequestStatus::Orphaned => write!(f, "orphaned"),
        }
    }
}

impl FromStr for RequestStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "resolved" => Ok(RequestStatus::Resolved),
            "timeout" => Ok(RequestStatus::Timeout),
            "cancelled" => Ok(RequestStatus::Cancelled),
            "orphaned" => Ok(RequestStatus::Orphaned),
            _ => anyhow::bail!("Unknown request status: {}", s),
        }
    }
}

/// One cross-session question-and-answer unit between a child session and
/// its parent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: String,
    pub child_session_key: String,
    pub parent_session_key: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default)]
    pub priority: RequestPriority,
    pub status: RequestStatus,
    pub created_at_ms: u64,
    pub timeout_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by_session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Parameters for creating a request
#[derive(Debug, Clone, Default)]
pub struct NewRequest {
    pub child_session_key: String,
    pub parent_session_key: String,
    pub message: String,
    pub context: Option<String>,
    pub priority: Option<RequestPriority>,
    pub timeout_ms: Option<u64>,
}

struct RegistryState {
    requests: HashMap<String, RequestRecord>,
    /// Creation timestamps per child key for the sliding-window rate limit.
    /// Kept apart from the records so retention purges never reopen the window.
    rate_marks: HashMap<String, Vec<u64>>,
    waiters: HashMap<String, Vec<oneshot::Sender<RequestRecord>>>,
}

/// The authoritative live state for orchestration requests. Owned by whatever
/// boots the gateway and passed by Arc to every operation; the store is a
/// write-through shadow updated after each mutation.
pub struct RequestRegistry {
    state: Mutex<RegistryState>,
    store: Arc<dyn RequestStore>,
    clock: Arc<dyn Clock>,
    observers: Arc<Observers>,
    limits: RequestLimits,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RequestRegistry {
    /// Build a registry from whatever the store has persisted.
    pub async fn load(
        store: Arc<dyn RequestStore>,
        clock: Arc<dyn Clock>,
        observers: Arc<Observers>,
        limits: RequestLimits,
    ) -> Self {
        let requests = store.load().await;
        tracing::info!(count = requests.len(), "Request registry loaded");
        Self {
            state: Mutex::new(RegistryState {
                requests,
                rate_marks: HashMap::new(),
                waiters: HashMap::new(),
            }),
            store,
            clock,
            observers,
            limits,
            sweeper: Mutex::new(None),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn persist(&self, snapshot: &HashMap<String, RequestRecord>) {
        if let Err(e) = self.store.save(snapshot).await {
            tracing::warn!(
                error = %e,
                "Failed to persist request registry; in-memory state remains authoritative"
            );
        }
    }

    /// Validate caps and rate limits, then register a new pending request.
    /// Returns the generated request ID.
    pub async fn create_request(&self, new: NewRequest) -> RegistryResult<String> {
        if new.child_session_key.trim().is_empty() || new.parent_session_key.trim().is_empty() {
            return Err(RegistryError::new(
                ErrorKind::InvalidInput,
                "both child and parent session keys are required",
            ));
        }

        let now = self.clock.now_ms();
        let (record, pending_count, snapshot) = {
            let mut state = self.lock_state();
            purge_expired(&mut state, now, &self.limits);

            let child_pending = state
                .requests
                .values()
                .filter(|r| {
                    r.status == RequestStatus::Pending
                        && r.child_session_key == new.child_session_key
                })
                .count();
            if child_pending >= self.limits.max_pending_per_child {
                metrics::record_request_rejected("child_cap");
                return Err(RegistryError::new(
                    ErrorKind::Capacity,
                    format!(
                        "too many pending requests for child session '{}' (max {})",
                        new.child_session_key, self.limits.max_pending_per_child
                    ),
                ));
            }

            let parent_pending = state
                .requests
                .values()
                .filter(|r| {
                    r.status == RequestStatus::Pending
                        && r.parent_session_key == new.parent_session_key
                })
                .count();
            if parent_pending >= self.limits.max_pending_per_parent {
                metrics::record_request_rejected("parent_cap");
                return Err(RegistryError::new(
                    ErrorKind::Capacity,
                    format!(
                        "too many pending requests for parent session '{}' (max {})",
                        new.parent_session_key, self.limits.max_pending_per_parent
                    ),
                ));
            }

            // Creations count against the window regardless of how those
            // requests ended up.
            let window_start = now.saturating_sub(self.limits.rate_limit_window_ms);
            let marks = state
                .rate_marks
                .entry(new.child_session_key.clone())
                .or_default();
            marks.retain(|&t| t > window_start);
            if marks.len() >= self.limits.rate_limit_max {
                metrics::record_request_rejected("rate_limit");
                return Err(RegistryError::new(
                    ErrorKind::RateLimit,
                    format!(
                        "rate limit exceeded for child session '{}': max {} requests per {}s window",
                        new.child_session_key,
                        self.limits.rate_limit_max,
                        self.limits.rate_limit_window_ms / 1_000
                    ),
                ));
            }
            marks.push(now);

            let request_id = format!("req_{}", uuid::Uuid::new_v4().simple());
            let timeout_ms = new.timeout_ms.unwrap_or(self.limits.default_timeout_ms);
            let record = RequestRecord {
                request_id: request_id.clone(),
                child_session_key: new.child_session_key,
                parent_session_key: new.parent_session_key,
                message: new.message,
                context: new.context,
                priority: new.priority.unwrap_or_default(),
                status: RequestStatus::Pending,
                created_at_ms: now,
                timeout_at_ms: now.saturating_add(timeout_ms),
                response: None,
                resolved_by_session_key: None,
                resolved_at_ms: None,
                error: None,
            };
            state.requests.insert(request_id, record.clone());
            let pending = count_pending(&state);
            (record, pending, state.requests.clone())
        };

        self.persist(&snapshot).await;
        metrics::record_request_created();
        metrics::set_pending_requests(pending_count);
        self.observers.emit(&GatewayEvent::RequestCreated {
            request_id: record.request_id.clone(),
            child_session_key: record.child_session_key.clone(),
            parent_session_key: record.parent_session_key.clone(),
        });
        tracing::info!(
            request_id = %record.request_id,
            child = %record.child_session_key,
            parent = %record.parent_session_key,
            timeout_at_ms = record.timeout_at_ms,
            "Orchestration request created"
        );
        Ok(record.request_id)
    }

    /// Apply the one allowed terminal transition to `resolved`. Fails if the
    /// record is unknown or already terminal (the race was lost to the
    /// sweeper or another resolver).
    pub async fn resolve_request(
        &self,
        request_id: &str,
        response: &str,
        resolved_by_session_key: &str,
    ) -> RegistryResult<RequestRecord> {
        let now = self.clock.now_ms();
        let (record, waiters, pending_count, snapshot) = {
            let mut state = self.lock_state();
            let record = state.requests.get_mut(request_id).ok_or_else(|| {
                RegistryError::new(
                    ErrorKind::NotFound,
                    format!("unknown request: {}", request_id),
                )
            })?;
            if record.status != RequestStatus::Pending {
                return Err(RegistryError::new(
                    ErrorKind::Conflict,
                    format!("request {} is already {}", request_id, record.status),
                ));
            }
            record.status = RequestStatus::Resolved;
            record.response = Some(response.to_string());
            record.resolved_by_session_key = Some(resolved_by_session_key.to_string());
            record.resolved_at_ms = Some(now);
            let record = record.clone();
            let waiters = state.waiters.remove(request_id).unwrap_or_default();
            let pending = count_pending(&state);
            (record, waiters, pending, state.requests.clone())
        };

        for waiter in waiters {
            let _ = waiter.send(record.clone());
        }
        self.persist(&snapshot).await;
        metrics::record_request_finished("resolved");
        metrics::set_pending_requests(pending_count);
        self.observers.emit(&GatewayEvent::RequestResolved {
            request_id: record.request_id.clone(),
            resolved_by_session_key: resolved_by_session_key.to_string(),
        });
        tracing::info!(
            request_id = %record.request_id,
            resolved_by = %resolved_by_session_key,
            "Orchestration request resolved"
        );
        Ok(record)
    }

    /// Bulk-cancel every pending request a child session created. Used when
    /// the child session ends.
    pub async fn cancel_requests_for_child(&self, child_session_key: &str) -> usize {
        let key = child_session_key.to_string();
        self.finish_matching(
            move |r| r.child_session_key == key,
            RequestStatus::Cancelled,
            "cancelled because the child session ended",
        )
        .await
    }

    /// Bulk-orphan every pending request a parent session owed answers for.
    /// Used when the parent session disappears.
    pub async fn orphan_requests_for_parent(&self, parent_session_key: &str) -> usize {
        let key = parent_session_key.to_string();
        self.finish_matching(
            move |r| r.parent_session_key == key,
            RequestStatus::Orphaned,
            "orphaned because the parent session ended",
        )
        .await
    }

    async fn finish_matching(
        &self,
        matches: impl Fn(&RequestRecord) -> bool,
        status: RequestStatus,
        note: &str,
    ) -> usize {
        let (finished, pending_count, snapshot) = {
            let mut state = self.lock_state();
            let mut finished = Vec::new();
            for record in state.requests.values_mut() {
                if record.status == RequestStatus::Pending && matches(record) {
                    record.status = status;
                    record.error = Some(note.to_string());
                    finished.push(record.clone());
                }
            }
            if finished.is_empty() {
                return 0;
            }
            let finished: Vec<(RequestRecord, Vec<oneshot::Sender<RequestRecord>>)> = finished
                .into_iter()
                .map(|r| {
                    let waiters = state.waiters.remove(&r.request_id).unwrap_or_default();
                    (r, waiters)
                })
                .collect();
            let pending = count_pending(&state);
            (finished, pending, state.requests.clone())
        };

        let count = finished.len();
        for (record, waiters) in finished {
            for waiter in waiters {
                let _ = waiter.send(record.clone());
            }
            metrics::record_request_finished(&record.status.to_string());
            let event = match status {
                RequestStatus::Cancelled => GatewayEvent::RequestCancelled {
                    request_id: record.request_id.clone(),
                },
                _ => GatewayEvent::RequestOrphaned {
                    request_id: record.request_id.clone(),
                },
            };
            self.observers.emit(&event);
            tracing::info!(request_id = %record.request_id, status = %record.status, "Orchestration request finished in bulk");
        }
        self.persist(&snapshot).await;
        metrics::set_pending_requests(pending_count);
        count
    }

    /// Transition every pending request whose deadline has elapsed to
    /// `timeout`, waking its waiters. Returns the number of transitions.
    pub async fn sweep_timeouts(&self) -> usize {
        let now = self.clock.now_ms();
        let (timed_out, pending_count, snapshot) = {
            let mut state = self.lock_state();
            let mut finished = Vec::new();
            for record in state.requests.values_mut() {
                if record.status == RequestStatus::Pending && record.timeout_at_ms <= now {
                    record.status = RequestStatus::Timeout;
                    record.error = Some(format!(
                        "timed out after {}ms waiting for parent session '{}'",
                        record.timeout_at_ms.saturating_sub(record.created_at_ms),
                        record.parent_session_key
                    ));
                    finished.push(record.clone());
                }
            }
            if finished.is_empty() {
                return 0;
            }
            let finished: Vec<(RequestRecord, Vec<oneshot::Sender<RequestRecord>>)> = finished
                .into_iter()
                .map(|r| {
                    let waiters = state.waiters.remove(&r.request_id).unwrap_or_default();
                    (r, waiters)
                })
                .collect();
            let pending = count_pending(&state);
            (finished, pending, state.requests.clone())
        };

        let count = timed_out.len();
        for (record, waiters) in timed_out {
            for waiter in waiters {
                let _ = waiter.send(record.clone());
            }
            metrics::record_request_finished("timeout");
            self.observers.emit(&GatewayEvent::RequestTimedOut {
                request_id: record.request_id.clone(),
            });
            tracing::warn!(request_id = %record.request_id, "Orchestration request timed out");
        }
        self.persist(&snapshot).await;
        metrics::set_pending_requests(pending_count);
        count
    }

    /// Wait until the record reaches any terminal state, without polling.
    ///
    /// Rejects with `Aborted` if `cancel` fires first, and with `WaitTimeout`
    /// if the caller's own deadline elapses while the record is still
    /// pending. Neither path mutates the record; only
    /// resolve/sweep/cancel/orphan do that.
    pub async fn wait_for_resolution(
        &self,
        request_id: &str,
        timeout_ms: u64,
        cancel: Option<CancellationToken>,
    ) -> RegistryResult<RequestRecord> {
        let rx = {
            let mut state = self.lock_state();
            let record = state.requests.get(request_id).ok_or_else(|| {
                RegistryError::new(
                    ErrorKind::NotFound,
                    format!("unknown request: {}", request_id),
                )
            })?;
            if record.status.is_terminal() {
                return Ok(record.clone());
            }
            let (tx, rx) = oneshot::channel();
            state
                .waiters
                .entry(request_id.to_string())
                .or_default()
                .push(tx);
            rx
        };

        let aborted = async {
            match &cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            woken = rx => match woken {
                Ok(record) => Ok(record),
                // Registry dropped mid-wait; surface the last known state.
                Err(_) => self.get(request_id).ok_or_else(|| {
                    RegistryError::new(
                        ErrorKind::NotFound,
                        format!("request {} disappeared while waiting", request_id),
                    )
                }),
            },
            _ = aborted => Err(RegistryError::new(
                ErrorKind::Aborted,
                format!("wait for request {} aborted by caller", request_id),
            )),
            _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                match self.get(request_id) {
                    Some(record) if record.status.is_terminal() => Ok(record),
                    _ => Err(RegistryError::new(
                        ErrorKind::WaitTimeout,
                        format!(
                            "timed out after {}ms waiting for request {}",
                            timeout_ms, request_id
                        ),
                    )),
                }
            }
        }
    }

    pub fn get(&self, request_id: &str) -> Option<RequestRecord> {
        self.lock_state().requests.get(request_id).cloned()
    }

    /// Pending requests a parent session owes answers for, in creation order.
    pub fn list_pending_for_parent(&self, parent_session_key: &str) -> Vec<RequestRecord> {
        self.list_pending(|r| r.parent_session_key == parent_session_key)
    }

    /// Pending requests a child session is waiting on, in creation order.
    pub fn list_pending_for_child(&self, child_session_key: &str) -> Vec<RequestRecord> {
        self.list_pending(|r| r.child_session_key == child_session_key)
    }

    fn list_pending(&self, matches: impl Fn(&RequestRecord) -> bool) -> Vec<RequestRecord> {
        let state = self.lock_state();
        let mut pending: Vec<RequestRecord> = state
            .requests
            .values()
            .filter(|r| r.status == RequestStatus::Pending && matches(r))
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.request_id.cmp(&b.request_id))
        });
        pending
    }

    /// Start the recurring timeout sweep. Idempotent; a second start is a
    /// no-op while the first is running.
    pub fn start_timeout_sweeper(self: Arc<Self>) {
        let mut guard = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.is_some() {
            tracing::debug!("Timeout sweeper already running");
            return;
        }
        let registry = Arc::clone(&self);
        let interval_ms = self.limits.sweep_interval_ms.max(1);
        tracing::info!(interval_ms, "Starting request timeout sweeper");
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                registry.sweep_timeouts().await;
            }
        }));
    }

    /// Stop the sweeper. Idempotent; stopping a stopped sweeper is a no-op.
    pub fn stop_timeout_sweeper(&self) {
        let mut guard = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = guard.take() {
            handle.abort();
            tracing::info!("Request timeout sweeper stopped");
        }
    }
}

impl Drop for RequestRegistry {
    fn drop(&mut self) {
        self.stop_timeout_sweeper();
    }
}

fn count_pending(state: &RegistryState) -> u64 {
    state
        .requests
        .values()
        .filter(|r| r.status == RequestStatus::Pending)
        .count() as u64
}

/// Lazy retention sweep: terminal records past the TTL are dropped, along
/// with rate-mark entries whose window has fully passed.
fn purge_expired(state: &mut RegistryState, now: u64, limits: &RequestLimits) {
    let cutoff = now.saturating_sub(limits.retention_ttl_ms);
    let before = state.requests.len();
    state
        .requests
        .retain(|_, r| !(r.status.is_terminal() && r.created_at_ms <= cutoff));
    let purged = before - state.requests.len();
    if purged > 0 {
        tracing::debug!(purged, "Purged expired terminal requests");
    }
    let window_start = now.saturating_sub(limits.rate_limit_window_ms);
    state.rate_marks.retain(|_, marks| {
        marks.retain(|&t| t > window_start);
        !marks.is_empty()
    });
}
