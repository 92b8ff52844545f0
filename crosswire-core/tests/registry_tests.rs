// ABOUTME: Tests for the request registry - caps, rate limits, terminal transitions, waiters
// ABOUTME: Covers the sweeper loop, abort signals, retention purge, and write-through persistence

use std::sync::Arc;

use crosswire_core::clock::{Clock, ManualClock};
use crosswire_core::config::RequestLimits;
use crosswire_core::error::ErrorKind;
use crosswire_core::events::Observers;
use crosswire_core::requests::{NewRequest, RequestRegistry, RequestStatus};
use crosswire_core::store::{MemoryRequestStore, RequestStore};
use tokio_util::sync::CancellationToken;

const T0: u64 = 1_700_000_000_000;

fn test_limits() -> RequestLimits {
    RequestLimits {
        sweep_interval_ms: 20,
        ..RequestLimits::default()
    }
}

async fn test_registry_with(
    limits: RequestLimits,
) -> (
    Arc<RequestRegistry>,
    Arc<ManualClock>,
    Arc<MemoryRequestStore>,
) {
    let clock = ManualClock::new(T0);
    let store = Arc::new(MemoryRequestStore::new());
    let registry = RequestRegistry::load(
        Arc::clone(&store) as Arc<dyn RequestStore>,
        Arc::clone(&clock) as Arc<dyn Clock>,
        Arc::new(Observers::new()),
        limits,
    )
    .await;
    (Arc::new(registry), clock, store)
}

async fn test_registry() -> (
    Arc<RequestRegistry>,
    Arc<ManualClock>,
    Arc<MemoryRequestStore>,
) {
    test_registry_with(test_limits()).await
}

fn ask(child: &str, parent: &str) -> NewRequest {
    NewRequest {
        child_session_key: child.to_string(),
        parent_session_key: parent.to_string(),
        message: "ping".to_string(),
        ..NewRequest::default()
    }
}

// =============================================================================
// Creation, Caps, Rate Limits
// =============================================================================

#[tokio::test]
async fn test_create_request_populates_record() {
    let (registry, _clock, store) = test_registry().await;

    let id = registry.create_request(ask("child-a", "parent-a")).await.unwrap();
    assert!(id.starts_with("req_"));

    let record = registry.get(&id).unwrap();
    assert_eq!(record.status, RequestStatus::Pending);
    assert_eq!(record.child_session_key, "child-a");
    assert_eq!(record.parent_session_key, "parent-a");
    assert_eq!(record.created_at_ms, T0);
    assert_eq!(record.timeout_at_ms, T0 + 120_000);
    assert!(record.response.is_none());

    // Write-through: the store already has it
    assert!(store.snapshot().contains_key(&id));
}

#[tokio::test]
async fn test_create_request_rejects_missing_keys() {
    let (registry, _clock, _store) = test_registry().await;

    let err = registry.create_request(ask("", "parent-a")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let err = registry.create_request(ask("child-a", "  ")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test]
async fn test_child_pending_cap() {
    let (registry, _clock, _store) = test_registry().await;

    for _ in 0..3 {
        registry.create_request(ask("child-a", "parent-a")).await.unwrap();
    }

    let err = registry
        .create_request(ask("child-a", "parent-a"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capacity);
    assert!(err.message().contains("pending requests"));

    // Another child is unaffected
    registry.create_request(ask("child-b", "parent-a")).await.unwrap();
}

#[tokio::test]
async fn test_parent_pending_cap() {
    let (registry, _clock, _store) = test_registry().await;

    for i in 0..20 {
        registry
            .create_request(ask(&format!("child-{}", i), "parent-a"))
            .await
            .unwrap();
    }

    let err = registry
        .create_request(ask("child-20", "parent-a"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capacity);
    assert!(err.message().contains("pending requests"));
}

#[tokio::test]
async fn test_rate_limit_counts_creations_regardless_of_outcome() {
    let (registry, clock, _store) = test_registry().await;

    // Create-then-cancel five times: nothing stays pending, but each
    // creation still counts against the window
    for _ in 0..5 {
        registry.create_request(ask("child-a", "parent-a")).await.unwrap();
        assert_eq!(registry.cancel_requests_for_child("child-a").await, 1);
    }

    let err = registry
        .create_request(ask("child-a", "parent-a"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RateLimit);
    assert!(err.message().contains("rate limit"));

    // Past the window the next create succeeds
    clock.advance(61_000);
    registry.create_request(ask("child-a", "parent-a")).await.unwrap();
}

// =============================================================================
// Terminal Transitions
// =============================================================================

#[tokio::test]
async fn test_resolve_request_sets_response_fields() {
    let (registry, clock, store) = test_registry().await;

    let id = registry.create_request(ask("child-a", "parent-a")).await.unwrap();
    clock.advance(5_000);

    let record = registry
        .resolve_request(&id, "pong", "parent-a")
        .await
        .unwrap();
    assert_eq!(record.status, RequestStatus::Resolved);
    assert_eq!(record.response.as_deref(), Some("pong"));
    assert_eq!(record.resolved_by_session_key.as_deref(), Some("parent-a"));
    assert_eq!(record.resolved_at_ms, Some(T0 + 5_000));

    assert_eq!(
        store.snapshot().get(&id).unwrap().status,
        RequestStatus::Resolved
    );
}

#[tokio::test]
async fn test_double_resolve_is_rejected() {
    let (registry, _clock, _store) = test_registry().await;

    let id = registry.create_request(ask("child-a", "parent-a")).await.unwrap();
    registry.resolve_request(&id, "pong", "parent-a").await.unwrap();

    let err = registry
        .resolve_request(&id, "pong again", "parent-b")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // The winning resolution is untouched
    let record = registry.get(&id).unwrap();
    assert_eq!(record.response.as_deref(), Some("pong"));
}

#[tokio::test]
async fn test_resolve_unknown_request() {
    let (registry, _clock, _store) = test_registry().await;

    let err = registry
        .resolve_request("req_nope", "pong", "parent-a")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_sweep_times_out_overdue_requests() {
    let (registry, clock, _store) = test_registry().await;

    let mut new = ask("child-a", "parent-a");
    new.timeout_ms = Some(1_000);
    let id = registry.create_request(new).await.unwrap();

    // Not yet due
    clock.advance(999);
    assert_eq!(registry.sweep_timeouts().await, 0);

    clock.advance(2);
    assert_eq!(registry.sweep_timeouts().await, 1);

    let record = registry.get(&id).unwrap();
    assert_eq!(record.status, RequestStatus::Timeout);
    assert!(record.error.as_deref().unwrap().contains("timed out"));

    // The loser of the race gets a clean conflict, never a double-apply
    let err = registry
        .resolve_request(&id, "late", "parent-a")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_resolve_wins_race_against_sweeper() {
    let (registry, clock, _store) = test_registry().await;

    let mut new = ask("child-a", "parent-a");
    new.timeout_ms = Some(1_000);
    let id = registry.create_request(new).await.unwrap();

    registry.resolve_request(&id, "pong", "parent-a").await.unwrap();

    // Deadline elapses afterwards; the sweep must not touch the record
    clock.advance(5_000);
    assert_eq!(registry.sweep_timeouts().await, 0);
    assert_eq!(registry.get(&id).unwrap().status, RequestStatus::Resolved);
}

#[tokio::test]
async fn test_cancel_requests_for_child() {
    let (registry, _clock, _store) = test_registry().await;

    let a = registry.create_request(ask("child-a", "parent-a")).await.unwrap();
    let b = registry.create_request(ask("child-a", "parent-a")).await.unwrap();
    let other = registry.create_request(ask("child-b", "parent-a")).await.unwrap();

    assert_eq!(registry.cancel_requests_for_child("child-a").await, 2);

    assert_eq!(registry.get(&a).unwrap().status, RequestStatus::Cancelled);
    assert_eq!(registry.get(&b).unwrap().status, RequestStatus::Cancelled);
    assert_eq!(registry.get(&other).unwrap().status, RequestStatus::Pending);

    // Cancelling again finds nothing pending
    assert_eq!(registry.cancel_requests_for_child("child-a").await, 0);
}

#[tokio::test]
async fn test_orphan_requests_for_parent() {
    let (registry, _clock, _store) = test_registry().await;

    let a = registry.create_request(ask("child-a", "parent-a")).await.unwrap();
    let other = registry.create_request(ask("child-b", "parent-b")).await.unwrap();

    assert_eq!(registry.orphan_requests_for_parent("parent-a").await, 1);

    let record = registry.get(&a).unwrap();
    assert_eq!(record.status, RequestStatus::Orphaned);
    assert!(record.error.is_some());
    assert_eq!(registry.get(&other).unwrap().status, RequestStatus::Pending);
}

// =============================================================================
// Queries
// =============================================================================

#[tokio::test]
async fn test_list_pending_in_creation_order() {
    let (registry, clock, _store) = test_registry().await;

    let first = registry.create_request(ask("child-a", "parent-a")).await.unwrap();
    clock.advance(10);
    let second = registry.create_request(ask("child-b", "parent-a")).await.unwrap();
    clock.advance(10);
    let third = registry.create_request(ask("child-a", "parent-a")).await.unwrap();

    registry.resolve_request(&second, "pong", "parent-a").await.unwrap();

    let for_parent = registry.list_pending_for_parent("parent-a");
    let ids: Vec<&str> = for_parent.iter().map(|r| r.request_id.as_str()).collect();
    assert_eq!(ids, vec![first.as_str(), third.as_str()]);

    let for_child = registry.list_pending_for_child("child-a");
    assert_eq!(for_child.len(), 2);
    assert_eq!(for_child[0].request_id, first);
}

// =============================================================================
// Waiters
// =============================================================================

#[tokio::test]
async fn test_wait_resolves_when_answer_arrives() {
    let (registry, _clock, _store) = test_registry().await;

    let id = registry.create_request(ask("child-a", "parent-a")).await.unwrap();

    let waiter = {
        let registry = Arc::clone(&registry);
        let id = id.clone();
        tokio::spawn(async move { registry.wait_for_resolution(&id, 60_000, None).await })
    };
    // Let the waiter register before resolving
    tokio::task::yield_now().await;

    registry.resolve_request(&id, "pong", "parent-a").await.unwrap();

    let record = waiter.await.unwrap().unwrap();
    assert_eq!(record.status, RequestStatus::Resolved);
    assert_eq!(record.response.as_deref(), Some("pong"));
    assert_eq!(record.resolved_by_session_key.as_deref(), Some("parent-a"));
}

#[tokio::test]
async fn test_wait_returns_immediately_for_terminal_record() {
    let (registry, _clock, _store) = test_registry().await;

    let id = registry.create_request(ask("child-a", "parent-a")).await.unwrap();
    registry.resolve_request(&id, "pong", "parent-a").await.unwrap();

    let record = registry.wait_for_resolution(&id, 1, None).await.unwrap();
    assert_eq!(record.status, RequestStatus::Resolved);
}

#[tokio::test]
async fn test_wait_rejects_on_abort() {
    let (registry, _clock, _store) = test_registry().await;

    let id = registry.create_request(ask("child-a", "parent-a")).await.unwrap();
    let token = CancellationToken::new();

    let waiter = {
        let registry = Arc::clone(&registry);
        let id = id.clone();
        let token = token.clone();
        tokio::spawn(async move { registry.wait_for_resolution(&id, 60_000, Some(token)).await })
    };
    tokio::task::yield_now().await;

    token.cancel();

    let err = waiter.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Aborted);
    assert!(err.message().contains("abort"));

    // Aborting the wait never mutates the record
    assert_eq!(registry.get(&id).unwrap().status, RequestStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn test_wait_fails_when_own_deadline_elapses() {
    let (registry, _clock, _store) = test_registry().await;

    let id = registry.create_request(ask("child-a", "parent-a")).await.unwrap();

    let err = registry.wait_for_resolution(&id, 50, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WaitTimeout);
    assert_eq!(registry.get(&id).unwrap().status, RequestStatus::Pending);
}

#[tokio::test]
async fn test_wait_unknown_request() {
    let (registry, _clock, _store) = test_registry().await;

    let err = registry
        .wait_for_resolution("req_nope", 1_000, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// =============================================================================
// Sweeper Loop
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_sweeper_loop_wakes_waiter_with_timeout() {
    let (registry, clock, _store) = test_registry().await;

    let mut new = ask("child-a", "parent-a");
    new.timeout_ms = Some(1_000);
    let id = registry.create_request(new).await.unwrap();

    // The record is overdue on the logical clock; the loop's next tick
    // should transition it and wake the waiter
    clock.advance(1_001);
    Arc::clone(&registry).start_timeout_sweeper();
    // A second start while running is a no-op
    Arc::clone(&registry).start_timeout_sweeper();

    let record = registry
        .wait_for_resolution(&id, 600_000, None)
        .await
        .unwrap();
    assert_eq!(record.status, RequestStatus::Timeout);

    registry.stop_timeout_sweeper();
    registry.stop_timeout_sweeper();
}

// =============================================================================
// Retention
// =============================================================================

#[tokio::test]
async fn test_terminal_records_purged_after_ttl() {
    let (registry, clock, store) = test_registry().await;

    let old = registry.create_request(ask("child-a", "parent-a")).await.unwrap();
    registry.resolve_request(&old, "pong", "parent-a").await.unwrap();

    clock.advance(86_400_000 + 1);

    // Purge is lazy: it happens on the next create
    let fresh = registry.create_request(ask("child-b", "parent-a")).await.unwrap();

    assert!(registry.get(&old).is_none());
    assert!(registry.get(&fresh).is_some());
    assert!(!store.snapshot().contains_key(&old));
}

#[tokio::test]
async fn test_pending_records_survive_ttl() {
    let (registry, clock, _store) = test_registry().await;

    // A pending request is never retention-purged, only swept by deadline
    let mut new = ask("child-a", "parent-a");
    new.timeout_ms = Some(172_800_000); // 48h
    let id = registry.create_request(new).await.unwrap();

    clock.advance(86_400_000 + 1);
    registry.create_request(ask("child-b", "parent-a")).await.unwrap();

    assert_eq!(registry.get(&id).unwrap().status, RequestStatus::Pending);
}

// =============================================================================
// Persistence Restart
// =============================================================================

#[tokio::test]
async fn test_registry_reloads_from_store() {
    let store = Arc::new(MemoryRequestStore::new());
    let clock = ManualClock::new(T0);

    {
        let registry = RequestRegistry::load(
            Arc::clone(&store) as Arc<dyn RequestStore>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::new(Observers::new()),
            test_limits(),
        )
        .await;
        registry.create_request(ask("child-a", "parent-a")).await.unwrap();
    }

    // A fresh registry over the same store sees the committed record
    let registry = RequestRegistry::load(
        Arc::clone(&store) as Arc<dyn RequestStore>,
        Arc::clone(&clock) as Arc<dyn Clock>,
        Arc::new(Observers::new()),
        test_limits(),
    )
    .await;
    assert_eq!(registry.list_pending_for_parent("parent-a").len(), 1);
}
