// ABOUTME: Tunables for the request registry and cron scheduler
// ABOUTME: Every limit and tick interval is TOML-overridable with sensible defaults

use serde::{Deserialize, Serialize};

/// Caps, rate limits, and timing for the orchestration request registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLimits {
    /// Maximum simultaneously pending requests per child session key
    #[serde(default = "default_max_pending_per_child")]
    pub max_pending_per_child: usize,
    /// Maximum simultaneously pending requests per parent session key
    #[serde(default = "default_max_pending_per_parent")]
    pub max_pending_per_parent: usize,
    /// Creations allowed per child within the rate-limit window
    #[serde(default = "default_rate_limit_max")]
    pub rate_limit_max: usize,
    #[serde(default = "default_rate_limit_window_ms")]
    pub rate_limit_window_ms: u64,
    /// Deadline applied when the caller does not request one
    #[serde(default = "default_request_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Timeout sweeper tick; worst-case transition delay is bounded by this
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Terminal records older than this are purged on the next create
    #[serde(default = "default_retention_ttl_ms")]
    pub retention_ttl_ms: u64,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_pending_per_child: default_max_pending_per_child(),
            max_pending_per_parent: default_max_pending_per_parent(),
            rate_limit_max: default_rate_limit_max(),
            rate_limit_window_ms: default_rate_limit_window_ms(),
            default_timeout_ms: default_request_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            retention_ttl_ms: default_retention_ttl_ms(),
        }
    }
}

fn default_max_pending_per_child() -> usize {
    3
}

fn default_max_pending_per_parent() -> usize {
    20
}

fn default_rate_limit_max() -> usize {
    5
}

fn default_rate_limit_window_ms() -> u64 {
    60_000
}

fn default_request_timeout_ms() -> u64 {
    120_000 // 2 minutes
}

fn default_sweep_interval_ms() -> u64 {
    500
}

fn default_retention_ttl_ms() -> u64 {
    86_400_000 // 24 hours
}

/// Timing and backoff settings for the cron scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronConfig {
    /// Scheduler tick: recompute next runs, then execute due jobs
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Floor for stuck-run detection; jobs with a longer configured timeout
    /// get 2x their own timeout instead
    #[serde(default = "default_stuck_run_ms")]
    pub default_stuck_run_ms: u64,
    /// Cap on the backoff doubling exponent
    #[serde(default = "default_backoff_max_exponent")]
    pub backoff_max_exponent: u32,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            default_stuck_run_ms: default_stuck_run_ms(),
            backoff_max_exponent: default_backoff_max_exponent(),
        }
    }
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_stuck_run_ms() -> u64 {
    1_800_000 // 30 minutes
}

fn default_backoff_max_exponent() -> u32 {
    5
}
