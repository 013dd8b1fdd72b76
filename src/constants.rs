//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Centralized configuration constants for egressguard.
//!
//! Every empirical threshold lives here as a default, never as a hard invariant.
//! All of them can be overridden through [`crate::config::GovernorConfig`].

// ============================================================================
// Adaptive Throttling Constants
// ============================================================================

/// Number of outcome reports per scope between two multiplier recomputations.
pub const DEFAULT_ADAPTIVE_EVALUATION_INTERVAL: u32 = 20;

/// Success ratio at or above which the multiplier climbs.
pub const DEFAULT_ADAPTIVE_HEALTHY_RATIO: f64 = 0.95;

/// Success ratio below which the multiplier drops.
pub const DEFAULT_ADAPTIVE_DEGRADED_RATIO: f64 = 0.85;

/// Multiplier increment applied when a scope is healthy.
pub const DEFAULT_ADAPTIVE_INCREASE_STEP: f64 = 0.1;

/// Multiplier decrement applied when a scope is degrading or rate limited.
pub const DEFAULT_ADAPTIVE_DECREASE_STEP: f64 = 0.2;

/// Upper bound of the adaptive multiplier.
pub const DEFAULT_ADAPTIVE_MAX_MULTIPLIER: f64 = 1.5;

/// Lower bound of the adaptive multiplier.
pub const DEFAULT_ADAPTIVE_MIN_MULTIPLIER: f64 = 0.3;

// ============================================================================
// Egress Constants
// ============================================================================

/// Consecutive failures after which an egress path is blacklisted.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Average latency at which the speed factor of the health score reaches zero (10 seconds).
pub const DEFAULT_SPEED_CEILING_MS: u64 = 10_000;

/// Idle time after which the recency factor bottoms out at 0.5 (10 minutes).
pub const DEFAULT_RECENCY_WINDOW_SECS: u64 = 600;

// ============================================================================
// Circuit Breaker Constants
// ============================================================================

/// Consecutive retryable failures that open a target's circuit.
pub const DEFAULT_CIRCUIT_BREAKER_FAILURE_THRESHOLD: u32 = 3;

/// Initial cooldown of an open circuit (30 seconds).
pub const DEFAULT_CIRCUIT_BREAKER_COOLDOWN_SECS: u64 = 30;

/// Upper bound for the doubled cooldown (10 minutes).
pub const DEFAULT_CIRCUIT_BREAKER_MAX_COOLDOWN_SECS: u64 = 600;

// ============================================================================
// Retry Constants
// ============================================================================

/// Retries allowed after the first attempt of an operation.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay of the exponential backoff (500 milliseconds).
pub const DEFAULT_BASE_BACKOFF_MS: u64 = 500;

/// Cap of a single backoff delay (30 seconds).
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;

/// Jitter as a fraction of the exponential delay. Must stay within [0, 1].
pub const DEFAULT_JITTER_RATIO: f64 = 0.25;

// ============================================================================
// Governor Constants
// ============================================================================

/// Worker slots used when no rate window is configured and no ceiling is given.
pub const DEFAULT_CONCURRENCY: usize = 16;

/// Deadline applied to operations that do not carry their own (2 minutes).
pub const DEFAULT_DEADLINE_SECS: u64 = 120;

/// Furthest deadline an operation can carry; longer budgets are capped here (about 30 years).
pub const MAX_DEADLINE_SECS: u64 = 86_400 * 365 * 30;

/// Capacity of the outcome broadcast channel.
pub const OUTCOME_CHANNEL_CAPACITY: usize = 1024;

/// Maximum length of a source identifier.
pub const MAX_SOURCE_ID_LENGTH: usize = 128;
