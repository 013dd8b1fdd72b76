//! Prelude module - Commonly used types for quick imports
//!
//! This module re-exports the most commonly used types from EgressGuard,
//! allowing users to import them with a single `use egressguard::prelude::*;`
//! statement instead of importing each type individually.

// Core types - always available
pub use crate::config::GovernorConfig;
pub use crate::error::{FailureKind, GovernorError, OperationError};
pub use crate::governor::Governor;
pub use crate::operation::{AttemptContext, Operation, OutcomeKind};

// Egress pool
pub use crate::egress::{EgressHandle, EgressPathConfig, Protocol, RotationStrategy};

// Failure policy
pub use crate::circuit_breaker::CircuitBreakerConfig;
pub use crate::retry::RetryConfig;

// Feature-gated exports
#[cfg(feature = "telemetry")]
pub use crate::telemetry::init_tracing;

#[cfg(feature = "monitoring")]
pub use crate::telemetry::Metrics;
