//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! EgressGuard - Outbound Request Governance
//!
//! Routes outbound fetch/scrape operations through an adaptive rate throttler,
//! an egress (proxy) rotation manager and a per-target failure controller.
//!
//! # API Layers
//!
//! ## Prelude (Quick Start)
//!
//! Use `use egressguard::prelude::*;` to import all commonly used types.
//!
//! ## Core API
//!
//! - [`Governor`] - Main controller: submit operations, read stats
//! - [`GovernorConfig`] - Rate windows, egress pool, breaker and retry settings
//! - [`Operation`] - A unit of outbound work with its source identifier
//! - [`GovernorError`] - Terminal error with classification
//!
//! ## Components
//!
//! - [`RateThrottler`] - Multi-scope rolling windows with adaptive multipliers
//! - [`EgressManager`] - Egress path pool, rotation strategies, health scoring
//! - [`FailureController`] - Per-target circuit breaker plus bounded retry
//!
//! ## Extensions (feature-gated)
//!
//! - Tracing subscriber setup (requires `telemetry` feature)
//! - Prometheus metrics (requires `monitoring` feature)
//!
//! # Examples
//!
//! ```rust
//! use egressguard::prelude::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = GovernorConfig::default()
//!         .with_global_limit(100, Duration::from_secs(1))
//!         .with_paths(vec![
//!             EgressPathConfig::direct("direct"),
//!             EgressPathConfig::proxy("eu-1", Protocol::Http, "10.0.0.1", 3128),
//!         ]);
//!     let governor = Governor::new(config).unwrap();
//!
//!     let op = Operation::new("maps", |ctx| async move {
//!         // 通过 ctx.egress 建立连接并发起请求
//!         Ok::<_, OperationError>(ctx.egress.id.clone())
//!     });
//!     let used = governor.submit(op).await.unwrap();
//!     assert_eq!(used, "direct");
//! }
//! ```
//!
//! # Features
//!
//! - **Adaptive throttling**: rolling windows per global/source/egress scope, multiplier driven by outcomes
//! - **Egress rotation**: round-robin, random, least-used, fastest and score-weighted selection
//! - **Health scoring**: success rate, latency and recency combined; automatic blacklisting
//! - **Circuit breaking**: per-target breaker with single-probe recovery and doubling cooldown
//! - **Retry**: exponential backoff with bounded jitter, deadline aware
//! - **Monitoring**: stats snapshot, outcome subscription, optional Prometheus metrics

pub mod prelude;

pub mod circuit_breaker;
pub mod config;
pub mod constants;
pub mod egress;
pub mod error;
pub mod failure_controller;
pub mod governor;
pub mod log_redaction;
pub mod operation;
pub mod retry;
#[cfg(any(feature = "telemetry", feature = "monitoring"))]
pub mod telemetry;
pub mod throttler;

// 重新导出常用类型
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitRegistry, CircuitState, CircuitStats,
};
pub use config::{AdaptiveConfig, EgressConfig, GovernorConfig, RateLimitsConfig, WindowConfig};
pub use egress::{
    EgressEndpoint, EgressHandle, EgressManager, EgressPathConfig, EgressProbe, FnProbe,
    PathState, PathStats, Protocol, RotationStrategy, SelectionStrategy, TestSummary,
};
pub use error::{ErrorKind, FailureKind, GovernorError, OperationError};
pub use failure_controller::{AttemptError, FailureController, FailureControllerStats};
pub use governor::{Governor, GovernorStats, RemediationRecord};
pub use operation::{AttemptContext, Operation, OutcomeKind, OutcomeReport};
pub use retry::RetryConfig;
#[cfg(feature = "telemetry")]
pub use telemetry::init_tracing;
#[cfg(feature = "monitoring")]
pub use telemetry::Metrics;
pub use throttler::{Admission, RateThrottler, ScopeKey, ScopeStats};
