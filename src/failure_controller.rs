//! 失败控制器
//!
//! 熔断与重试合并为一个状态机：每次尝试前先过目标熔断器，
//! 失败按分类决定重试、直接失败或计入熔断。同一操作的重试严格串行。

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitRegistry, CircuitState, CircuitStats};
use crate::error::{GovernorError, OperationError};
use crate::log_redaction::redact_credentials;
use crate::retry::RetryConfig;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

/// 单次尝试的失败
#[derive(Debug)]
pub enum AttemptError {
    /// 目标返回的已分类错误
    Operation(OperationError),
    /// 尝试期间到达截止时间，计入熔断但不再重试
    DeadlineExceeded(String),
    /// 尝试未触达目标（如没有可用出口），不计入熔断
    Aborted(GovernorError),
}

impl From<OperationError> for AttemptError {
    fn from(err: OperationError) -> Self {
        AttemptError::Operation(err)
    }
}

/// 失败控制器统计
#[derive(Debug, Clone, Serialize)]
pub struct FailureControllerStats {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    /// 因熔断直接拒绝的执行次数
    pub short_circuited: u64,
    pub deadline_exceeded: u64,
    pub circuits: Vec<CircuitStats>,
}

/// 失败控制器
pub struct FailureController {
    circuits: CircuitRegistry,
    retry: RetryConfig,
    executions: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    short_circuited: AtomicU64,
    deadline_exceeded: AtomicU64,
}

impl FailureController {
    pub fn new(circuit_breaker: CircuitBreakerConfig, retry: RetryConfig) -> Self {
        Self {
            circuits: CircuitRegistry::new(circuit_breaker),
            retry,
            executions: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            short_circuited: AtomicU64::new(0),
            deadline_exceeded: AtomicU64::new(0),
        }
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// 在熔断与重试保护下执行
    ///
    /// `attempt` 以尝试序号（从 0 开始）调用，每次返回一次尝试的结果。
    /// - 熔断打开：返回 `CircuitOpen`，不调用 `attempt`
    /// - 瞬时 / 限流失败：按退避重试，直到 `max_retries` 或截止时间
    /// - 永久 / 认证失败：立即返回
    /// - 非幂等操作不重试
    /// - 重试途中熔断打开：返回上一次的错误
    #[instrument(skip(self, attempt))]
    pub async fn execute<T, F, Fut>(
        &self,
        target: &str,
        deadline: Instant,
        idempotent: bool,
        mut attempt: F,
    ) -> Result<T, GovernorError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        self.executions.fetch_add(1, Ordering::Relaxed);
        let breaker = self.circuits.breaker(target);
        let mut last_error: Option<OperationError> = None;
        let mut number: u32 = 0;

        loop {
            if Instant::now() >= deadline {
                return Err(self.deadline_error(format!(
                    "target={} 第 {} 次尝试前已到截止时间",
                    target, number
                )));
            }

            let permit = match breaker.try_acquire() {
                Ok(permit) => permit,
                Err(open) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(match last_error {
                        Some(err) => GovernorError::from_operation(target, number, err),
                        None => {
                            self.short_circuited.fetch_add(1, Ordering::Relaxed);
                            open
                        }
                    });
                }
            };

            let outcome = match tokio::time::timeout_at(deadline, attempt(number)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(AttemptError::DeadlineExceeded(format!(
                    "target={} 第 {} 次尝试超过截止时间",
                    target, number
                ))),
            };

            let err = match outcome {
                Ok(value) => {
                    permit.on_success();
                    self.successes.fetch_add(1, Ordering::Relaxed);
                    trace!(attempt = number, "执行成功");
                    return Ok(value);
                }
                Err(AttemptError::DeadlineExceeded(message)) => {
                    permit.on_failure();
                    return Err(self.deadline_error(message));
                }
                Err(AttemptError::Aborted(err)) => {
                    drop(permit);
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    debug!(attempt = number, error = %err, "尝试中止");
                    return Err(err);
                }
                Err(AttemptError::Operation(err)) => err,
            };

            if !err.kind.is_retryable() {
                permit.on_neutral();
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(attempt = number, kind = ?err.kind, "不可重试的失败");
                return Err(GovernorError::from_operation(target, number + 1, err));
            }
            permit.on_failure();

            if !idempotent || number >= self.retry.max_retries {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(attempt = number, idempotent, "重试预算耗尽");
                return Err(GovernorError::from_operation(target, number + 1, err));
            }

            let delay = self.retry.delay_for(number);
            if Instant::now()
                .checked_add(delay)
                .map_or(true, |resume| resume >= deadline)
            {
                return Err(self.deadline_error(format!(
                    "target={} 退避 {:?} 会超过截止时间: {}",
                    target,
                    delay,
                    redact_credentials(&err.message)
                )));
            }

            warn!(
                attempt = number,
                ?delay,
                kind = ?err.kind,
                "尝试失败，退避后重试: {}",
                redact_credentials(&err.message)
            );
            tokio::time::sleep(delay).await;
            self.retries.fetch_add(1, Ordering::Relaxed);
            last_error = Some(err);
            number += 1;
        }
    }

    fn deadline_error(&self, message: String) -> GovernorError {
        self.deadline_exceeded.fetch_add(1, Ordering::Relaxed);
        self.failures.fetch_add(1, Ordering::Relaxed);
        debug!("{}", message);
        GovernorError::DeadlineExceeded(message)
    }

    /// 手动重置目标的熔断器
    pub fn reset(&self, target: &str) -> bool {
        self.circuits.reset(target)
    }

    /// 目标熔断器状态；从未执行过的目标返回 `None`
    pub fn circuit_state(&self, target: &str) -> Option<CircuitState> {
        self.circuits.state(target)
    }

    pub fn stats(&self) -> FailureControllerStats {
        FailureControllerStats {
            executions: self.executions.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            short_circuited: self.short_circuited.load(Ordering::Relaxed),
            deadline_exceeded: self.deadline_exceeded.load(Ordering::Relaxed),
            circuits: self.circuits.stats(),
        }
    }
}
