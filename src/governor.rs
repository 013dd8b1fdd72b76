//! Governor 主控制器
//!
//! 出站请求治理的入口：放行 → 选择出口 → 在失败控制器保护下执行 → 结果回流。
//!
//! 每次尝试的流程：
//! 1. 在 `[global, source]` 作用域上等待放行（受截止时间约束）
//! 2. 从出口管理器选择路径；路径配置了出口窗口时再放行 `egress:<id>`
//! 3. 调用操作的 `run`，按单次超时与截止时间取较早者截断
//! 4. 生成 `OutcomeReport`，同时上报节流器与出口管理器，并广播给订阅者

use crate::config::GovernorConfig;
use crate::constants::{MAX_SOURCE_ID_LENGTH, OUTCOME_CHANNEL_CAPACITY};
use crate::egress::{EgressManager, EgressProbe, PathStats, TestSummary};
use crate::error::{GovernorError, OperationError};
use crate::failure_controller::{AttemptError, FailureController, FailureControllerStats};
use crate::log_redaction::redact_credentials;
use crate::operation::{deadline_after, AttemptContext, Operation, OutcomeKind, OutcomeReport};
#[cfg(feature = "monitoring")]
use crate::telemetry::Metrics;
use crate::throttler::{RateThrottler, ScopeKey, ScopeStats};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "monitoring")]
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

/// 需要人工处理的数据源记录
#[derive(Debug, Clone, Serialize)]
pub struct RemediationRecord {
    pub source_id: String,
    /// 已脱敏的失败原因
    pub reason: String,
    pub flagged_at: DateTime<Utc>,
}

/// Governor 统计快照
#[derive(Debug, Clone, Serialize)]
pub struct GovernorStats {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub attempts: u64,
    pub in_flight: u64,
    pub concurrency: usize,
    pub strategy: &'static str,
    pub scopes: Vec<ScopeStats>,
    pub paths: Vec<PathStats>,
    pub failure_controller: FailureControllerStats,
    pub remediation: Vec<RemediationRecord>,
}

impl GovernorStats {
    /// 导出为 JSON
    pub fn to_json(&self) -> Result<String, GovernorError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// 持有工作槽期间计入进行中的操作数
struct InFlightGuard<'a> {
    counter: &'a AtomicU64,
    #[cfg(feature = "monitoring")]
    gauge: Option<&'a prometheus::Gauge>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
        #[cfg(feature = "monitoring")]
        if let Some(gauge) = self.gauge {
            gauge.dec();
        }
    }
}

/// Governor 主控制器
///
/// 并发安全，可放在 `Arc` 中共享。
///
/// # 示例
/// ```rust
/// use egressguard::prelude::*;
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() {
///     let config = GovernorConfig::default()
///         .with_source_limit("maps", 5, Duration::from_secs(60));
///     let governor = Governor::new(config).unwrap();
///
///     let op = Operation::new("maps", |ctx| async move {
///         Ok::<_, OperationError>(format!("fetched via {}", ctx.egress.id))
///     });
///     let body = governor.submit(op).await.unwrap();
///     assert_eq!(body, "fetched via direct");
/// }
/// ```
pub struct Governor {
    throttler: RateThrottler,
    egress: EgressManager,
    failure: FailureController,
    slots: Semaphore,
    concurrency: usize,
    default_deadline: Duration,
    remediation: DashMap<String, RemediationRecord>,
    outcomes: broadcast::Sender<OutcomeReport>,
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    attempts: AtomicU64,
    in_flight: AtomicU64,
    #[cfg(feature = "monitoring")]
    metrics: Option<Arc<Metrics>>,
}

impl Governor {
    /// 创建新的 Governor 实例
    pub fn new(config: GovernorConfig) -> Result<Self, GovernorError> {
        config.validate()?;

        let concurrency = config.effective_concurrency();
        let throttler = RateThrottler::new(config.rate_limits.clone(), config.adaptive.clone())?;
        let egress = EgressManager::new(&config.egress)?;
        let failure = FailureController::new(config.circuit_breaker.clone(), config.retry.clone());
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);

        info!(
            "创建 Governor: concurrency={}, paths={}, strategy={}, default_deadline={:?}",
            concurrency,
            egress.len(),
            egress.strategy_name(),
            config.default_deadline
        );

        Ok(Self {
            throttler,
            egress,
            failure,
            slots: Semaphore::new(concurrency),
            concurrency,
            default_deadline: config.default_deadline,
            remediation: DashMap::new(),
            outcomes,
            submitted: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            #[cfg(feature = "monitoring")]
            metrics: None,
        })
    }

    /// 挂接 Prometheus 指标
    #[cfg(feature = "monitoring")]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        metrics.set_active_paths(self.egress.active_count());
        self.metrics = Some(metrics);
        self
    }

    /// 提交一个操作，返回最终结果
    #[instrument(skip(self, op), fields(operation_id = %op.id(), source = %op.source_id()))]
    pub async fn submit<T>(&self, op: Operation<T>) -> Result<T, GovernorError> {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "monitoring")]
        if let Some(metrics) = &self.metrics {
            metrics.operations_total.inc();
        }

        let result = self.run(&op).await;
        match &result {
            Ok(_) => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                debug!("操作成功");
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                debug!(kind = ?err.kind(), "操作失败: {}", err);
            }
        }
        result
    }

    /// 并发提交一批操作，结果顺序与输入一致
    pub async fn submit_batch<T>(&self, ops: Vec<Operation<T>>) -> Vec<Result<T, GovernorError>> {
        debug!("提交批量操作: {}", ops.len());
        join_all(ops.into_iter().map(|op| self.submit(op))).await
    }

    async fn run<T>(&self, op: &Operation<T>) -> Result<T, GovernorError> {
        let source_id = op.source_id();
        validate_source_id(source_id)?;

        if let Some(record) = self.remediation.get(source_id) {
            return Err(GovernorError::AuthFailure {
                source_id: source_id.to_string(),
                message: format!("等待人工处理: {}", record.reason),
            });
        }

        let deadline = op
            .deadline()
            .unwrap_or_else(|| deadline_after(Instant::now(), self.default_deadline));

        let _slot = match tokio::time::timeout_at(deadline, self.slots.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(GovernorError::ConfigError("工作槽已关闭".to_string()));
            }
            Err(_) => {
                let message = format!("source={} 等待工作槽超过截止时间", source_id);
                self.notify_deadline(op, 0, "", &message);
                return Err(GovernorError::DeadlineExceeded(message));
            }
        };
        let _in_flight = self.enter_in_flight();

        let result = self
            .failure
            .execute(source_id, deadline, op.is_idempotent(), move |attempt| {
                self.attempt(op, attempt, deadline)
            })
            .await;

        match &result {
            Err(GovernorError::AuthFailure { message, .. }) => {
                self.flag_for_remediation(source_id, message);
            }
            Err(GovernorError::CircuitOpen { retry_after, .. }) => {
                debug!(?retry_after, "熔断打开，未发起请求");
                #[cfg(feature = "monitoring")]
                if let Some(metrics) = &self.metrics {
                    metrics.record_circuit_open();
                }
            }
            _ => {}
        }
        result
    }

    fn enter_in_flight(&self) -> InFlightGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "monitoring")]
        let gauge = self.metrics.as_ref().map(|m| {
            m.in_flight.inc();
            &m.in_flight
        });
        InFlightGuard {
            counter: &self.in_flight,
            #[cfg(feature = "monitoring")]
            gauge,
        }
    }

    async fn attempt<T>(
        &self,
        op: &Operation<T>,
        attempt: u32,
        deadline: Instant,
    ) -> Result<T, AttemptError> {
        let source_id = op.source_id();
        let base_scopes = [ScopeKey::Global, ScopeKey::source(source_id)];

        let waited = match self.throttler.admit(&base_scopes, deadline).await {
            Ok(waited) => waited,
            Err(err) => return Err(self.admission_failed(op, attempt, "", err)),
        };
        #[cfg(feature = "monitoring")]
        if let Some(metrics) = &self.metrics {
            metrics.record_admission_wait(waited);
        }
        if !waited.is_zero() {
            trace!(?waited, attempt, "等待放行");
        }

        let egress = self.egress.select().map_err(AttemptError::Aborted)?;
        let egress_scope = ScopeKey::egress(egress.id.clone());
        if self.throttler.is_limited(&egress_scope) {
            if let Err(err) = self
                .throttler
                .admit(std::slice::from_ref(&egress_scope), deadline)
                .await
            {
                return Err(self.admission_failed(op, attempt, &egress.id, err));
            }
        }

        let attempt_deadline = match op.timeout() {
            Some(timeout) => deadline_after(Instant::now(), timeout).min(deadline),
            None => deadline,
        };

        self.attempts.fetch_add(1, Ordering::Relaxed);
        let egress_id = egress.id.clone();
        let ctx = AttemptContext {
            operation_id: op.id(),
            source_id: source_id.to_string(),
            attempt,
            egress,
        };

        let started = Instant::now();
        let outcome = match tokio::time::timeout_at(attempt_deadline, op.call(ctx)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(AttemptError::Operation(err)),
            Err(_) if attempt_deadline < deadline => Err(AttemptError::Operation(
                OperationError::timeout(format!(
                    "单次尝试超时 {:?}",
                    op.timeout().unwrap_or_default()
                )),
            )),
            Err(_) => Err(AttemptError::DeadlineExceeded(format!(
                "source={} 第 {} 次尝试超过截止时间",
                source_id, attempt
            ))),
        };
        let latency = started.elapsed();

        let (kind, error) = match &outcome {
            Ok(_) => (OutcomeKind::Success, None),
            Err(AttemptError::Operation(err)) => (
                OutcomeKind::from_failure(err.kind),
                Some(redact_credentials(&err.message)),
            ),
            Err(AttemptError::DeadlineExceeded(message)) => {
                (OutcomeKind::TransientFailure, Some(message.clone()))
            }
            Err(AttemptError::Aborted(err)) => {
                (OutcomeKind::TransientFailure, Some(err.to_string()))
            }
        };

        let report = OutcomeReport {
            operation_id: op.id(),
            source_id: source_id.to_string(),
            egress_id,
            attempt,
            kind,
            latency,
            timestamp: Utc::now(),
            error,
        };
        self.publish(&report, &base_scopes, egress_scope);
        outcome
    }

    fn publish(&self, report: &OutcomeReport, base_scopes: &[ScopeKey], egress_scope: ScopeKey) {
        let mut scopes = base_scopes.to_vec();
        scopes.push(egress_scope);
        self.throttler.report(&scopes, report.kind);
        self.egress.report(report);

        #[cfg(feature = "monitoring")]
        if let Some(metrics) = &self.metrics {
            metrics.record_attempt(report.kind);
            metrics.set_active_paths(self.egress.active_count());
        }

        trace!(
            egress = %report.egress_id,
            attempt = report.attempt,
            kind = report.kind.as_str(),
            latency = ?report.latency,
            "尝试结果"
        );
        // 没有订阅者时发送失败，忽略
        let _ = self.outcomes.send(report.clone());
    }

    fn admission_failed<T>(
        &self,
        op: &Operation<T>,
        attempt: u32,
        egress_id: &str,
        err: GovernorError,
    ) -> AttemptError {
        let err = admission_error(err);
        if let AttemptError::DeadlineExceeded(message) = &err {
            self.notify_deadline(op, attempt, egress_id, message);
        }
        err
    }

    /// 未触达目标的截止时间中止只通知订阅者，不影响节流与路径统计
    fn notify_deadline<T>(&self, op: &Operation<T>, attempt: u32, egress_id: &str, message: &str) {
        let report = OutcomeReport {
            operation_id: op.id(),
            source_id: op.source_id().to_string(),
            egress_id: egress_id.to_string(),
            attempt,
            kind: OutcomeKind::TransientFailure,
            latency: Duration::ZERO,
            timestamp: Utc::now(),
            error: Some(message.to_string()),
        };
        trace!(attempt, "截止时间中止: {}", message);
        let _ = self.outcomes.send(report);
    }

    fn flag_for_remediation(&self, source_id: &str, message: &str) {
        let reason = redact_credentials(message);
        warn!("数据源 {} 认证失败，已标记为需要人工处理: {}", source_id, reason);
        self.remediation.insert(
            source_id.to_string(),
            RemediationRecord {
                source_id: source_id.to_string(),
                reason,
                flagged_at: Utc::now(),
            },
        );
    }

    /// 订阅每次尝试的结果报告
    pub fn subscribe(&self) -> broadcast::Receiver<OutcomeReport> {
        self.outcomes.subscribe()
    }

    /// 需要人工处理的数据源
    pub fn sources_requiring_remediation(&self) -> Vec<RemediationRecord> {
        let mut records: Vec<RemediationRecord> =
            self.remediation.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        records
    }

    /// 解除数据源的人工处理标记，返回是否存在
    pub fn clear_remediation(&self, source_id: &str) -> bool {
        let removed = self.remediation.remove(source_id).is_some();
        if removed {
            info!("解除数据源 {} 的人工处理标记", source_id);
        }
        removed
    }

    /// 探测被拉黑的出口路径
    pub async fn test_paths(&self, probe: &dyn EgressProbe) -> TestSummary {
        let summary = self.egress.test_all(probe).await;
        #[cfg(feature = "monitoring")]
        if let Some(metrics) = &self.metrics {
            metrics.set_active_paths(self.egress.active_count());
        }
        summary
    }

    pub fn throttler(&self) -> &RateThrottler {
        &self.throttler
    }

    pub fn egress(&self) -> &EgressManager {
        &self.egress
    }

    pub fn failure_controller(&self) -> &FailureController {
        &self.failure
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// 获取统计信息
    pub fn stats(&self) -> GovernorStats {
        GovernorStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            concurrency: self.concurrency,
            strategy: self.egress.strategy_name(),
            scopes: self.throttler.stats(),
            paths: self.egress.stats(),
            failure_controller: self.failure.stats(),
            remediation: self.sources_requiring_remediation(),
        }
    }
}

fn validate_source_id(source_id: &str) -> Result<(), GovernorError> {
    if source_id.trim().is_empty() {
        return Err(GovernorError::ValidationError("数据源ID不能为空".to_string()));
    }
    if source_id.len() > MAX_SOURCE_ID_LENGTH {
        return Err(GovernorError::ValidationError(format!(
            "数据源ID过长: {} > {}",
            source_id.len(),
            MAX_SOURCE_ID_LENGTH
        )));
    }
    Ok(())
}

fn admission_error(err: GovernorError) -> AttemptError {
    match err {
        GovernorError::DeadlineExceeded(message) => AttemptError::DeadlineExceeded(message),
        other => AttemptError::Aborted(other),
    }
}
