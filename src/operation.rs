//! 受治理的操作与结果上报
//!
//! `Operation` 是调用方提交的一个工作单元；每次尝试产生一条 `OutcomeReport`。

use crate::constants::MAX_DEADLINE_SECS;
use crate::egress::EgressHandle;
use crate::error::{FailureKind, OperationError};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// 单次尝试的上下文，传给调用方的 `run`
#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub operation_id: Uuid,
    pub source_id: String,
    /// 从 0 开始的尝试序号
    pub attempt: u32,
    /// 本次尝试使用的出口路径
    pub egress: EgressHandle,
}

/// `start + budget`，超过上限的时长按上限计算
pub fn deadline_after(start: Instant, budget: Duration) -> Instant {
    let budget = budget.min(Duration::from_secs(MAX_DEADLINE_SECS));
    start.checked_add(budget).unwrap_or(start)
}

type RunFn<T> =
    Box<dyn Fn(AttemptContext) -> BoxFuture<'static, Result<T, OperationError>> + Send + Sync>;

/// 一个受治理的工作单元
///
/// `run` 每次尝试调用一次；重试是同一个 Operation 的新尝试。
///
/// # 示例
/// ```rust
/// use egressguard::operation::Operation;
/// use egressguard::error::OperationError;
/// use std::time::Duration;
///
/// let op = Operation::new("maps", |ctx| async move {
///     if ctx.attempt == 0 {
///         Err(OperationError::from_status(503, "busy"))
///     } else {
///         Ok(ctx.egress.id.clone())
///     }
/// })
/// .with_timeout(Duration::from_secs(5));
/// assert!(op.is_idempotent());
/// ```
pub struct Operation<T> {
    id: Uuid,
    source_id: String,
    run: RunFn<T>,
    idempotent: bool,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl<T> Operation<T> {
    pub fn new<F, Fut>(source_id: impl Into<String>, run: F) -> Self
    where
        F: Fn(AttemptContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, OperationError>> + Send + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            source_id: source_id.into(),
            run: Box::new(move |ctx| Box::pin(run(ctx))),
            idempotent: true,
            timeout: None,
            deadline: None,
        }
    }

    /// 设置是否可安全重试（默认可以）
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    /// 单次尝试的超时，超时按瞬时故障处理
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// 从现在起算的截止时长
    pub fn with_deadline(mut self, budget: Duration) -> Self {
        self.deadline = Some(deadline_after(Instant::now(), budget));
        self
    }

    /// 绝对截止时间
    pub fn with_deadline_at(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn call(
        &self,
        ctx: AttemptContext,
    ) -> BoxFuture<'static, Result<T, OperationError>> {
        (self.run)(ctx)
    }
}

impl<T> fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("source_id", &self.source_id)
            .field("idempotent", &self.idempotent)
            .field("timeout", &self.timeout)
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// 单次尝试的结果类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    TransientFailure,
    PermanentFailure,
    RateLimited,
}

impl OutcomeKind {
    /// 认证失败按永久失败上报
    pub fn from_failure(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Transient => OutcomeKind::TransientFailure,
            FailureKind::RateLimited => OutcomeKind::RateLimited,
            FailureKind::Permanent | FailureKind::AuthFailure => OutcomeKind::PermanentFailure,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, OutcomeKind::Success)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Success => "success",
            OutcomeKind::TransientFailure => "transient_failure",
            OutcomeKind::PermanentFailure => "permanent_failure",
            OutcomeKind::RateLimited => "rate_limited",
        }
    }
}

/// 单次尝试的结果报告
#[derive(Debug, Clone, Serialize)]
pub struct OutcomeReport {
    pub operation_id: Uuid,
    pub source_id: String,
    pub egress_id: String,
    pub attempt: u32,
    pub kind: OutcomeKind,
    #[serde(with = "crate::config::duration_format")]
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
    /// 失败信息（已脱敏）
    pub error: Option<String>,
}
