//! 熔断器实现
//!
//! 按目标（数据源）维护三状态熔断器。
//!
//! # 特性
//!
//! - **三状态**: Closed（关闭）、Open（打开）、HalfOpen（半开）
//! - **自动熔断**: 连续可重试失败达到阈值自动熔断
//! - **单探针恢复**: 冷却结束后只放行一次探测，成功即关闭
//! - **冷却翻倍**: 探测失败回到打开状态，冷却时间翻倍（有上限）
//! - **线程安全**: 状态由内部互斥锁串行化

use crate::config::duration_format;
use crate::constants::*;
use crate::error::GovernorError;
use crate::operation::deadline_after;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, trace, warn};

/// 熔断器配置
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// 失败阈值（连续可重试失败达到此值时熔断）
    pub failure_threshold: u32,
    /// 首次熔断的冷却时间
    #[serde(with = "duration_format")]
    pub cooldown: Duration,
    /// 冷却时间翻倍的上限
    #[serde(with = "duration_format")]
    pub max_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_CIRCUIT_BREAKER_FAILURE_THRESHOLD,
            cooldown: Duration::from_secs(DEFAULT_CIRCUIT_BREAKER_COOLDOWN_SECS),
            max_cooldown: Duration::from_secs(DEFAULT_CIRCUIT_BREAKER_MAX_COOLDOWN_SECS),
        }
    }
}

impl CircuitBreakerConfig {
    /// 创建新的熔断器配置
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            max_cooldown: cooldown.max(Duration::from_secs(
                DEFAULT_CIRCUIT_BREAKER_MAX_COOLDOWN_SECS,
            )),
        }
    }

    /// 设置冷却时间上限
    pub fn max_cooldown(mut self, max_cooldown: Duration) -> Self {
        self.max_cooldown = max_cooldown;
        self
    }

    pub fn validate(&self) -> Result<(), GovernorError> {
        if self.failure_threshold == 0 {
            return Err(GovernorError::ConfigError(
                "熔断失败阈值必须大于零".to_string(),
            ));
        }
        if self.cooldown.is_zero() {
            return Err(GovernorError::ConfigError("熔断冷却时间不能为零".to_string()));
        }
        if self.cooldown > self.max_cooldown {
            return Err(GovernorError::ConfigError(format!(
                "熔断冷却时间 {:?} 大于上限 {:?}",
                self.cooldown, self.max_cooldown
            )));
        }
        Ok(())
    }
}

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// 关闭状态（正常）
    Closed,
    /// 打开状态（熔断）
    Open,
    /// 半开状态（探测）
    HalfOpen,
}

/// 熔断器统计信息
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub target: String,
    pub state: CircuitState,
    /// 当前连续失败次数
    pub failure_count: u32,
    pub cooldown_ms: u64,
    /// 打开状态下距离可探测的剩余时间
    pub retry_after_ms: Option<u64>,
    pub total_calls: u64,
    pub rejected_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
}

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    cooldown: Duration,
    /// Open 状态下必有值
    reopen_at: Option<Instant>,
    last_transition: Instant,
    probe_in_flight: bool,
    successes: u64,
    failures: u64,
    last_failure_time: Option<DateTime<Utc>>,
}

/// 一次尝试的许可
///
/// 必须通过 `on_success` / `on_failure` / `on_neutral` 结算；
/// 未结算即被丢弃的探测许可会把熔断器放回可立即探测的打开状态。
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl BreakerPermit<'_> {
    /// 是否为半开状态下的探测
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// 尝试成功
    pub fn on_success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.probe);
    }

    /// 可重试的失败（瞬时、限流、超时）
    pub fn on_failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.probe);
    }

    /// 永久失败：目标有响应，不计入熔断
    pub fn on_neutral(mut self) {
        self.settled = true;
        self.breaker.record_neutral(self.probe);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.abandon_probe();
        }
    }
}

/// 单个目标的熔断器
pub struct CircuitBreaker {
    target: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    total_calls: AtomicU64,
    rejected_calls: AtomicU64,
}

impl CircuitBreaker {
    /// 创建新的熔断器
    ///
    /// # 示例
    /// ```rust
    /// use egressguard::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    /// use std::time::Duration;
    ///
    /// let breaker = CircuitBreaker::new("maps", CircuitBreakerConfig::new(3, Duration::from_secs(10)));
    /// assert_eq!(breaker.state(), CircuitState::Closed);
    /// ```
    pub fn new(target: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let target = target.into();
        trace!(
            "创建熔断器: target={}, failure_threshold={}, cooldown={:?}",
            target,
            config.failure_threshold,
            config.cooldown
        );

        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                cooldown: config.cooldown,
                reopen_at: None,
                last_transition: Instant::now(),
                probe_in_flight: false,
                successes: 0,
                failures: 0,
                last_failure_time: None,
            }),
            target,
            config,
            total_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// 申请一次尝试许可
    ///
    /// 打开且冷却未结束，或半开且探测进行中时返回 `CircuitOpen`，不会发起任何调用。
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, GovernorError> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let reopen_at = inner.reopen_at.unwrap_or(now);
                if now < reopen_at {
                    drop(inner);
                    return Err(self.reject(reopen_at - now));
                }
                inner.state = CircuitState::HalfOpen;
                inner.last_transition = now;
                inner.probe_in_flight = true;
                info!("熔断器状态变更: target={}, Open -> HalfOpen", self.target);
                true
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    drop(inner);
                    warn!("半开状态探测进行中，拒绝请求: target={}", self.target);
                    return Err(self.reject(Duration::ZERO));
                }
                inner.probe_in_flight = true;
                true
            }
        };

        Ok(BreakerPermit {
            breaker: self,
            probe,
            settled: false,
        })
    }

    fn reject(&self, retry_after: Duration) -> GovernorError {
        self.rejected_calls.fetch_add(1, Ordering::Relaxed);
        trace!("熔断器打开，拒绝请求: target={}", self.target);
        GovernorError::CircuitOpen {
            target: self.target.clone(),
            retry_after,
        }
    }

    fn record_success(&self, probe: bool) {
        let mut inner = self.inner.lock();
        inner.successes += 1;
        if probe && inner.state == CircuitState::HalfOpen {
            Self::close(&mut inner, &self.config);
            info!("熔断器状态变更: target={}, HalfOpen -> Closed", self.target);
        } else if inner.state == CircuitState::Closed {
            inner.failure_count = 0;
        }
    }

    fn record_failure(&self, probe: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.failures += 1;
        inner.last_failure_time = Some(Utc::now());

        if probe && inner.state == CircuitState::HalfOpen {
            let doubled = inner.cooldown.saturating_mul(2).min(self.config.max_cooldown);
            inner.cooldown = doubled;
            Self::open(&mut inner, now);
            warn!(
                "熔断器状态变更: target={}, HalfOpen -> Open (cooldown={:?})",
                self.target, doubled
            );
            return;
        }

        inner.failure_count += 1;
        if inner.state == CircuitState::Closed
            && inner.failure_count >= self.config.failure_threshold
        {
            Self::open(&mut inner, now);
            warn!(
                "熔断器状态变更: target={}, Closed -> Open (failure_count={}, cooldown={:?})",
                self.target, inner.failure_count, inner.cooldown
            );
        } else {
            trace!(
                "操作失败: target={}, {}/{}",
                self.target,
                inner.failure_count,
                self.config.failure_threshold
            );
        }
    }

    fn record_neutral(&self, probe: bool) {
        if probe {
            // 探测得到了目标的明确响应，说明目标可达
            self.record_success(true);
        }
    }

    fn abandon_probe(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
            inner.reopen_at = Some(now);
            inner.last_transition = now;
            inner.probe_in_flight = false;
            trace!("探测被取消，等待下一次探测: target={}", self.target);
        }
    }

    fn open(inner: &mut BreakerInner, now: Instant) {
        inner.state = CircuitState::Open;
        inner.reopen_at = Some(deadline_after(now, inner.cooldown));
        inner.last_transition = now;
        inner.probe_in_flight = false;
    }

    fn close(inner: &mut BreakerInner, config: &CircuitBreakerConfig) {
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.cooldown = config.cooldown;
        inner.reopen_at = None;
        inner.last_transition = Instant::now();
        inner.probe_in_flight = false;
    }

    /// 获取当前状态
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// 当前冷却时间
    pub fn cooldown(&self) -> Duration {
        self.inner.lock().cooldown
    }

    /// 重置熔断器到关闭状态
    pub fn reset(&self) {
        info!("重置熔断器: target={}", self.target);
        let mut inner = self.inner.lock();
        Self::close(&mut inner, &self.config);
    }

    /// 获取统计信息
    pub fn stats(&self) -> CircuitStats {
        let now = Instant::now();
        let inner = self.inner.lock();
        let since_change = now.saturating_duration_since(inner.last_transition);
        let last_state_change = chrono::Duration::from_std(since_change)
            .map(|d| Utc::now() - d)
            .unwrap_or_else(|_| Utc::now());

        CircuitStats {
            target: self.target.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            cooldown_ms: inner.cooldown.as_millis() as u64,
            retry_after_ms: match inner.state {
                CircuitState::Open => inner
                    .reopen_at
                    .map(|t| t.saturating_duration_since(now).as_millis() as u64),
                _ => None,
            },
            total_calls: self.total_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            successes: inner.successes,
            failures: inner.failures,
            last_failure_time: inner.last_failure_time,
            last_state_change,
        }
    }

    /// 获取配置
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

/// 按目标索引的熔断器表
pub struct CircuitRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// 获取（必要时创建）目标的熔断器
    pub fn breaker(&self, target: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(target) {
            return existing.clone();
        }
        self.breakers
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(target, self.config.clone())))
            .clone()
    }

    pub fn state(&self, target: &str) -> Option<CircuitState> {
        self.breakers.get(target).map(|b| b.state())
    }

    /// 重置目标的熔断器，返回是否存在
    pub fn reset(&self, target: &str) -> bool {
        match self.breakers.get(target) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> Vec<CircuitStats> {
        let mut stats: Vec<CircuitStats> = self.breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.target.cmp(&b.target));
        stats
    }
}
