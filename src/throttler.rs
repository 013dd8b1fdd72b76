//! 速率节流器
//!
//! 在多个作用域（全局、数据源、出口路径）上维护滚动时间窗口，
//! 所有作用域同时有余量时才放行；否则返回需要等待的最短时间。
//!
//! # 特性
//!
//! - **滚动窗口**: 丢弃早于 `now - window` 的记录，不按日历分桶
//! - **多作用域原子放行**: 一次加锁内检查并记录全部作用域
//! - **自适应倍率**: 每 N 次结果上报按成功率调整有效容量
//! - **限流即时收缩**: 收到 429 等价结果时立即降低倍率

use crate::config::{AdaptiveConfig, RateLimitsConfig, WindowConfig};
use crate::error::GovernorError;
use crate::operation::OutcomeKind;
use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

/// 节流作用域
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum ScopeKey {
    Global,
    Source(String),
    Egress(String),
}

impl ScopeKey {
    pub fn source(id: impl Into<String>) -> Self {
        ScopeKey::Source(id.into())
    }

    pub fn egress(id: impl Into<String>) -> Self {
        ScopeKey::Egress(id.into())
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKey::Global => write!(f, "global"),
            ScopeKey::Source(id) => write!(f, "source:{}", id),
            ScopeKey::Egress(id) => write!(f, "egress:{}", id),
        }
    }
}

/// 放行结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// 已放行（并已计入所有作用域）
    Granted,
    /// 需要等待后重试
    Wait(Duration),
}

/// 单个作用域的滚动窗口
#[derive(Debug)]
pub struct RateWindow {
    scope: ScopeKey,
    capacity: u64,
    window: Duration,
    /// 窗口内已放行请求的时间戳
    admitted: VecDeque<Instant>,
    multiplier: f64,
    reports_since_eval: u32,
    successes_since_eval: u32,
    total_admitted: u64,
    total_reports: u64,
}

impl RateWindow {
    fn new(scope: ScopeKey, config: &WindowConfig) -> Self {
        Self {
            scope,
            capacity: config.capacity,
            window: config.window,
            admitted: VecDeque::new(),
            multiplier: 1.0,
            reports_since_eval: 0,
            successes_since_eval: 0,
            total_admitted: 0,
            total_reports: 0,
        }
    }

    /// 当前有效容量：`capacity × multiplier`，至少为 1
    pub fn effective_capacity(&self) -> u64 {
        ((self.capacity as f64 * self.multiplier).floor() as u64).max(1)
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.admitted.front() {
            if front.checked_add(self.window).is_some_and(|end| end <= now) {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    /// 距离出现空位还需等待的时间；有空位时返回 `None`
    fn wait_time(&mut self, now: Instant) -> Option<Duration> {
        self.prune(now);
        let limit = self.effective_capacity() as usize;
        if self.admitted.len() < limit {
            return None;
        }
        // 需要有 len - limit + 1 条记录过期，第 (len - limit) 条过期时即有空位
        let pivot = self.admitted[self.admitted.len() - limit];
        Some(
            pivot
                .checked_add(self.window)
                .map_or(Duration::MAX, |end| end.saturating_duration_since(now)),
        )
    }

    fn record(&mut self, now: Instant) {
        self.admitted.push_back(now);
        self.total_admitted += 1;
    }

    fn decrease(&mut self, adaptive: &AdaptiveConfig) -> bool {
        let next = (self.multiplier - adaptive.decrease_step).max(adaptive.min_multiplier);
        let changed = next < self.multiplier;
        self.multiplier = next;
        changed
    }

    fn increase(&mut self, adaptive: &AdaptiveConfig) -> bool {
        let next = (self.multiplier + adaptive.increase_step).min(adaptive.max_multiplier);
        let changed = next > self.multiplier;
        self.multiplier = next;
        changed
    }

    /// 吸收一次结果上报，返回倍率是否变化
    fn apply_report(&mut self, kind: OutcomeKind, adaptive: &AdaptiveConfig) -> bool {
        // 永久失败说明请求本身有问题，不反映目标的承载能力
        if kind == OutcomeKind::PermanentFailure {
            return false;
        }

        self.total_reports += 1;
        self.reports_since_eval += 1;
        if kind == OutcomeKind::Success {
            self.successes_since_eval += 1;
        }

        let mut changed = false;
        if kind == OutcomeKind::RateLimited {
            changed |= self.decrease(adaptive);
        }

        if self.reports_since_eval >= adaptive.evaluation_interval {
            let ratio = self.successes_since_eval as f64 / self.reports_since_eval as f64;
            if ratio >= adaptive.healthy_ratio {
                changed |= self.increase(adaptive);
            } else if ratio < adaptive.degraded_ratio {
                changed |= self.decrease(adaptive);
            }
            trace!(scope = %self.scope, ratio, multiplier = self.multiplier, "自适应评估");
            self.reports_since_eval = 0;
            self.successes_since_eval = 0;
        }

        changed
    }

    fn stats(&self) -> ScopeStats {
        ScopeStats {
            scope: self.scope.clone(),
            capacity: self.capacity,
            window_ms: self.window.as_millis() as u64,
            multiplier: self.multiplier,
            effective_capacity: self.effective_capacity(),
            current_count: self.admitted.len() as u64,
            total_admitted: self.total_admitted,
            total_reports: self.total_reports,
        }
    }
}

/// 作用域统计信息
#[derive(Debug, Clone, Serialize)]
pub struct ScopeStats {
    pub scope: ScopeKey,
    pub capacity: u64,
    pub window_ms: u64,
    pub multiplier: f64,
    pub effective_capacity: u64,
    pub current_count: u64,
    pub total_admitted: u64,
    pub total_reports: u64,
}

/// 多作用域速率节流器
pub struct RateThrottler {
    limits: RateLimitsConfig,
    adaptive: AdaptiveConfig,
    windows: Mutex<HashMap<ScopeKey, RateWindow>>,
}

impl RateThrottler {
    /// 创建节流器，非法窗口在此处被拒绝
    pub fn new(limits: RateLimitsConfig, adaptive: AdaptiveConfig) -> Result<Self, GovernorError> {
        if let Some(window) = &limits.global {
            window.validate("global")?;
        }
        for (source, window) in &limits.sources {
            window.validate(&format!("source:{}", source))?;
        }
        if let Some(window) = &limits.default_source {
            window.validate("default_source")?;
        }
        for (egress, window) in &limits.egress {
            window.validate(&format!("egress:{}", egress))?;
        }
        if let Some(window) = &limits.default_egress {
            window.validate("default_egress")?;
        }

        info!(
            "创建速率节流器: global={:?}, sources={}, egress={}",
            limits.global,
            limits.sources.len(),
            limits.egress.len()
        );

        Ok(Self {
            limits,
            adaptive,
            windows: Mutex::new(HashMap::new()),
        })
    }

    /// 不限速的节流器
    pub fn unlimited() -> Self {
        Self {
            limits: RateLimitsConfig::default(),
            adaptive: AdaptiveConfig::default(),
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn window_config(&self, scope: &ScopeKey) -> Option<&WindowConfig> {
        match scope {
            ScopeKey::Global => self.limits.global.as_ref(),
            ScopeKey::Source(id) => self
                .limits
                .sources
                .get(id)
                .or(self.limits.default_source.as_ref()),
            ScopeKey::Egress(id) => self
                .limits
                .egress
                .get(id)
                .or(self.limits.default_egress.as_ref()),
        }
    }

    /// 作用域是否受限
    pub fn is_limited(&self, scope: &ScopeKey) -> bool {
        self.window_config(scope).is_some()
    }

    /// 非阻塞放行检查
    ///
    /// 全部作用域都有余量时一次性记入并返回 `Granted`；否则不记录任何作用域，
    /// 返回饱和作用域中最短的等待时间。未配置窗口的作用域不受限。
    pub fn try_admit(&self, scopes: &[ScopeKey]) -> Admission {
        let now = Instant::now();
        let mut windows = self.windows.lock();

        let mut min_wait: Option<Duration> = None;
        for scope in scopes {
            let Some(config) = self.window_config(scope) else {
                continue;
            };
            let window = windows
                .entry(scope.clone())
                .or_insert_with(|| RateWindow::new(scope.clone(), config));
            if let Some(wait) = window.wait_time(now) {
                min_wait = Some(min_wait.map_or(wait, |w| w.min(wait)));
            }
        }

        if let Some(wait) = min_wait {
            trace!(?scopes, ?wait, "作用域饱和");
            return Admission::Wait(wait);
        }

        for scope in scopes {
            if let Some(window) = windows.get_mut(scope) {
                window.record(now);
            }
        }
        Admission::Granted
    }

    /// 等待放行，直到截止时间
    ///
    /// 返回实际等待的时长；等待会越过截止时间时返回 `DeadlineExceeded`。
    #[instrument(skip(self))]
    pub async fn admit(
        &self,
        scopes: &[ScopeKey],
        deadline: Instant,
    ) -> Result<Duration, GovernorError> {
        let start = Instant::now();
        loop {
            match self.try_admit(scopes) {
                Admission::Granted => return Ok(start.elapsed()),
                Admission::Wait(wait) => {
                    let now = Instant::now();
                    if now.checked_add(wait).map_or(true, |resume| resume > deadline) {
                        debug!(?wait, "等待放行会超过截止时间");
                        return Err(GovernorError::DeadlineExceeded(format!(
                            "等待放行 {:?} 超过截止时间",
                            wait
                        )));
                    }
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// 上报一次尝试的结果，驱动自适应倍率
    pub fn report(&self, scopes: &[ScopeKey], kind: OutcomeKind) {
        if !self.adaptive.enabled {
            return;
        }
        let mut windows = self.windows.lock();
        for scope in scopes {
            let Some(config) = self.window_config(scope) else {
                continue;
            };
            let window = windows
                .entry(scope.clone())
                .or_insert_with(|| RateWindow::new(scope.clone(), config));
            let before = window.multiplier;
            if window.apply_report(kind, &self.adaptive) {
                if window.multiplier < before {
                    warn!(
                        "作用域 {} 倍率下调: {:.2} -> {:.2}",
                        scope, before, window.multiplier
                    );
                } else {
                    info!(
                        "作用域 {} 倍率上调: {:.2} -> {:.2}",
                        scope, before, window.multiplier
                    );
                }
            }
        }
    }

    /// 当前倍率（作用域未受限或未使用过时返回 `None`）
    pub fn multiplier(&self, scope: &ScopeKey) -> Option<f64> {
        self.windows.lock().get(scope).map(|w| w.multiplier)
    }

    /// 所有已激活作用域的统计
    pub fn stats(&self) -> Vec<ScopeStats> {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let mut stats: Vec<ScopeStats> = windows
            .values_mut()
            .map(|w| {
                w.prune(now);
                w.stats()
            })
            .collect();
        stats.sort_by_key(|s| s.scope.to_string());
        stats
    }
}
