//! 配置模块
//!
//! 定义 Governor 的配置结构，支持 YAML / TOML 加载与校验。

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::constants::*;
use crate::egress::{EgressPathConfig, RotationStrategy};
use crate::error::GovernorError;
use crate::retry::RetryConfig;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Semaphore;

/// 时长的序列化格式
///
/// 接受 `"500ms"`、`"10s"`、`"5m"`、`"1h"` 形式的字符串，或整数毫秒。
pub mod duration_format {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => Ok(Duration::from_millis(ms)),
            Raw::Text(text) => super::parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }
}

/// 解析时长字符串
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("缺少时间单位: '{}'", text))?;
    let (amount, unit) = text.split_at(split);
    let amount: u64 = amount
        .parse()
        .map_err(|_| format!("无效的时长数值: '{}'", text))?;

    match unit.trim().to_lowercase().as_str() {
        "ms" => Ok(Duration::from_millis(amount)),
        "s" => Ok(Duration::from_secs(amount)),
        "m" => scaled_secs(amount, 60, text),
        "h" => scaled_secs(amount, 3600, text),
        other => Err(format!(
            "无效的时间单位: '{}'，可选值: ms, s, m, h",
            other
        )),
    }
}

fn scaled_secs(amount: u64, factor: u64, text: &str) -> Result<Duration, String> {
    amount
        .checked_mul(factor)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("时长超出范围: '{}'", text))
}

/// 速率窗口定义
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WindowConfig {
    /// 窗口内最大请求数（名义容量）
    pub capacity: u64,
    /// 窗口时长
    #[serde(with = "duration_format")]
    pub window: Duration,
}

impl WindowConfig {
    pub fn new(capacity: u64, window: Duration) -> Self {
        Self { capacity, window }
    }

    pub fn validate(&self, scope: &str) -> Result<(), GovernorError> {
        if self.capacity == 0 {
            return Err(GovernorError::ConfigError(format!(
                "速率窗口[{}]容量不能为零",
                scope
            )));
        }
        if self.window.is_zero() {
            return Err(GovernorError::ConfigError(format!(
                "速率窗口[{}]时长不能为零",
                scope
            )));
        }
        Ok(())
    }
}

/// 各作用域的速率窗口
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RateLimitsConfig {
    /// 全局窗口
    pub global: Option<WindowConfig>,
    /// 未单独配置的数据源使用的窗口
    pub default_source: Option<WindowConfig>,
    /// 按数据源配置的窗口
    pub sources: HashMap<String, WindowConfig>,
    /// 未单独配置的出口路径使用的窗口
    pub default_egress: Option<WindowConfig>,
    /// 按出口路径配置的窗口
    pub egress: HashMap<String, WindowConfig>,
}

impl RateLimitsConfig {
    fn validate(&self) -> Result<(), GovernorError> {
        if let Some(window) = &self.global {
            window.validate("global")?;
        }
        if let Some(window) = &self.default_source {
            window.validate("default_source")?;
        }
        for (source, window) in &self.sources {
            window.validate(&format!("source:{}", source))?;
        }
        if let Some(window) = &self.default_egress {
            window.validate("default_egress")?;
        }
        for (egress, window) in &self.egress {
            window.validate(&format!("egress:{}", egress))?;
        }
        Ok(())
    }

    /// 所有已配置窗口中的最小容量
    pub fn smallest_capacity(&self) -> Option<u64> {
        self.global
            .iter()
            .chain(self.default_source.iter())
            .chain(self.sources.values())
            .chain(self.default_egress.iter())
            .chain(self.egress.values())
            .map(|w| w.capacity)
            .min()
    }
}

/// 自适应倍率配置
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// 是否启用自适应调整
    pub enabled: bool,
    /// 每 N 次结果上报重新计算一次倍率
    pub evaluation_interval: u32,
    /// 成功率不低于该值时提升倍率
    pub healthy_ratio: f64,
    /// 成功率低于该值时降低倍率
    pub degraded_ratio: f64,
    pub increase_step: f64,
    pub decrease_step: f64,
    pub min_multiplier: f64,
    pub max_multiplier: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            evaluation_interval: DEFAULT_ADAPTIVE_EVALUATION_INTERVAL,
            healthy_ratio: DEFAULT_ADAPTIVE_HEALTHY_RATIO,
            degraded_ratio: DEFAULT_ADAPTIVE_DEGRADED_RATIO,
            increase_step: DEFAULT_ADAPTIVE_INCREASE_STEP,
            decrease_step: DEFAULT_ADAPTIVE_DECREASE_STEP,
            min_multiplier: DEFAULT_ADAPTIVE_MIN_MULTIPLIER,
            max_multiplier: DEFAULT_ADAPTIVE_MAX_MULTIPLIER,
        }
    }
}

impl AdaptiveConfig {
    fn validate(&self) -> Result<(), GovernorError> {
        if self.evaluation_interval == 0 {
            return Err(GovernorError::ConfigError(
                "自适应评估间隔不能为零".to_string(),
            ));
        }
        if !(self.min_multiplier > 0.0
            && self.min_multiplier <= 1.0
            && self.max_multiplier >= 1.0)
        {
            return Err(GovernorError::ConfigError(format!(
                "自适应倍率范围无效: [{}, {}]",
                self.min_multiplier, self.max_multiplier
            )));
        }
        let in_unit = |v: f64| v > 0.0 && v <= 1.0;
        if !in_unit(self.healthy_ratio)
            || !in_unit(self.degraded_ratio)
            || self.degraded_ratio > self.healthy_ratio
        {
            return Err(GovernorError::ConfigError(format!(
                "自适应阈值无效: healthy={}, degraded={}",
                self.healthy_ratio, self.degraded_ratio
            )));
        }
        if self.increase_step < 0.0 || self.decrease_step < 0.0 {
            return Err(GovernorError::ConfigError(
                "自适应步长不能为负数".to_string(),
            ));
        }
        Ok(())
    }
}

/// 出口路径池配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EgressConfig {
    /// 轮换策略
    pub strategy: RotationStrategy,
    /// 连续失败达到该值时拉黑
    pub max_consecutive_failures: u32,
    /// 平均延迟达到该值时速度因子归零
    #[serde(with = "duration_format")]
    pub speed_ceiling: Duration,
    /// 闲置超过该时长时新鲜度因子降到 0.5
    #[serde(with = "duration_format")]
    pub recency_window: Duration,
    /// 路径列表
    pub paths: Vec<EgressPathConfig>,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            strategy: RotationStrategy::default(),
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            speed_ceiling: Duration::from_millis(DEFAULT_SPEED_CEILING_MS),
            recency_window: Duration::from_secs(DEFAULT_RECENCY_WINDOW_SECS),
            paths: vec![EgressPathConfig::direct("direct")],
        }
    }
}

impl EgressConfig {
    fn validate(&self) -> Result<(), GovernorError> {
        if self.max_consecutive_failures == 0 {
            return Err(GovernorError::ConfigError(
                "max_consecutive_failures 必须大于零".to_string(),
            ));
        }
        if self.speed_ceiling.is_zero() || self.recency_window.is_zero() {
            return Err(GovernorError::ConfigError(
                "speed_ceiling 与 recency_window 不能为零".to_string(),
            ));
        }
        if self.paths.is_empty() {
            return Err(GovernorError::ConfigError(
                "至少需要一个出口路径".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for (index, path) in self.paths.iter().enumerate() {
            if !ids.insert(&path.id) {
                return Err(GovernorError::ConfigError(format!(
                    "出口路径ID重复: {}",
                    path.id
                )));
            }
            path.validate().map_err(|e| {
                GovernorError::ConfigError(format!("出口路径[{}]校验失败: {}", index, e))
            })?;
        }
        Ok(())
    }
}

/// Governor 配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub rate_limits: RateLimitsConfig,
    pub adaptive: AdaptiveConfig,
    pub egress: EgressConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    /// 并发上限；未设置时取最小窗口容量
    pub concurrency: Option<usize>,
    /// 未携带截止时间的操作使用的默认截止时长
    #[serde(with = "duration_format")]
    pub default_deadline: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            rate_limits: RateLimitsConfig::default(),
            adaptive: AdaptiveConfig::default(),
            egress: EgressConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            concurrency: None,
            default_deadline: Duration::from_secs(DEFAULT_DEADLINE_SECS),
        }
    }
}

impl GovernorConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<(), GovernorError> {
        self.rate_limits.validate()?;
        self.adaptive.validate()?;
        self.egress.validate()?;
        self.circuit_breaker.validate()?;
        self.retry.validate()?;

        match self.concurrency {
            Some(0) => {
                return Err(GovernorError::ConfigError("并发上限不能为零".to_string()));
            }
            Some(limit) if limit > Semaphore::MAX_PERMITS => {
                return Err(GovernorError::ConfigError(format!(
                    "并发上限 {} 超过最大值 {}",
                    limit,
                    Semaphore::MAX_PERMITS
                )));
            }
            _ => {}
        }
        if self.default_deadline.is_zero() {
            return Err(GovernorError::ConfigError(
                "默认截止时长不能为零".to_string(),
            ));
        }
        Ok(())
    }

    /// 实际生效的并发上限，由窗口容量推导时不超过信号量上限
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency
            .or_else(|| {
                self.rate_limits
                    .smallest_capacity()
                    .map(|c| usize::try_from(c).unwrap_or(usize::MAX))
            })
            .unwrap_or(DEFAULT_CONCURRENCY)
            .clamp(1, Semaphore::MAX_PERMITS)
    }

    /// 从 YAML 字符串加载并校验
    pub fn from_yaml_str(text: &str) -> Result<Self, GovernorError> {
        let config: GovernorConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 从 TOML 字符串加载并校验
    pub fn from_toml_str(text: &str) -> Result<Self, GovernorError> {
        let config: GovernorConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 按扩展名从文件加载
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, GovernorError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&text),
            Some("toml") => Self::from_toml_str(&text),
            _ => Err(GovernorError::ConfigError(format!(
                "不支持的配置文件格式: {}",
                path.display()
            ))),
        }
    }

    pub fn with_global_limit(mut self, capacity: u64, window: Duration) -> Self {
        self.rate_limits.global = Some(WindowConfig::new(capacity, window));
        self
    }

    pub fn with_default_source_limit(mut self, capacity: u64, window: Duration) -> Self {
        self.rate_limits.default_source = Some(WindowConfig::new(capacity, window));
        self
    }

    pub fn with_source_limit(
        mut self,
        source: impl Into<String>,
        capacity: u64,
        window: Duration,
    ) -> Self {
        self.rate_limits
            .sources
            .insert(source.into(), WindowConfig::new(capacity, window));
        self
    }

    pub fn with_egress_limit(
        mut self,
        egress_id: impl Into<String>,
        capacity: u64,
        window: Duration,
    ) -> Self {
        self.rate_limits
            .egress
            .insert(egress_id.into(), WindowConfig::new(capacity, window));
        self
    }

    /// 替换出口路径池
    pub fn with_paths(mut self, paths: Vec<EgressPathConfig>) -> Self {
        self.egress.paths = paths;
        self
    }

    pub fn with_strategy(mut self, strategy: RotationStrategy) -> Self {
        self.egress.strategy = strategy;
        self
    }

    pub fn with_adaptive(mut self, adaptive: AdaptiveConfig) -> Self {
        self.adaptive = adaptive;
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline = deadline;
        self
    }
}
