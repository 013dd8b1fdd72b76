//! 重试策略
//!
//! 指数退避：第 n 次重试前等待 `base × 2^n × (1 + jitter)`，并截断到上限。
//! 抖动比例不超过 1，保证相邻重试的等待时间不递减。

use crate::config::duration_format;
use crate::constants::*;
use crate::error::GovernorError;
use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

/// 重试配置
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 首次尝试之后的最大重试次数
    pub max_retries: u32,
    #[serde(with = "duration_format")]
    pub base_backoff: Duration,
    #[serde(with = "duration_format")]
    pub max_backoff: Duration,
    /// 抖动比例，取值 [0, 1]
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_backoff: Duration::from_millis(DEFAULT_BASE_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            jitter_ratio: DEFAULT_JITTER_RATIO,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            base_backoff,
            max_backoff,
            jitter_ratio: DEFAULT_JITTER_RATIO,
        }
    }

    /// 不重试
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_jitter(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio;
        self
    }

    pub fn validate(&self) -> Result<(), GovernorError> {
        if self.base_backoff > self.max_backoff {
            return Err(GovernorError::ConfigError(format!(
                "基础退避 {:?} 大于退避上限 {:?}",
                self.base_backoff, self.max_backoff
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(GovernorError::ConfigError(format!(
                "抖动比例必须在 [0, 1] 之间: {}",
                self.jitter_ratio
            )));
        }
        Ok(())
    }

    /// 第 `attempt` 次失败后的退避时间（attempt 从 0 开始）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_ratio > 0.0 {
            rand::rng().random::<f64>() * self.jitter_ratio
        } else {
            0.0
        };
        self.delay_with_jitter(attempt, jitter)
    }

    fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let factor = 2f64.powi(attempt.min(32) as i32) * (1.0 + jitter);
        let delay = self.base_backoff.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(delay)
    }
}
