//! 出口路径选择策略
//!
//! 每个策略都是作用在当前路径池快照上的纯选择函数，
//! 轮询顺序由快照中的 `last_selected` 序号决定，不依赖隐藏游标。

use super::path::PathSnapshot;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

/// 选择策略 trait
pub trait SelectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// 从候选快照中选出一个，返回其在 `candidates` 中的下标
    fn select(&self, candidates: &[PathSnapshot]) -> Option<usize>;
}

/// 内置轮换策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    /// 严格轮询
    #[default]
    RoundRobin,
    /// 均匀随机
    Random,
    /// 累计使用次数最少
    LeastUsed,
    /// 平均延迟最低（至少成功过一次）
    Fastest,
    /// 按健康评分加权随机
    #[serde(alias = "weighted_by_score")]
    Weighted,
}

impl RotationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationStrategy::RoundRobin => "round_robin",
            RotationStrategy::Random => "random",
            RotationStrategy::LeastUsed => "least_used",
            RotationStrategy::Fastest => "fastest",
            RotationStrategy::Weighted => "weighted",
        }
    }

    /// 构造对应的策略实现
    pub fn build(&self) -> Arc<dyn SelectionStrategy> {
        match self {
            RotationStrategy::RoundRobin => Arc::new(RoundRobin),
            RotationStrategy::Random => Arc::new(RandomChoice),
            RotationStrategy::LeastUsed => Arc::new(LeastUsed),
            RotationStrategy::Fastest => Arc::new(Fastest),
            RotationStrategy::Weighted => Arc::new(WeightedByScore),
        }
    }
}

impl FromStr for RotationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "round_robin" | "roundrobin" => Ok(RotationStrategy::RoundRobin),
            "random" => Ok(RotationStrategy::Random),
            "least_used" => Ok(RotationStrategy::LeastUsed),
            "fastest" => Ok(RotationStrategy::Fastest),
            "weighted" | "weighted_by_score" => Ok(RotationStrategy::Weighted),
            other => Err(format!("未知的轮换策略: {}", other)),
        }
    }
}

/// 严格轮询：选最久未被选中的路径，从未选中的按池中顺序优先
pub struct RoundRobin;

impl SelectionStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(&self, candidates: &[PathSnapshot]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| (c.last_selected, c.index))
            .map(|(i, _)| i)
    }
}

pub struct RandomChoice;

impl SelectionStrategy for RandomChoice {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select(&self, candidates: &[PathSnapshot]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(rand::rng().random_range(0..candidates.len()))
    }
}

pub struct LeastUsed;

impl SelectionStrategy for LeastUsed {
    fn name(&self) -> &'static str {
        "least_used"
    }

    fn select(&self, candidates: &[PathSnapshot]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| (c.uses, c.index))
            .map(|(i, _)| i)
    }
}

/// 平均延迟最低；没有任何路径成功过时退化为轮询
pub struct Fastest;

impl SelectionStrategy for Fastest {
    fn name(&self) -> &'static str {
        "fastest"
    }

    fn select(&self, candidates: &[PathSnapshot]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.successes > 0)
            .filter_map(|(i, c)| c.average_latency.map(|latency| (i, latency, c.index)))
            .min_by_key(|(_, latency, index)| (*latency, *index))
            .map(|(i, _, _)| i)
            .or_else(|| RoundRobin.select(candidates))
    }
}

/// 按健康评分的比例随机选择；评分全为零时均匀随机
pub struct WeightedByScore;

impl SelectionStrategy for WeightedByScore {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn select(&self, candidates: &[PathSnapshot]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let total: f64 = candidates.iter().map(|c| c.health_score.max(0.0)).sum();
        if total <= f64::EPSILON {
            return RandomChoice.select(candidates);
        }

        let target = rand::rng().random::<f64>() * total;
        let mut cumulative = 0.0;
        for (i, candidate) in candidates.iter().enumerate() {
            cumulative += candidate.health_score.max(0.0);
            if target < cumulative {
                return Some(i);
            }
        }
        // 浮点累加误差时落到最后一个正分路径
        candidates.iter().rposition(|c| c.health_score > 0.0)
    }
}
