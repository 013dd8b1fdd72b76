//! 出口路径管理器
//!
//! 维护路径池，按策略选择路径，根据结果上报更新健康度并拉黑不健康路径。
//! 拉黑是单调的：只有 `test_all` 探测成功或显式重置才会恢复。

use super::path::{
    EgressHandle, EgressPath, EgressPathConfig, HealthParams, PathState, PathStats, PathTransition,
};
use super::strategy::{RotationStrategy, SelectionStrategy};
use crate::config::EgressConfig;
use crate::error::GovernorError;
use crate::log_redaction::redact_basic;
use crate::operation::OutcomeReport;
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

/// 轻量探测，用于判断被拉黑的路径是否恢复
#[async_trait]
pub trait EgressProbe: Send + Sync {
    async fn probe(&self, path: &EgressHandle) -> bool;
}

/// 将闭包适配为探测器
pub struct FnProbe<F>(pub F);

#[async_trait]
impl<F, Fut> EgressProbe for FnProbe<F>
where
    F: Fn(EgressHandle) -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    async fn probe(&self, path: &EgressHandle) -> bool {
        (self.0)(path.clone()).await
    }
}

/// `test_all` 的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TestSummary {
    pub probed: usize,
    pub reactivated: usize,
    pub still_blacklisted: usize,
}

struct PoolState {
    paths: Vec<EgressPath>,
    /// 下一个选择序号
    sequence: u64,
}

/// 出口路径管理器
pub struct EgressManager {
    pool: Mutex<PoolState>,
    strategy: Arc<dyn SelectionStrategy>,
    max_consecutive_failures: u32,
    health: HealthParams,
}

impl EgressManager {
    /// 根据配置创建管理器
    pub fn new(config: &EgressConfig) -> Result<Self, GovernorError> {
        Self::with_strategy(config, config.strategy.build())
    }

    /// 使用自定义选择策略创建管理器
    pub fn with_strategy(
        config: &EgressConfig,
        strategy: Arc<dyn SelectionStrategy>,
    ) -> Result<Self, GovernorError> {
        if config.max_consecutive_failures == 0 {
            return Err(GovernorError::ConfigError(
                "max_consecutive_failures 必须大于零".to_string(),
            ));
        }

        let mut paths: Vec<EgressPath> = Vec::with_capacity(config.paths.len());
        for path in &config.paths {
            path.validate().map_err(GovernorError::ConfigError)?;
            if paths.iter().any(|p| p.id() == path.id) {
                return Err(GovernorError::ConfigError(format!(
                    "出口路径ID重复: {}",
                    path.id
                )));
            }
            paths.push(EgressPath::new(path.clone().into_handle()));
        }

        info!(
            "创建出口管理器: paths={}, strategy={}, max_consecutive_failures={}",
            paths.len(),
            strategy.name(),
            config.max_consecutive_failures
        );

        Ok(Self {
            pool: Mutex::new(PoolState { paths, sequence: 0 }),
            strategy,
            max_consecutive_failures: config.max_consecutive_failures,
            health: HealthParams {
                speed_ceiling: config.speed_ceiling,
                recency_window: config.recency_window,
            },
        })
    }

    /// 内置策略下的便捷构造
    pub fn from_paths(
        paths: Vec<EgressPathConfig>,
        strategy: RotationStrategy,
    ) -> Result<Self, GovernorError> {
        let config = EgressConfig {
            strategy,
            paths,
            ..Default::default()
        };
        Self::new(&config)
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// 选择一条活跃路径
    pub fn select(&self) -> Result<EgressHandle, GovernorError> {
        let now = Instant::now();
        let mut pool = self.pool.lock();

        let candidates: Vec<_> = pool
            .paths
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_active())
            .map(|(i, p)| p.snapshot(i, now, &self.health))
            .collect();

        if candidates.is_empty() {
            warn!("没有可用的出口路径");
            return Err(GovernorError::NoPathsAvailable);
        }

        let picked = self
            .strategy
            .select(&candidates)
            .and_then(|i| candidates.get(i))
            .map(|c| c.index)
            .ok_or(GovernorError::NoPathsAvailable)?;

        let sequence = pool.sequence;
        pool.sequence += 1;
        let path = &mut pool.paths[picked];
        path.mark_selected(sequence, now);
        trace!(path = path.id(), sequence, "选中出口路径");
        Ok(path.handle().clone())
    }

    /// 上报一次尝试结果
    pub fn report(&self, report: &OutcomeReport) -> PathTransition {
        let mut pool = self.pool.lock();
        let Some(path) = pool.paths.iter_mut().find(|p| p.id() == report.egress_id) else {
            debug!(egress = %report.egress_id, "上报的路径不在池中，忽略");
            return PathTransition::Unchanged;
        };

        let transition = path.record(
            report.kind,
            report.latency,
            report.error.as_deref(),
            self.max_consecutive_failures,
        );
        if transition == PathTransition::Blacklisted {
            warn!(
                "出口路径 {} 连续失败 {} 次，已拉黑",
                path.id(),
                path.consecutive_failures()
            );
        }
        transition
    }

    /// 探测所有被拉黑的路径，探测成功的重新激活
    #[instrument(skip(self, probe))]
    pub async fn test_all(&self, probe: &dyn EgressProbe) -> TestSummary {
        let blacklisted: Vec<EgressHandle> = {
            let pool = self.pool.lock();
            pool.paths
                .iter()
                .filter(|p| p.state() == PathState::Blacklisted)
                .map(|p| p.handle().clone())
                .collect()
        };

        let results = join_all(blacklisted.iter().map(|handle| async move {
            let healthy = probe.probe(handle).await;
            (handle.id.clone(), healthy)
        }))
        .await;

        let mut summary = TestSummary {
            probed: results.len(),
            ..Default::default()
        };

        let mut pool = self.pool.lock();
        for (id, healthy) in results {
            let Some(path) = pool.paths.iter_mut().find(|p| p.id() == id) else {
                continue;
            };
            if healthy && path.state() == PathState::Blacklisted {
                path.reactivate();
                summary.reactivated += 1;
                info!("出口路径 {} 探测成功，已恢复", id);
            } else if path.state() == PathState::Blacklisted {
                summary.still_blacklisted += 1;
                debug!("出口路径 {} 探测失败，保持拉黑", id);
            }
        }

        info!(
            "出口路径巡检完成: probed={}, reactivated={}, still_blacklisted={}",
            summary.probed, summary.reactivated, summary.still_blacklisted
        );
        summary
    }

    /// 加入新路径
    pub fn add_path(&self, config: EgressPathConfig) -> Result<(), GovernorError> {
        config.validate().map_err(GovernorError::ValidationError)?;
        let mut pool = self.pool.lock();
        if pool.paths.iter().any(|p| p.id() == config.id) {
            return Err(GovernorError::ValidationError(format!(
                "出口路径ID重复: {}",
                config.id
            )));
        }
        info!(
            "加入出口路径: {} (protocol={:?}, user={})",
            config.id,
            config.protocol,
            redact_basic(config.username.as_deref())
        );
        pool.paths.push(EgressPath::new(config.into_handle()));
        Ok(())
    }

    /// 移除路径，返回是否存在
    pub fn remove_path(&self, id: &str) -> bool {
        let mut pool = self.pool.lock();
        let before = pool.paths.len();
        pool.paths.retain(|p| p.id() != id);
        let removed = pool.paths.len() != before;
        if removed {
            info!("移除出口路径: {}", id);
        }
        removed
    }

    /// 显式重置单条路径（恢复并清空统计）
    pub fn reset_path(&self, id: &str) -> bool {
        let mut pool = self.pool.lock();
        match pool.paths.iter_mut().find(|p| p.id() == id) {
            Some(path) => {
                path.reactivate();
                info!("重置出口路径: {}", id);
                true
            }
            None => false,
        }
    }

    /// 重置全部路径
    pub fn reset_all(&self) {
        let mut pool = self.pool.lock();
        for path in pool.paths.iter_mut() {
            path.reactivate();
        }
        info!("重置全部出口路径: {}", pool.paths.len());
    }

    pub fn active_count(&self) -> usize {
        self.pool.lock().paths.iter().filter(|p| p.is_active()).count()
    }

    pub fn len(&self) -> usize {
        self.pool.lock().paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 单条路径的统计
    pub fn path_stats(&self, id: &str) -> Option<PathStats> {
        let now = Instant::now();
        let pool = self.pool.lock();
        pool.paths
            .iter()
            .find(|p| p.id() == id)
            .map(|p| p.stats(now, &self.health))
    }

    /// 全部路径的统计
    pub fn stats(&self) -> Vec<PathStats> {
        let now = Instant::now();
        let pool = self.pool.lock();
        pool.paths.iter().map(|p| p.stats(now, &self.health)).collect()
    }
}
