//! 测试通用工具模块
//!
//! 提供测试中常用的工具函数和模拟目标。

#![allow(dead_code)]

use dashmap::{DashMap, DashSet};
use egressguard::{
    egress::EgressPathConfig,
    error::OperationError,
    operation::{AttemptContext, Operation},
    retry::RetryConfig,
    GovernorConfig,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 按 ID 创建直连路径
pub fn direct_paths(ids: &[&str]) -> Vec<EgressPathConfig> {
    ids.iter().map(|id| EgressPathConfig::direct(*id)).collect()
}

/// 无抖动的快速重试
pub fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig::new(max_retries, Duration::from_millis(10), Duration::from_millis(100))
        .with_jitter(0.0)
}

/// 三条直连路径、快速重试的测试配置
pub fn create_test_config() -> GovernorConfig {
    GovernorConfig::default()
        .with_paths(direct_paths(&["A", "B", "C"]))
        .with_retry(fast_retry(3))
}

/// 模拟的外部目标
///
/// 经由被标记为故障的出口访问时返回 503，否则成功。
#[derive(Default)]
pub struct ScriptedTarget {
    failing_paths: DashSet<String>,
    calls: AtomicU32,
    calls_by_path: DashMap<String, u32>,
}

impl ScriptedTarget {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_path(&self, id: &str) {
        self.failing_paths.insert(id.to_string());
    }

    pub fn heal_path(&self, id: &str) {
        self.failing_paths.remove(id);
    }

    pub fn is_failing(&self, id: &str) -> bool {
        self.failing_paths.contains(id)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_via(&self, id: &str) -> u32 {
        self.calls_by_path.get(id).map(|c| *c).unwrap_or(0)
    }

    fn handle(&self, ctx: &AttemptContext) -> Result<String, OperationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.calls_by_path.entry(ctx.egress.id.clone()).or_insert(0) += 1;
        if self.failing_paths.contains(&ctx.egress.id) {
            Err(OperationError::from_status(
                503,
                format!("proxy {} unavailable", ctx.egress.id),
            ))
        } else {
            Ok(format!("{}@{}", ctx.source_id, ctx.egress.id))
        }
    }

    /// 针对该目标的操作
    pub fn operation(self: &Arc<Self>, source: &str) -> Operation<String> {
        let target = Arc::clone(self);
        Operation::new(source, move |ctx: AttemptContext| {
            let result = target.handle(&ctx);
            async move { result }
        })
    }
}

/// 总是以指定状态码失败的操作
pub fn failing_operation(source: &str, status: u16) -> Operation<()> {
    Operation::new(source, move |_ctx: AttemptContext| async move {
        Err(OperationError::from_status(status, format!("status {}", status)))
    })
}

/// 返回所用出口 ID 的操作
pub fn echo_operation(source: &str) -> Operation<String> {
    Operation::new(source, |ctx: AttemptContext| async move {
        Ok::<_, OperationError>(ctx.egress.id.clone())
    })
}
