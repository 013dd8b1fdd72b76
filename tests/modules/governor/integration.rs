//! Governor 模块集成测试
//!
//! 测试 Governor 与节流器、出口管理器、失败控制器的协作

use crate::common::*;
use egressguard::error::{ErrorKind, OperationError};
use egressguard::operation::{AttemptContext, Operation, OutcomeKind};
use egressguard::retry::RetryConfig;
use egressguard::throttler::ScopeKey;
use egressguard::{Governor, GovernorConfig, RotationStrategy};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// 三条路径轮询、不限速：6 个操作依次使用 A,B,C,A,B,C
#[tokio::test(start_paused = true)]
async fn test_round_robin_scenario() {
    let config = create_test_config().with_strategy(RotationStrategy::RoundRobin);
    let governor = Governor::new(config).unwrap();

    let mut used = Vec::new();
    for _ in 0..6 {
        used.push(governor.submit(echo_operation("webpage")).await.unwrap());
    }
    assert_eq!(used, vec!["A", "B", "C", "A", "B", "C"]);
}

/// 容量 5/60s：7 个同时提交，5 个立即执行，第 6、7 个等待窗口滚动
#[tokio::test(start_paused = true)]
async fn test_rate_window_scenario() {
    let config = create_test_config()
        .with_source_limit("maps", 5, Duration::from_secs(60))
        .with_default_deadline(Duration::from_secs(300));
    let governor = Arc::new(Governor::new(config).unwrap());
    let start = Instant::now();

    let mut handles = Vec::new();
    for _ in 0..7 {
        let governor = governor.clone();
        handles.push(tokio::spawn(async move {
            let op = Operation::new("maps", move |_ctx: AttemptContext| async move {
                Ok::<_, OperationError>(start.elapsed())
            });
            governor.submit(op).await.unwrap()
        }));
    }

    let mut started_at = Vec::new();
    for handle in handles {
        started_at.push(handle.await.unwrap());
    }
    started_at.sort();

    assert!(started_at[..5].iter().all(|t| *t < Duration::from_secs(1)));
    assert!(started_at[5..].iter().all(|t| *t >= Duration::from_secs(60)));

    let stats = governor.stats();
    assert_eq!(stats.succeeded, 7);
    let maps = stats
        .scopes
        .iter()
        .find(|s| s.scope == ScopeKey::source("maps"))
        .unwrap();
    assert_eq!(maps.total_admitted, 7);
}

/// 并发上限限制同时执行的操作数
#[tokio::test(start_paused = true)]
async fn test_concurrency_ceiling() {
    let config = create_test_config().with_concurrency(3);
    let governor = Governor::new(config).unwrap();
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let ops: Vec<Operation<()>> = (0..12)
        .map(|_| {
            let current = current.clone();
            let peak = peak.clone();
            Operation::new("webpage", move |_ctx: AttemptContext| {
                let current = current.clone();
                let peak = peak.clone();
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, OperationError>(())
                }
            })
        })
        .collect();

    let results = governor.submit_batch(ops).await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(peak.load(Ordering::SeqCst), 3);
    assert_eq!(governor.stats().in_flight, 0);
}

/// 结果上报同时影响节流器倍率与路径统计
#[tokio::test(start_paused = true)]
async fn test_outcomes_feed_throttler_and_egress() {
    let config = create_test_config()
        .with_source_limit("apollo", 10, Duration::from_secs(60))
        .with_retry(RetryConfig::disabled());
    let governor = Governor::new(config).unwrap();

    let err = governor
        .submit(failing_operation("apollo", 429))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RateLimited);

    let multiplier = governor
        .throttler()
        .multiplier(&ScopeKey::source("apollo"))
        .unwrap();
    assert!(multiplier < 1.0);

    let path = governor.egress().path_stats("A").unwrap();
    assert_eq!(path.failures, 1);
    assert_eq!(path.consecutive_failures, 1);
    assert!(path.last_error.is_some());
}

/// 瞬时故障经重试后成功，重试会轮换出口
#[tokio::test(start_paused = true)]
async fn test_retry_fails_over_to_healthy_path() {
    let governor = Governor::new(create_test_config()).unwrap();
    let target = ScriptedTarget::new();
    target.fail_path("A");

    let body = governor.submit(target.operation("apollo")).await.unwrap();
    assert_eq!(body, "apollo@B");
    assert_eq!(target.calls_via("A"), 1);
    assert_eq!(target.calls_via("B"), 1);
}

/// 订阅者按尝试收到结果报告
#[tokio::test(start_paused = true)]
async fn test_outcome_subscription() {
    let governor = Governor::new(create_test_config()).unwrap();
    let mut outcomes = governor.subscribe();
    let target = ScriptedTarget::new();
    target.fail_path("A");

    governor.submit(target.operation("maps")).await.unwrap();

    let first = outcomes.recv().await.unwrap();
    let second = outcomes.recv().await.unwrap();
    assert_eq!(first.kind, OutcomeKind::TransientFailure);
    assert_eq!(first.egress_id, "A");
    assert_eq!(first.attempt, 0);
    assert_eq!(second.kind, OutcomeKind::Success);
    assert_eq!(second.attempt, 1);
    assert_eq!(first.operation_id, second.operation_id);
}

/// 截止时间在等待工作槽时到达
#[tokio::test(start_paused = true)]
async fn test_deadline_while_waiting_for_slot() {
    let governor = Arc::new(Governor::new(create_test_config().with_concurrency(1)).unwrap());

    let busy = {
        let governor = governor.clone();
        tokio::spawn(async move {
            let op = Operation::new("webpage", |_ctx: AttemptContext| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, OperationError>(())
            });
            governor.submit(op).await
        })
    };
    tokio::task::yield_now().await;

    let err = governor
        .submit(echo_operation("webpage").with_deadline(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    assert!(busy.await.unwrap().is_ok());
}

/// 默认配置可直接使用
#[tokio::test]
async fn test_default_governor() {
    let governor = Governor::new(GovernorConfig::default()).unwrap();
    assert_eq!(governor.submit(echo_operation("any")).await.unwrap(), "direct");
}
