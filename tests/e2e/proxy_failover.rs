//! 代理故障转移端到端测试
//!
//! 代理失效 → 拉黑 → 流量转移到健康代理 → 巡检恢复

use crate::common::*;
use egressguard::egress::{EgressHandle, FnProbe, PathState};
use egressguard::error::ErrorKind;
use egressguard::operation::OutcomeKind;
use egressguard::retry::RetryConfig;
use egressguard::Governor;
use std::sync::Arc;

#[tokio::test(start_paused = true)]
async fn test_dead_proxies_are_blacklisted_and_recovered() {
    let governor = Governor::new(create_test_config()).unwrap();
    let target = ScriptedTarget::new();
    target.fail_path("A");
    target.fail_path("B");

    // 每次提交依次经过 A、B 失败后在 C 成功；A、B 连续失败 3 次后被拉黑
    for _ in 0..3 {
        assert_eq!(governor.submit(target.operation("maps")).await.unwrap(), "maps@C");
    }
    assert_eq!(governor.egress().path_stats("A").unwrap().state, PathState::Blacklisted);
    assert_eq!(governor.egress().path_stats("B").unwrap().state, PathState::Blacklisted);
    assert_eq!(governor.egress().active_count(), 1);

    // 之后的流量只经过 C，不再重试
    let before = target.calls();
    for _ in 0..5 {
        assert_eq!(governor.submit(target.operation("maps")).await.unwrap(), "maps@C");
    }
    assert_eq!(target.calls() - before, 5);
    assert_eq!(target.calls_via("A"), 3);
    assert_eq!(target.calls_via("B"), 3);

    // A 恢复，B 仍然故障：巡检只恢复 A
    target.heal_path("A");
    let probe_target = Arc::clone(&target);
    let probe = FnProbe(move |handle: EgressHandle| {
        let target = Arc::clone(&probe_target);
        async move { !target.is_failing(&handle.id) }
    });
    let summary = governor.test_paths(&probe).await;
    assert_eq!(summary.probed, 2);
    assert_eq!(summary.reactivated, 1);
    assert_eq!(summary.still_blacklisted, 1);

    let a = governor.egress().path_stats("A").unwrap();
    assert_eq!(a.state, PathState::Active);
    assert_eq!(a.uses, 0);
    assert_eq!(a.consecutive_failures, 0);
    assert_eq!(governor.egress().active_count(), 2);
}

/// 所有路径都被拉黑时立即失败，且不计入熔断
#[tokio::test(start_paused = true)]
async fn test_all_paths_blacklisted() {
    let config = create_test_config()
        .with_paths(direct_paths(&["A", "B"]))
        .with_retry(RetryConfig::disabled());
    let governor = Governor::new(config).unwrap();
    let target = ScriptedTarget::new();
    target.fail_path("A");
    target.fail_path("B");

    // 交替经过 A、B 各失败 3 次；每次换一个数据源，避免触发熔断
    for i in 0..6 {
        let source = format!("site-{}", i);
        let err = governor.submit(target.operation(&source)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }
    assert_eq!(governor.egress().active_count(), 0);

    let err = governor.submit(target.operation("fresh")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoPathsAvailable);
    assert_eq!(target.calls(), 6);

    // 没有路径可用不是目标的问题
    let fresh = governor
        .failure_controller()
        .stats()
        .circuits
        .into_iter()
        .find(|c| c.target == "fresh")
        .unwrap();
    assert_eq!(fresh.failure_count, 0);
}

/// 拉黑发生时订阅者能观察到失败序列
#[tokio::test(start_paused = true)]
async fn test_outcome_stream_during_failover() {
    let governor = Governor::new(create_test_config()).unwrap();
    let mut outcomes = governor.subscribe();
    let target = ScriptedTarget::new();
    target.fail_path("A");

    // 轮询顺序 A(失败),B / C / A(失败),B / C / A(失败),B
    for _ in 0..5 {
        governor.submit(target.operation("apollo")).await.unwrap();
    }

    let mut via_a = Vec::new();
    while let Ok(report) = outcomes.try_recv() {
        if report.egress_id == "A" {
            via_a.push(report.kind);
        }
    }
    assert_eq!(via_a.len(), 3);
    assert!(via_a.iter().all(|k| *k == OutcomeKind::TransientFailure));
    assert_eq!(governor.egress().path_stats("A").unwrap().state, PathState::Blacklisted);
}
