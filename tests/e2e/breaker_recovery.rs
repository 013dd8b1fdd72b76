//! 熔断恢复端到端测试
//!
//! 目标宕机 → 熔断打开 → 冷却后探测 → 恢复

use crate::common::*;
use egressguard::circuit_breaker::{CircuitBreakerConfig, CircuitState};
use egressguard::error::{ErrorKind, GovernorError, OperationError};
use egressguard::operation::{AttemptContext, Operation};
use egressguard::Governor;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 可切换状态的目标站点，宕机时无论经由哪条出口都返回 503
#[derive(Default)]
struct FlakySite {
    down: AtomicBool,
    calls: AtomicU32,
}

impl FlakySite {
    fn operation(self: &Arc<Self>, source: &str) -> Operation<u32> {
        let site = Arc::clone(self);
        Operation::new(source, move |_ctx: AttemptContext| {
            let call = site.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let down = site.down.load(Ordering::SeqCst);
            async move {
                if down {
                    Err(OperationError::from_status(503, "upstream down"))
                } else {
                    Ok(call)
                }
            }
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_outage_and_recovery() {
    let config = create_test_config()
        .with_circuit_breaker(CircuitBreakerConfig::new(3, Duration::from_secs(30)));
    let governor = Governor::new(config).unwrap();
    let site = Arc::new(FlakySite::default());
    site.down.store(true, Ordering::SeqCst);

    // 第一次提交的三次尝试全部失败，熔断在重试途中打开，返回最后一次错误
    let err = governor.submit(site.operation("apollo")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert_eq!(site.calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        governor.failure_controller().circuit_state("apollo"),
        Some(CircuitState::Open)
    );

    // 冷却期间直接拒绝，不触达目标
    for _ in 0..5 {
        match governor.submit(site.operation("apollo")).await {
            Err(GovernorError::CircuitOpen { target, retry_after }) => {
                assert_eq!(target, "apollo");
                assert!(retry_after <= Duration::from_secs(30));
            }
            other => panic!("expected CircuitOpen, got {:?}", other.map(|_| ())),
        }
    }
    assert_eq!(site.calls.load(Ordering::SeqCst), 3);

    // 其他数据源不受影响
    assert_eq!(governor.submit(echo_operation("maps")).await.unwrap().len(), 1);

    // 冷却结束、目标恢复：探测成功后熔断关闭
    tokio::time::advance(Duration::from_secs(30)).await;
    site.down.store(false, Ordering::SeqCst);
    assert_eq!(governor.submit(site.operation("apollo")).await.unwrap(), 4);
    assert_eq!(
        governor.failure_controller().circuit_state("apollo"),
        Some(CircuitState::Closed)
    );

    let stats = governor.stats().failure_controller;
    assert_eq!(stats.short_circuited, 5);
    let apollo = stats.circuits.iter().find(|c| c.target == "apollo").unwrap();
    assert_eq!(apollo.cooldown_ms, 30_000);
}

/// 探测失败时冷却时间翻倍，直到目标恢复
#[tokio::test(start_paused = true)]
async fn test_failed_probe_extends_cooldown() {
    let config = create_test_config()
        .with_circuit_breaker(CircuitBreakerConfig::new(3, Duration::from_secs(10)));
    let governor = Governor::new(config).unwrap();
    let site = Arc::new(FlakySite::default());
    site.down.store(true, Ordering::SeqCst);

    governor.submit(site.operation("maps")).await.unwrap_err();
    assert_eq!(site.calls.load(Ordering::SeqCst), 3);

    // 探测失败：只发起一次尝试，熔断重新打开
    tokio::time::advance(Duration::from_secs(10)).await;
    let err = governor.submit(site.operation("maps")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert_eq!(site.calls.load(Ordering::SeqCst), 4);

    let maps = governor
        .failure_controller()
        .stats()
        .circuits
        .into_iter()
        .find(|c| c.target == "maps")
        .unwrap();
    assert_eq!(maps.state, CircuitState::Open);
    assert_eq!(maps.cooldown_ms, 20_000);

    // 原冷却时长过后仍然拒绝
    tokio::time::advance(Duration::from_secs(10)).await;
    let err = governor.submit(site.operation("maps")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CircuitOpen);

    tokio::time::advance(Duration::from_secs(10)).await;
    site.down.store(false, Ordering::SeqCst);
    governor.submit(site.operation("maps")).await.unwrap();
    assert_eq!(
        governor.failure_controller().circuit_state("maps"),
        Some(CircuitState::Closed)
    );
}

/// 手动重置熔断器后立即恢复请求
#[tokio::test(start_paused = true)]
async fn test_manual_reset() {
    let config = create_test_config()
        .with_circuit_breaker(CircuitBreakerConfig::new(3, Duration::from_secs(300)));
    let governor = Governor::new(config).unwrap();
    let site = Arc::new(FlakySite::default());
    site.down.store(true, Ordering::SeqCst);

    governor.submit(site.operation("webpage")).await.unwrap_err();
    assert_eq!(
        governor.submit(site.operation("webpage")).await.unwrap_err().kind(),
        ErrorKind::CircuitOpen
    );

    site.down.store(false, Ordering::SeqCst);
    assert!(governor.failure_controller().reset("webpage"));
    assert!(governor.submit(site.operation("webpage")).await.is_ok());
    assert!(!governor.failure_controller().reset("unknown"));
}
