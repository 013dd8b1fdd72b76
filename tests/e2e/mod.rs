//! 端到端测试模块
//!
//! 测试完整的治理流程和场景

#[allow(unused_imports)]
mod breaker_recovery;
#[allow(unused_imports)]
mod proxy_failover;
