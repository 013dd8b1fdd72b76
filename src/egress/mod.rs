//! 出口路径模块
//!
//! 路径定义、健康评分、选择策略与路径池管理。

pub mod manager;
pub mod path;
pub mod strategy;

pub use manager::{EgressManager, EgressProbe, FnProbe, TestSummary};
pub use path::{
    EgressEndpoint, EgressHandle, EgressPath, EgressPathConfig, PathSnapshot, PathState,
    PathStats, PathTransition, Protocol, ProxyCredentials,
};
pub use strategy::{
    Fastest, LeastUsed, RandomChoice, RotationStrategy, RoundRobin, SelectionStrategy,
    WeightedByScore,
};
