//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 错误类型定义
//!
//! 使用thiserror定义所有错误类型，并为每个终止错误附带分类。

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// 操作失败的分类
///
/// 由外部操作（`run`）声明，决定重试、熔断与自适应行为。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 瞬时故障（网络超时、5xx、连接重置），可重试
    Transient,
    /// 被限流（429），按瞬时故障处理，同时立即压低自适应倍率
    RateLimited,
    /// 永久故障（429 以外的 4xx、响应格式错误），不重试
    Permanent,
    /// 认证失败，不重试，并标记数据源需要人工处理
    AuthFailure,
}

impl FailureKind {
    /// 是否允许在重试策略内恢复
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::Transient | FailureKind::RateLimited)
    }
}

/// 外部操作返回的已分类错误
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind:?}: {message}")]
pub struct OperationError {
    pub kind: FailureKind,
    pub message: String,
    /// HTTP 等价状态码（如果有）
    pub status: Option<u16>,
}

impl OperationError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(FailureKind::RateLimited, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Permanent, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(FailureKind::AuthFailure, message)
    }

    /// 网络超时
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    /// 按 HTTP 等价状态码分类
    ///
    /// - 429 → RateLimited
    /// - 408、425、5xx → Transient
    /// - 401、403、407 → AuthFailure
    /// - 其他 4xx 及未知状态码 → Permanent
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            429 => FailureKind::RateLimited,
            408 | 425 => FailureKind::Transient,
            500..=599 => FailureKind::Transient,
            401 | 403 | 407 => FailureKind::AuthFailure,
            _ => FailureKind::Permanent,
        };
        Self {
            kind,
            message: message.into(),
            status: Some(status),
        }
    }
}

/// 终止错误的分类（对外暴露）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    RateLimited,
    Permanent,
    AuthFailure,
    NoPathsAvailable,
    CircuitOpen,
    DeadlineExceeded,
    Config,
    Validation,
    Io,
}

/// Governor 错误类型
#[derive(Error, Debug)]
pub enum GovernorError {
    /// 瞬时故障，重试预算耗尽
    #[error("瞬时故障: source={source_id}, attempts={attempts}: {message}")]
    Transient {
        source_id: String,
        attempts: u32,
        message: String,
    },

    /// 被目标限流，重试预算耗尽
    #[error("目标限流: source={source_id}, attempts={attempts}: {message}")]
    RateLimited {
        source_id: String,
        attempts: u32,
        message: String,
    },

    /// 永久故障
    #[error("永久故障: source={source_id}: {message}")]
    Permanent { source_id: String, message: String },

    /// 认证失败，需要人工处理
    #[error("认证失败（需要人工处理）: source={source_id}: {message}")]
    AuthFailure { source_id: String, message: String },

    /// 没有可用的出口路径
    #[error("没有可用的出口路径")]
    NoPathsAvailable,

    /// 熔断器打开
    #[error("熔断器打开: target={target}, retry_after={retry_after:?}")]
    CircuitOpen {
        target: String,
        retry_after: Duration,
    },

    /// 超过截止时间
    #[error("超过截止时间: {0}")]
    DeadlineExceeded(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    ConfigError(String),

    /// 验证错误
    #[error("验证错误: {0}")]
    ValidationError(String),

    /// IO错误
    #[error("IO错误: {0}")]
    IoError(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// YAML解析错误
    #[error("YAML解析错误: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// TOML解析错误
    #[error("TOML解析错误: {0}")]
    TomlError(#[from] toml::de::Error),
}

impl GovernorError {
    /// 错误分类
    pub fn kind(&self) -> ErrorKind {
        match self {
            GovernorError::Transient { .. } => ErrorKind::Transient,
            GovernorError::RateLimited { .. } => ErrorKind::RateLimited,
            GovernorError::Permanent { .. } => ErrorKind::Permanent,
            GovernorError::AuthFailure { .. } => ErrorKind::AuthFailure,
            GovernorError::NoPathsAvailable => ErrorKind::NoPathsAvailable,
            GovernorError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            GovernorError::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            GovernorError::ConfigError(_) => ErrorKind::Config,
            GovernorError::ValidationError(_) => ErrorKind::Validation,
            GovernorError::IoError(_) => ErrorKind::Io,
            GovernorError::SerdeError(_)
            | GovernorError::YamlError(_)
            | GovernorError::TomlError(_) => ErrorKind::Config,
        }
    }

    /// 由最后一次操作错误构造终止错误
    pub fn from_operation(source_id: &str, attempts: u32, err: OperationError) -> Self {
        let source_id = source_id.to_string();
        match err.kind {
            FailureKind::Transient => GovernorError::Transient {
                source_id,
                attempts,
                message: err.message,
            },
            FailureKind::RateLimited => GovernorError::RateLimited {
                source_id,
                attempts,
                message: err.message,
            },
            FailureKind::Permanent => GovernorError::Permanent {
                source_id,
                message: err.message,
            },
            FailureKind::AuthFailure => GovernorError::AuthFailure {
                source_id,
                message: err.message,
            },
        }
    }
}
