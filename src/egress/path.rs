//! 出口路径定义与健康评分

use crate::log_redaction::redact_credentials;
use crate::operation::OutcomeKind;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// 出口协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// 直连，不经过代理
    #[default]
    Direct,
    Http,
    Https,
    Socks5,
}

impl Protocol {
    pub fn scheme(&self) -> Option<&'static str> {
        match self {
            Protocol::Direct => None,
            Protocol::Http => Some("http"),
            Protocol::Https => Some("https"),
            Protocol::Socks5 => Some("socks5"),
        }
    }
}

/// 出口路径配置
#[derive(Debug, Clone, Deserialize)]
pub struct EgressPathConfig {
    pub id: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<SecretString>,
    #[serde(default)]
    pub region: Option<String>,
}

impl EgressPathConfig {
    /// 直连路径
    pub fn direct(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            protocol: Protocol::Direct,
            host: None,
            port: None,
            username: None,
            password: None,
            region: None,
        }
    }

    /// 代理路径
    pub fn proxy(id: impl Into<String>, protocol: Protocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            protocol,
            host: Some(host.into()),
            port: Some(port),
            username: None,
            password: None,
            region: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(SecretString::new(password.into()));
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("路径ID不能为空".to_string());
        }
        match self.protocol {
            Protocol::Direct => {
                if self.host.is_some() {
                    return Err(format!("直连路径 {} 不应配置 host", self.id));
                }
            }
            _ => {
                if self.host.as_deref().map_or(true, |h| h.trim().is_empty()) {
                    return Err(format!("代理路径 {} 缺少 host", self.id));
                }
                if self.port.map_or(true, |p| p == 0) {
                    return Err(format!("代理路径 {} 缺少有效端口", self.id));
                }
            }
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(format!("路径 {} 配置了密码但缺少用户名", self.id));
        }
        Ok(())
    }

    pub(crate) fn into_handle(self) -> EgressHandle {
        let endpoint = match self.protocol.scheme() {
            None => EgressEndpoint::Direct,
            Some(_) => EgressEndpoint::Proxy {
                protocol: self.protocol,
                host: self.host.unwrap_or_default(),
                port: self.port.unwrap_or_default(),
                credentials: self.username.map(|username| ProxyCredentials {
                    username,
                    password: self.password.unwrap_or_else(|| SecretString::new(String::new())),
                }),
            },
        };
        EgressHandle {
            id: self.id,
            endpoint,
            region: self.region,
        }
    }
}

/// 代理认证信息
#[derive(Clone)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: SecretString,
}

impl fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// 出口端点
#[derive(Debug, Clone)]
pub enum EgressEndpoint {
    Direct,
    Proxy {
        protocol: Protocol,
        host: String,
        port: u16,
        credentials: Option<ProxyCredentials>,
    },
}

/// 交给操作使用的出口路径句柄
#[derive(Debug, Clone)]
pub struct EgressHandle {
    pub id: String,
    pub endpoint: EgressEndpoint,
    pub region: Option<String>,
}

impl EgressHandle {
    pub fn direct(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: EgressEndpoint::Direct,
            region: None,
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self.endpoint, EgressEndpoint::Direct)
    }

    /// 带认证信息的代理 URL，直连时返回 `None`
    pub fn proxy_url(&self) -> Option<SecretString> {
        match &self.endpoint {
            EgressEndpoint::Direct => None,
            EgressEndpoint::Proxy {
                protocol,
                host,
                port,
                credentials,
            } => {
                let scheme = protocol.scheme().unwrap_or("http");
                let url = match credentials {
                    Some(c) => format!(
                        "{}://{}:{}@{}:{}",
                        scheme,
                        c.username,
                        c.password.expose_secret(),
                        host,
                        port
                    ),
                    None => format!("{}://{}:{}", scheme, host, port),
                };
                Some(SecretString::new(url))
            }
        }
    }

    /// 可写入日志的代理地址（密码已隐藏）
    pub fn display_url(&self) -> String {
        match self.proxy_url() {
            None => "direct".to_string(),
            Some(url) => redact_credentials(url.expose_secret()),
        }
    }
}

/// 路径生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathState {
    Active,
    Blacklisted,
}

/// 结果上报引起的状态变化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathTransition {
    Unchanged,
    Blacklisted,
}

/// 健康评分参数
#[derive(Debug, Clone, Copy)]
pub struct HealthParams {
    pub speed_ceiling: Duration,
    pub recency_window: Duration,
}

/// 出口路径及其使用统计
#[derive(Debug)]
pub struct EgressPath {
    handle: EgressHandle,
    state: PathState,
    uses: u64,
    successes: u64,
    failures: u64,
    consecutive_failures: u32,
    latency_samples: u64,
    total_latency: Duration,
    last_used: Option<Instant>,
    last_error: Option<String>,
    /// 最近一次被选中的序号
    last_selected: Option<u64>,
}

impl EgressPath {
    pub fn new(handle: EgressHandle) -> Self {
        Self {
            handle,
            state: PathState::Active,
            uses: 0,
            successes: 0,
            failures: 0,
            consecutive_failures: 0,
            latency_samples: 0,
            total_latency: Duration::ZERO,
            last_used: None,
            last_error: None,
            last_selected: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.handle.id
    }

    pub fn handle(&self) -> &EgressHandle {
        &self.handle
    }

    pub fn state(&self) -> PathState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == PathState::Active
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// 成功率；尚无结果时视为 1.0
    pub fn success_rate(&self) -> f64 {
        let decided = self.successes + self.failures;
        if decided == 0 {
            1.0
        } else {
            self.successes as f64 / decided as f64
        }
    }

    pub fn average_latency(&self) -> Option<Duration> {
        if self.latency_samples == 0 {
            return None;
        }
        Some(self.total_latency / self.latency_samples as u32)
    }

    /// 健康评分 ∈ [0, 100]，每次读取时计算
    ///
    /// `100 × successRate × speedFactor × recencyFactor`
    pub fn health_score(&self, now: Instant, params: &HealthParams) -> f64 {
        let avg_latency = self.average_latency().unwrap_or(Duration::ZERO);
        let speed_factor =
            (1.0 - avg_latency.as_secs_f64() / params.speed_ceiling.as_secs_f64()).max(0.0);

        let recency_factor = match self.last_used {
            Some(last_used) => {
                let age = now.saturating_duration_since(last_used);
                0.5 + 0.5 * (1.0 - age.as_secs_f64() / params.recency_window.as_secs_f64()).max(0.0)
            }
            None => 0.5,
        };

        (100.0 * self.success_rate() * speed_factor * recency_factor).clamp(0.0, 100.0)
    }

    pub(crate) fn mark_selected(&mut self, sequence: u64, now: Instant) {
        self.uses += 1;
        self.last_selected = Some(sequence);
        self.last_used = Some(now);
    }

    /// 记录一次尝试结果
    ///
    /// 成功清零失败连击；瞬时失败与限流累加连击，达到阈值时拉黑；
    /// 永久失败归咎于请求本身，只记录延迟。
    pub(crate) fn record(
        &mut self,
        kind: OutcomeKind,
        latency: Duration,
        error: Option<&str>,
        max_consecutive_failures: u32,
    ) -> PathTransition {
        self.latency_samples += 1;
        self.total_latency += latency;

        match kind {
            OutcomeKind::Success => {
                self.successes += 1;
                self.consecutive_failures = 0;
            }
            OutcomeKind::TransientFailure | OutcomeKind::RateLimited => {
                self.failures += 1;
                self.consecutive_failures += 1;
                if let Some(error) = error {
                    self.last_error = Some(redact_credentials(error));
                }
            }
            OutcomeKind::PermanentFailure => {
                if let Some(error) = error {
                    self.last_error = Some(redact_credentials(error));
                }
            }
        }

        if self.state == PathState::Active
            && self.consecutive_failures >= max_consecutive_failures
        {
            self.state = PathState::Blacklisted;
            return PathTransition::Blacklisted;
        }
        PathTransition::Unchanged
    }

    /// 重新激活并清空使用统计
    pub(crate) fn reactivate(&mut self) {
        self.state = PathState::Active;
        self.uses = 0;
        self.successes = 0;
        self.failures = 0;
        self.consecutive_failures = 0;
        self.latency_samples = 0;
        self.total_latency = Duration::ZERO;
        self.last_error = None;
    }

    pub(crate) fn snapshot(&self, index: usize, now: Instant, params: &HealthParams) -> PathSnapshot {
        PathSnapshot {
            index,
            uses: self.uses,
            successes: self.successes,
            average_latency: self.average_latency(),
            health_score: self.health_score(now, params),
            last_selected: self.last_selected,
        }
    }

    pub(crate) fn stats(&self, now: Instant, params: &HealthParams) -> PathStats {
        PathStats {
            id: self.handle.id.clone(),
            endpoint: self.handle.display_url(),
            region: self.handle.region.clone(),
            state: self.state,
            uses: self.uses,
            successes: self.successes,
            failures: self.failures,
            consecutive_failures: self.consecutive_failures,
            average_latency_ms: self.average_latency().map(|d| d.as_millis() as u64),
            health_score: self.health_score(now, params),
            idle_ms: self
                .last_used
                .map(|t| now.saturating_duration_since(t).as_millis() as u64),
            last_error: self.last_error.clone(),
        }
    }
}

/// 供选择策略使用的只读快照
#[derive(Debug, Clone, PartialEq)]
pub struct PathSnapshot {
    /// 在路径池中的位置
    pub index: usize,
    pub uses: u64,
    pub successes: u64,
    pub average_latency: Option<Duration>,
    pub health_score: f64,
    pub last_selected: Option<u64>,
}

/// 路径统计信息
#[derive(Debug, Clone, Serialize)]
pub struct PathStats {
    pub id: String,
    pub endpoint: String,
    pub region: Option<String>,
    pub state: PathState,
    pub uses: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub average_latency_ms: Option<u64>,
    pub health_score: f64,
    pub idle_ms: Option<u64>,
    pub last_error: Option<String>,
}
