//! 配置模块集成测试
//!
//! 测试从文件加载配置并构建 Governor

use egressguard::egress::RotationStrategy;
use egressguard::error::ErrorKind;
use egressguard::{Governor, GovernorConfig};
use std::io::Write;
use std::time::Duration;
use tempfile::Builder;

const YAML: &str = r#"
rate_limits:
  global:
    capacity: 200
    window: 1s
  default_source:
    capacity: 30
    window: 1m
  default_egress:
    capacity: 10
    window: 10s
adaptive:
  enabled: true
  evaluation_interval: 10
egress:
  strategy: least_used
  speed_ceiling: 5s
  paths:
    - id: direct
    - id: us-1
      protocol: https
      host: proxy.example.net
      port: 8443
      username: scraper
      password: s3cret
      region: us
circuit_breaker:
  failure_threshold: 4
  cooldown: 15s
  max_cooldown: 10m
retry:
  max_retries: 5
  base_backoff: 250ms
  max_backoff: 20s
  jitter_ratio: 0.5
concurrency: 12
default_deadline: 2m
"#;

#[test]
fn test_load_yaml_file() {
    let mut file = Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(YAML.as_bytes()).unwrap();

    let config = GovernorConfig::from_file(file.path()).unwrap();
    assert_eq!(config.egress.strategy, RotationStrategy::LeastUsed);
    assert_eq!(config.egress.speed_ceiling, Duration::from_secs(5));
    assert_eq!(config.circuit_breaker.failure_threshold, 4);
    assert_eq!(config.circuit_breaker.max_cooldown, Duration::from_secs(600));
    assert_eq!(config.retry.max_retries, 5);
    assert_eq!(config.retry.jitter_ratio, 0.5);
    assert_eq!(config.default_deadline, Duration::from_secs(120));
    assert_eq!(config.effective_concurrency(), 12);

    let governor = Governor::new(config).unwrap();
    assert_eq!(governor.egress().len(), 2);
    assert_eq!(governor.concurrency(), 12);
}

#[test]
fn test_load_toml_file() {
    let text = r#"
default_deadline = "30s"

[rate_limits.sources.apollo]
capacity = 5
window = "60s"

[retry]
max_retries = 1

[[egress.paths]]
id = "a"

[[egress.paths]]
id = "b"
protocol = "socks5"
host = "127.0.0.1"
port = 1080
"#;
    let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(text.as_bytes()).unwrap();

    let config = GovernorConfig::from_file(file.path()).unwrap();
    assert_eq!(config.rate_limits.sources["apollo"].capacity, 5);
    assert_eq!(config.retry.max_retries, 1);
    assert_eq!(config.egress.paths.len(), 2);
    assert_eq!(config.effective_concurrency(), 5);
}

#[test]
fn test_unknown_extension_rejected() {
    let mut file = Builder::new().suffix(".ini").tempfile().unwrap();
    file.write_all(b"[global]").unwrap();
    let err = GovernorConfig::from_file(file.path()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn test_missing_file() {
    let err = GovernorConfig::from_file("/nonexistent/egressguard.yaml").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
}

#[test]
fn test_invalid_values_rejected() {
    let cases = [
        "circuit_breaker:\n  failure_threshold: 0\n",
        "retry:\n  base_backoff: 10s\n  max_backoff: 1s\n",
        "retry:\n  jitter_ratio: 2.0\n",
        "egress:\n  paths:\n    - id: p\n      protocol: http\n",
        "concurrency: 0\n",
        "rate_limits:\n  default_egress:\n    capacity: 3\n    window: 0ms\n",
    ];
    for yaml in cases {
        assert!(
            GovernorConfig::from_yaml_str(yaml).is_err(),
            "expected rejection: {}",
            yaml
        );
    }
}
