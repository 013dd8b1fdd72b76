//! 监控和追踪模块
//!
//! - `telemetry` 特性：基于 tracing-subscriber 的日志初始化
//! - `monitoring` 特性：Prometheus 指标
//!
//! # 示例
//!
//! ```rust,ignore
//! use egressguard::telemetry::{init_tracing, Metrics};
//!
//! init_tracing("egressguard=debug").unwrap();
//! let metrics = Metrics::new().unwrap();
//! println!("{}", metrics.gather());
//! ```

#[cfg(feature = "telemetry")]
use crate::error::GovernorError;

/// 安装全局 tracing 订阅者
///
/// 优先使用 `RUST_LOG` 环境变量，否则使用传入的过滤表达式。
#[cfg(feature = "telemetry")]
pub fn init_tracing(default_filter: &str) -> Result<(), GovernorError> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| GovernorError::ConfigError(format!("日志过滤表达式无效: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .map_err(|e| GovernorError::ConfigError(format!("tracing 初始化失败: {}", e)))?;

    tracing::info!("tracing 已初始化");
    Ok(())
}

#[cfg(feature = "monitoring")]
pub use self::metrics::Metrics;

#[cfg(feature = "monitoring")]
mod metrics {
    use crate::operation::OutcomeKind;
    use prometheus::{
        Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry,
        TextEncoder,
    };
    use std::time::Duration;
    use tracing::error;

    /// 监控指标
    #[derive(Clone)]
    pub struct Metrics {
        /// 按结果类别统计的尝试次数
        pub attempts_total: CounterVec,
        /// 提交的操作数
        pub operations_total: Counter,
        /// 熔断打开导致的直接拒绝
        pub circuit_open_total: Counter,
        /// 放行等待时间分布
        pub admission_wait: Histogram,
        /// 活跃出口路径数
        pub active_paths: Gauge,
        /// 进行中的操作数
        pub in_flight: Gauge,
        registry: Registry,
    }

    impl Metrics {
        /// 创建并注册所有指标
        pub fn new() -> Result<Self, prometheus::Error> {
            let registry = Registry::new();

            let attempts_total = CounterVec::new(
                Opts::new(
                    "egressguard_attempts_total",
                    "Total number of operation attempts by outcome kind",
                ),
                &["kind"],
            )?;
            let operations_total = Counter::with_opts(Opts::new(
                "egressguard_operations_total",
                "Total number of submitted operations",
            ))?;
            let circuit_open_total = Counter::with_opts(Opts::new(
                "egressguard_circuit_open_total",
                "Total number of operations rejected by an open circuit",
            ))?;
            let admission_wait = Histogram::with_opts(
                HistogramOpts::new(
                    "egressguard_admission_wait_seconds",
                    "Time spent waiting for rate admission",
                )
                .buckets(vec![0.0, 0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
            )?;
            let active_paths = Gauge::with_opts(Opts::new(
                "egressguard_active_paths",
                "Number of active egress paths",
            ))?;
            let in_flight = Gauge::with_opts(Opts::new(
                "egressguard_in_flight",
                "Number of operations currently holding a worker slot",
            ))?;

            registry.register(Box::new(attempts_total.clone()))?;
            registry.register(Box::new(operations_total.clone()))?;
            registry.register(Box::new(circuit_open_total.clone()))?;
            registry.register(Box::new(admission_wait.clone()))?;
            registry.register(Box::new(active_paths.clone()))?;
            registry.register(Box::new(in_flight.clone()))?;

            Ok(Self {
                attempts_total,
                operations_total,
                circuit_open_total,
                admission_wait,
                active_paths,
                in_flight,
                registry,
            })
        }

        pub fn registry(&self) -> &Registry {
            &self.registry
        }

        /// 导出 Prometheus 文本格式
        pub fn gather(&self) -> String {
            let encoder = TextEncoder::new();
            let metric_families = self.registry.gather();
            let mut buffer = Vec::new();
            if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                error!("Failed to encode metrics: {}", e);
                return String::new();
            }
            String::from_utf8(buffer).unwrap_or_default()
        }

        pub fn record_attempt(&self, kind: OutcomeKind) {
            self.attempts_total.with_label_values(&[kind.as_str()]).inc();
        }

        pub fn record_admission_wait(&self, waited: Duration) {
            self.admission_wait.observe(waited.as_secs_f64());
        }

        pub fn record_circuit_open(&self) {
            self.circuit_open_total.inc();
        }

        pub fn set_active_paths(&self, count: usize) {
            self.active_paths.set(count as f64);
        }
    }

}
