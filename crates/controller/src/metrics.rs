/// 控制器指标
///
/// 每个控制器实例持有自己的计数器，通过常量标签 `kind` 区分

use common::{Error, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct ReconcilerMetrics {
    /// 已完成的轮询次数
    pub passes: IntCounter,
    /// 状态转换次数，按目标状态区分
    pub transitions: IntCounterVec,
    /// 后端调用失败次数
    pub failures: IntCounter,
}

impl ReconcilerMetrics {
    /// 创建并注册到给定 Registry
    pub fn register(registry: &Registry, kind: &str) -> Result<Self> {
        let metrics = Self::unregistered(kind)?;
        registry
            .register(Box::new(metrics.passes.clone()))
            .and_then(|_| registry.register(Box::new(metrics.transitions.clone())))
            .and_then(|_| registry.register(Box::new(metrics.failures.clone())))
            .map_err(|e| Error::Internal(format!("注册 {} 控制器指标失败: {}", kind, e)))?;
        Ok(metrics)
    }

    /// 不注册的计数器
    pub fn unregistered(kind: &str) -> Result<Self> {
        let map_err = |e: prometheus::Error| Error::Internal(format!("创建指标失败: {}", e));

        let passes = IntCounter::with_opts(
            Opts::new("reconcile_passes_total", "已完成的控制器轮询次数").const_label("kind", kind),
        )
        .map_err(map_err)?;
        let transitions = IntCounterVec::new(
            Opts::new("reconcile_transitions_total", "控制器执行的状态转换次数")
                .const_label("kind", kind),
            &["to"],
        )
        .map_err(map_err)?;
        let failures = IntCounter::with_opts(
            Opts::new("reconcile_backend_failures_total", "控制器调用后端失败次数")
                .const_label("kind", kind),
        )
        .map_err(map_err)?;

        Ok(Self {
            passes,
            transitions,
            failures,
        })
    }

    pub fn transition(&self, to: &str) {
        self.transitions.with_label_values(&[to]).inc();
    }
}

/// 以 Prometheus 文本格式导出
pub fn render(registry: &Registry) -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&registry.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_per_instance() {
        let registry = Registry::new();
        let volumes = ReconcilerMetrics::register(&registry, "volume").unwrap();
        let networks = ReconcilerMetrics::register(&registry, "network").unwrap();

        volumes.passes.inc();
        volumes.passes.inc();
        networks.passes.inc();
        volumes.transition("available");

        assert_eq!(volumes.passes.get(), 2);
        assert_eq!(networks.passes.get(), 1);

        let text = render(&registry);
        assert!(text.contains("reconcile_passes_total{kind=\"volume\"} 2"));
        assert!(text.contains("reconcile_transitions_total{kind=\"volume\",to=\"available\"} 1"));
    }

    #[test]
    fn test_duplicate_kind_registration_fails() {
        let registry = Registry::new();
        ReconcilerMetrics::register(&registry, "server").unwrap();
        assert!(ReconcilerMetrics::register(&registry, "server").is_err());
    }
}
