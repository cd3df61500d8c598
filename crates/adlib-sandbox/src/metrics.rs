//! Prometheus metrics for the adlib sandbox.
//!
//! This module is only compiled when the `metrics` feature is enabled.
//! Provides counters and histograms for execution observability.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

/// Label set for execution metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ExecutionLabels {
    /// The plan action: "create", "get", ...
    pub action: String,
}

/// Label set for rejection/error metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// The error kind: "unsafe_code", "timeout", "snippet_error", ...
    pub error_kind: String,
}

/// Prometheus metrics for the adlib sandbox.
pub struct SandboxMetrics {
    /// Total number of executions.
    pub executions_total: Family<ExecutionLabels, Counter>,
    /// Execution duration in seconds.
    pub execution_duration_seconds: Family<ExecutionLabels, Histogram>,
    /// Total number of errors by kind.
    pub errors_total: Family<ErrorLabels, Counter>,
}

impl SandboxMetrics {
    /// Create a new `SandboxMetrics` and register all metrics with the given
    /// registry.
    pub fn new(registry: &mut Registry) -> Self {
        let executions_total = Family::default();
        registry.register(
            "adlib_executions_total",
            "Total snippet executions",
            executions_total.clone(),
        );

        let execution_duration_seconds =
            Family::<ExecutionLabels, Histogram>::new_with_constructor(|| {
                Histogram::new([0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0].into_iter())
            });
        registry.register(
            "adlib_execution_duration_seconds",
            "Snippet execution duration",
            execution_duration_seconds.clone(),
        );

        let errors_total = Family::default();
        registry.register(
            "adlib_errors_total",
            "Total sandbox errors by kind",
            errors_total.clone(),
        );

        Self {
            executions_total,
            execution_duration_seconds,
            errors_total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_count() {
        let mut registry = Registry::default();
        let metrics = SandboxMetrics::new(&mut registry);
        metrics
            .executions_total
            .get_or_create(&ExecutionLabels {
                action: "create".into(),
            })
            .inc();
        metrics
            .errors_total
            .get_or_create(&ErrorLabels {
                error_kind: "unsafe_code".into(),
            })
            .inc();
    }
}
