//! Load snapshot produced by the worker pool each sampling tick.

use serde::{Deserialize, Serialize};

/// Point-in-time view of worker pool load.
///
/// Read-only input to the backpressure controller. The pool fills it in;
/// this workspace never mutates one it did not build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConcurrencyMetrics {
    pub queue_depth: u64,
    pub active_workers: u64,
    pub idle_workers: u64,
    pub total_processed: u64,
    pub total_errors: u64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub throughput_per_minute: f64,
    pub backpressure_level: f64,
    pub stuck_workers: u64,
}

impl ConcurrencyMetrics {
    /// Snapshot with only the load-bearing fields set.
    pub fn load(queue_depth: u64, active_workers: u64, idle_workers: u64) -> Self {
        Self {
            queue_depth,
            active_workers,
            idle_workers,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_partial_camel_case_snapshot() {
        let m: ConcurrencyMetrics =
            serde_json::from_str(r#"{"queueDepth":12,"activeWorkers":3,"idleWorkers":1}"#)
                .unwrap();
        assert_eq!(m, ConcurrencyMetrics::load(12, 3, 1));
        assert_eq!(m.total_errors, 0);
    }
}
