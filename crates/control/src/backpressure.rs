//! Admission control from live load.
//!
//! The load level is `0.7 * queue fullness + 0.3 * worker utilization`,
//! clamped to `[0, 1]`. Admission is refused at or above the configured
//! threshold, and the same level maps linearly onto a worker count between
//! `min_workers` and `max_workers`.

use serde::{Deserialize, Serialize};
use warden_core::{ConcurrencyConfig, ConcurrencyMetrics};

const QUEUE_WEIGHT: f64 = 0.7;
const UTILIZATION_WEIGHT: f64 = 0.3;

/// `min(1, queue_depth / max_queue_size)`. A zero-sized queue is full as
/// soon as anything waits in it.
pub fn queue_fullness(metrics: &ConcurrencyMetrics, config: &ConcurrencyConfig) -> f64 {
    if config.max_queue_size == 0 {
        return if metrics.queue_depth > 0 { 1.0 } else { 0.0 };
    }
    (metrics.queue_depth as f64 / config.max_queue_size as f64).min(1.0)
}

/// Share of workers that are busy; `0` when there are no workers at all.
pub fn worker_utilization(metrics: &ConcurrencyMetrics) -> f64 {
    let total = metrics.active_workers + metrics.idle_workers;
    if total == 0 {
        return 0.0;
    }
    metrics.active_workers as f64 / total as f64
}

pub fn backpressure_level(metrics: &ConcurrencyMetrics, config: &ConcurrencyConfig) -> f64 {
    let level = QUEUE_WEIGHT * queue_fullness(metrics, config)
        + UTILIZATION_WEIGHT * worker_utilization(metrics);
    if level.is_nan() {
        return 0.0;
    }
    level.clamp(0.0, 1.0)
}

pub fn should_reject(metrics: &ConcurrencyMetrics, config: &ConcurrencyConfig) -> bool {
    backpressure_level(metrics, config) >= config.backpressure_threshold
}

pub fn suggest_worker_count(metrics: &ConcurrencyMetrics, config: &ConcurrencyConfig) -> u32 {
    let min = config.min_workers.min(config.max_workers);
    let max = config.max_workers;
    let level = backpressure_level(metrics, config);
    let scaled = min as f64 + level * (max - min) as f64;
    (scaled.round() as u32).clamp(min, max)
}

/// One evaluation of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionAdvice {
    pub level: f64,
    pub reject: bool,
    pub suggested_workers: u32,
}

/// Backpressure evaluation bound to one [`ConcurrencyConfig`].
#[derive(Debug, Clone)]
pub struct BackpressureController {
    config: ConcurrencyConfig,
}

impl BackpressureController {
    pub fn new(config: ConcurrencyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConcurrencyConfig {
        &self.config
    }

    pub fn level(&self, metrics: &ConcurrencyMetrics) -> f64 {
        backpressure_level(metrics, &self.config)
    }

    pub fn should_reject(&self, metrics: &ConcurrencyMetrics) -> bool {
        should_reject(metrics, &self.config)
    }

    pub fn suggest_worker_count(&self, metrics: &ConcurrencyMetrics) -> u32 {
        suggest_worker_count(metrics, &self.config)
    }

    pub fn evaluate(&self, metrics: &ConcurrencyMetrics) -> AdmissionAdvice {
        let level = self.level(metrics);
        AdmissionAdvice {
            level,
            reject: level >= self.config.backpressure_threshold,
            suggested_workers: self.suggest_worker_count(metrics),
        }
    }
}
