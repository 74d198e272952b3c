//! Periodic backpressure evaluation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use warden_core::{ConcurrencyMetrics, MonitorConfig};

use crate::backpressure::{AdmissionAdvice, BackpressureController};
use crate::recorder::LoadRecorder;

/// Anything that can report the current load of a worker pool.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn sample(&self) -> ConcurrencyMetrics;

    /// Called with the advice computed from the latest sample.
    async fn observe(&self, _advice: &AdmissionAdvice) {}
}

#[async_trait]
impl MetricsSource for LoadRecorder {
    async fn sample(&self) -> ConcurrencyMetrics {
        self.snapshot().await
    }

    async fn observe(&self, advice: &AdmissionAdvice) {
        self.set_backpressure_level(advice.level).await;
    }
}

/// A running monitor. Dropping it leaves the task running until shutdown.
pub struct MonitorHandle {
    pub advice: watch::Receiver<Option<AdmissionAdvice>>,
    pub join: JoinHandle<()>,
}

pub fn monitor_interval(config: &MonitorConfig) -> Duration {
    Duration::from_millis(config.sample_interval_ms.max(1))
}

/// Spawn a task that samples `source` every `every` and publishes the
/// controller's advice. The first sample is taken immediately.
pub fn spawn_monitor(
    source: Arc<dyn MetricsSource>,
    controller: BackpressureController,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> MonitorHandle {
    let (tx, rx) = watch::channel(None);
    let join = tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        let mut rejecting = false;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let metrics = source.sample().await;
                    let advice = controller.evaluate(&metrics);
                    source.observe(&advice).await;
                    if advice.reject != rejecting {
                        rejecting = advice.reject;
                        if rejecting {
                            warn!(
                                level = advice.level,
                                queue_depth = metrics.queue_depth,
                                active_workers = metrics.active_workers,
                                "backpressure engaged, rejecting new work"
                            );
                        } else {
                            info!(level = advice.level, "backpressure released");
                        }
                    }
                    debug!(
                        level = advice.level,
                        suggested_workers = advice.suggested_workers,
                        "load sampled"
                    );
                    tx.send_replace(Some(advice));
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("monitor stopped");
    });
    MonitorHandle { advice: rx, join }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;
    use warden_core::ConcurrencyConfig;

    struct Fixed(Mutex<ConcurrencyMetrics>);

    #[async_trait]
    impl MetricsSource for Fixed {
        async fn sample(&self) -> ConcurrencyMetrics {
            self.0.lock().await.clone()
        }
    }

    fn controller() -> BackpressureController {
        BackpressureController::new(ConcurrencyConfig {
            max_queue_size: 100,
            backpressure_threshold: 0.8,
            min_workers: 2,
            max_workers: 10,
            ..ConcurrencyConfig::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_advice_and_follows_load() {
        let source = Arc::new(Fixed(Mutex::new(ConcurrencyMetrics::load(10, 2, 8))));
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut handle = spawn_monitor(
            source.clone(),
            controller(),
            Duration::from_millis(100),
            stop_rx,
        );

        handle.advice.changed().await.unwrap();
        let first = handle.advice.borrow_and_update().unwrap();
        assert!(!first.reject);

        *source.0.lock().await = ConcurrencyMetrics::load(90, 10, 0);
        handle.advice.changed().await.unwrap();
        let second = handle.advice.borrow_and_update().unwrap();
        assert!(second.reject);
        assert_eq!(second.suggested_workers, 9);

        stop_tx.send(true).unwrap();
        handle.join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn samples_a_load_recorder_and_feeds_level_back() {
        let clock = Arc::new(warden_core::ManualClock::at_epoch());
        let recorder = LoadRecorder::new(clock);
        recorder.set_gauges(100, 10, 0, 0).await;
        assert_eq!(recorder.snapshot().await.backpressure_level, 0.0);

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut handle = spawn_monitor(
            Arc::new(recorder.clone()),
            controller(),
            Duration::from_millis(50),
            stop_rx,
        );

        handle.advice.changed().await.unwrap();
        let advice = handle.advice.borrow().unwrap();
        assert!(advice.reject);

        let level = recorder.snapshot().await.backpressure_level;
        assert!(level > 0.0);
        assert!((level - advice.level).abs() < 1e-9);

        stop_tx.send(true).unwrap();
        handle.join.await.unwrap();
    }

    #[test]
    fn interval_never_zero() {
        let config = MonitorConfig {
            sample_interval_ms: 0,
        };
        assert_eq!(monitor_interval(&config), Duration::from_millis(1));
    }
}
