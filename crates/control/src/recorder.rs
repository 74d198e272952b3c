//! Load recording for worker pools.
//!
//! A pool reports each finished request and its current queue/worker gauges
//! to a [`LoadRecorder`]; the recorder turns a rolling window of latencies
//! into the [`ConcurrencyMetrics`] snapshot the backpressure controller
//! reads.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use warden_core::{Clock, ConcurrencyMetrics};

/// Latency samples kept for percentile estimates.
const DEFAULT_WINDOW: usize = 1_000;

// ── Ring buffer ──────────────────────────────────────────────────────

/// A fixed-size ring buffer backed by `VecDeque`.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    buf: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push an item, evicting the oldest if at capacity.
    pub fn push(&mut self, item: T) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buf.iter()
    }
}

// ── Recorder ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Sample {
    completed_at: DateTime<Utc>,
    latency_ms: f64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Gauges {
    queue_depth: u64,
    active_workers: u64,
    idle_workers: u64,
    stuck_workers: u64,
}

#[derive(Debug)]
struct Inner {
    samples: RingBuffer<Sample>,
    gauges: Gauges,
    total_processed: u64,
    total_errors: u64,
    last_level: f64,
}

/// Thread-safe accumulator of worker pool load.
#[derive(Clone)]
pub struct LoadRecorder {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<dyn Clock>,
}

impl LoadRecorder {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_window(DEFAULT_WINDOW, clock)
    }

    pub fn with_window(window: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                samples: RingBuffer::new(window),
                gauges: Gauges::default(),
                total_processed: 0,
                total_errors: 0,
                last_level: 0.0,
            })),
            clock,
        }
    }

    /// Record a finished request.
    pub async fn record_completion(&self, latency_ms: f64, ok: bool) {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        inner.total_processed += 1;
        if !ok {
            inner.total_errors += 1;
        }
        inner.samples.push(Sample {
            completed_at: now,
            latency_ms: latency_ms.max(0.0),
        });
    }

    pub async fn set_gauges(
        &self,
        queue_depth: u64,
        active_workers: u64,
        idle_workers: u64,
        stuck_workers: u64,
    ) {
        let mut inner = self.inner.lock().await;
        inner.gauges = Gauges {
            queue_depth,
            active_workers,
            idle_workers,
            stuck_workers,
        };
    }

    /// Remember the level last computed from this recorder's snapshot so the
    /// next snapshot can report it. The monitor loop calls this on every
    /// tick.
    pub async fn set_backpressure_level(&self, level: f64) {
        self.inner.lock().await.last_level = level;
    }

    pub async fn snapshot(&self) -> ConcurrencyMetrics {
        let now = self.clock.now();
        let inner = self.inner.lock().await;

        let mut latencies: Vec<f64> = inner.samples.iter().map(|s| s.latency_ms).collect();
        latencies.sort_by(f64::total_cmp);
        let avg = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };

        let minute_ago = now - chrono::Duration::minutes(1);
        let throughput = inner
            .samples
            .iter()
            .filter(|s| s.completed_at > minute_ago)
            .count();

        ConcurrencyMetrics {
            queue_depth: inner.gauges.queue_depth,
            active_workers: inner.gauges.active_workers,
            idle_workers: inner.gauges.idle_workers,
            total_processed: inner.total_processed,
            total_errors: inner.total_errors,
            avg_latency_ms: avg,
            p95_latency_ms: percentile(&latencies, 95.0),
            p99_latency_ms: percentile(&latencies, 99.0),
            throughput_per_minute: throughput as f64,
            backpressure_level: inner.last_level,
            stuck_workers: inner.gauges.stuck_workers,
        }
    }
}

/// Nearest-rank percentile of an ascending slice; `0` when empty.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
