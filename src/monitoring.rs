//! # Backpressure Monitoring
//!
//! ## Responsibility
//! Maintain the shared pending/active counters and publish classified load
//! reports at an adaptive cadence so fleet tooling can see queue pressure
//! without polling workers.
//!
//! ## Guarantees
//! - Lock-free: counters are plain atomics shared across worker tasks
//! - Reports are emitted unconditionally on every tick; consumers sample
//! - Publish failures are logged and never affect request processing
//!
//! ## NOT Responsible For
//! - Heartbeats and health snapshots (see: `health`). Note that the health
//!   snapshot classifies backpressure differently on purpose; the monitor
//!   report is a load signal, the health status is a dashboard cue

use crate::config::Config;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Sampling cadence while the queue has pending work.
const HIGH_LOAD_INTERVAL: Duration = Duration::from_secs(1);
/// Sampling cadence while idle.
const LOW_LOAD_INTERVAL: Duration = Duration::from_secs(10);

/// Shared counters for in-flight queue work.
///
/// `pending` covers a message from fetch hand-off until dispatch returns;
/// `active` covers handler execution only. Both must return to zero in
/// steady state.
#[derive(Debug, Default)]
pub struct QueueCounters {
    pending: AtomicI64,
    active: AtomicI64,
    total_processed: AtomicI64,
    last_processed_unix: AtomicI64,
}

impl QueueCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn increment_pending(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement_pending(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn increment_active(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement_active(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Record one completed handler invocation.
    pub fn record_processed(&self) {
        self.total_processed.fetch_add(1, Ordering::SeqCst);
        self.last_processed_unix
            .store(crate::unix_timestamp() as i64, Ordering::SeqCst);
    }

    pub fn pending(&self) -> i64 {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }

    pub fn total_processed(&self) -> i64 {
        self.total_processed.load(Ordering::SeqCst)
    }

    /// Unix seconds of the last completed message; zero when none yet.
    pub fn last_processed_unix(&self) -> i64 {
        self.last_processed_unix.load(Ordering::SeqCst)
    }
}

/// One load report published to `<monitoring-topic>.<model>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackpressureReport {
    pub model_name: String,
    pub pending_messages: i64,
    pub active_processing: i64,
    /// Unix seconds at sample time.
    pub timestamp: u64,
    pub worker_count: usize,
    pub queue_capacity: i64,
    /// `healthy`, `warning`, or `critical`.
    pub status: String,
}

/// Classify queue load for the monitor report.
///
/// `healthy` iff nothing is in flight; `warning` below the threshold;
/// `critical` at or above it.
pub fn classify_load(pending: i64, active: i64, threshold: i64) -> &'static str {
    let total = pending + active;
    if total == 0 {
        "healthy"
    } else if total < threshold {
        "warning"
    } else {
        "critical"
    }
}

/// Publishes periodic [`BackpressureReport`]s, sampling faster under load.
pub struct BackpressureMonitor {
    client: async_nats::Client,
    config: Arc<Config>,
    counters: Arc<QueueCounters>,
}

impl BackpressureMonitor {
    pub fn new(
        client: async_nats::Client,
        config: Arc<Config>,
        counters: Arc<QueueCounters>,
    ) -> Self {
        Self {
            client,
            config,
            counters,
        }
    }

    /// Run until the shutdown signal flips.
    ///
    /// The cadence switches between 1 s (pending > 0) and 10 s (idle) on a
    /// single sample, with no smoothing window.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            topic = %self.config.monitoring_topic,
            threshold = self.config.backpressure_threshold,
            "backpressure monitor started"
        );

        loop {
            let pending = self.counters.pending();
            let interval = if pending > 0 {
                HIGH_LOAD_INTERVAL
            } else {
                LOW_LOAD_INTERVAL
            };

            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.report().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("backpressure monitor shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn report(&self) {
        let pending = self.counters.pending();
        let active = self.counters.active();
        let status = classify_load(pending, active, self.config.backpressure_threshold);

        let report = BackpressureReport {
            model_name: self.config.model_name.clone(),
            pending_messages: pending,
            active_processing: active,
            timestamp: crate::unix_timestamp(),
            worker_count: self.config.concurrency,
            queue_capacity: self.config.max_msgs,
            status: status.to_string(),
        };

        let payload = match serde_json::to_vec(&report) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to serialize backpressure report");
                return;
            }
        };

        let topic = format!("{}.{}", self.config.monitoring_topic, self.config.model_name);
        if let Err(e) = self.client.publish(topic, payload.into()).await {
            warn!(error = %e, "failed to publish backpressure report");
            return;
        }

        if pending > 0 || status != "healthy" {
            info!(pending = pending, active = active, status = status, "backpressure report");
        } else {
            debug!(status = status, "backpressure report");
        }
    }
}
