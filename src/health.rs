//! # Health & Heartbeat Publisher
//!
//! ## Responsibility
//! Answer point-to-point health requests on `models.<name>.health` and
//! publish a periodic heartbeat on `monitoring.models.heartbeat.<normalized>`
//! carrying capabilities, queue depth, and backpressure level.
//!
//! ## Guarantees
//! - Snapshots are rebuilt on every request, never cached
//! - `status` is `online` for as long as the process lives; fleet-level
//!   busyness is expressed through `backpressure_status.level` (`busy` stays
//!   in the state enum for wire compatibility but is never produced here)
//! - Heartbeats are fire-and-forget; publish errors and snapshot panics are
//!   logged and the loop continues
//!
//! ## NOT Responsible For
//! - The fleet view across workers (see: `monitor`)

use crate::capabilities::{capability_strings, Capability};
use crate::config::Config;
use crate::model::{ModelAdapter, ModelMetadata};
use crate::monitoring::QueueCounters;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Heartbeat cadence; independent of load.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Health publisher errors.
#[derive(Error, Debug)]
pub enum HealthError {
    #[error("failed to subscribe to health topic: {0}")]
    Subscribe(String),
}

/// Lifecycle state advertised in health payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Online,
    Busy,
    Offline,
}

/// Queue depth numbers embedded in a health snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub pending_messages: i64,
    pub active_processing: i64,
    pub total_processed: i64,
    pub queue_capacity: i64,
    /// Unix seconds of the last completed message; zero when none yet.
    pub last_processed_time: i64,
}

/// Dashboard-facing backpressure classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureStatus {
    /// `healthy`, `warning`, `critical`, or `unknown`.
    pub level: String,
    /// `pending / queue_capacity`, in `[0, 1]`.
    pub utilization: f64,
    pub threshold: i64,
}

/// A complete health snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub model_name: String,
    pub status: ServiceState,
    /// Unix seconds at snapshot time.
    pub last_activity: u64,
    pub capabilities: Vec<String>,
    pub http_endpoint: String,
    pub queue_subject: String,
    pub version: String,
    pub model_info: ModelMetadata,
    pub queue_metrics: QueueMetrics,
    pub backpressure_status: BackpressureStatus,
    /// Unix seconds when the worker started.
    pub start_time: u64,
    /// Seconds since start.
    pub uptime: u64,
}

/// Normalize a model name for use as a heartbeat subject token: `.` and `_`
/// become `-`.
pub fn normalize_model_name(name: &str) -> String {
    name.replace(['.', '_'], "-")
}

/// The heartbeat subject for a model name.
pub fn heartbeat_topic(model_name: &str) -> String {
    format!(
        "monitoring.models.heartbeat.{}",
        normalize_model_name(model_name)
    )
}

/// The point-to-point health subject for a model name.
pub fn health_topic(model_name: &str) -> String {
    format!("models.{model_name}.health")
}

/// Classify backpressure for the health snapshot.
///
/// This intentionally differs from the monitor report's classification
/// (`monitoring::classify_load`): the report is a load signal over
/// `pending + active` with `critical` starting at the threshold, while this
/// is a coarser dashboard cue over `pending` alone with `critical` at twice
/// the threshold.
pub fn classify_backpressure(pending: i64, threshold: i64) -> &'static str {
    let threshold = if threshold <= 0 { 5 } else { threshold };
    if pending >= threshold * 2 {
        "critical"
    } else if pending >= threshold {
        "warning"
    } else {
        "healthy"
    }
}

/// Answers health requests and publishes heartbeats for one worker.
///
/// Snapshot construction is transport-free; the bus client is handed in only
/// where a subscription or publish actually happens.
pub struct HealthService {
    config: Arc<Config>,
    adapter: Option<Arc<dyn ModelAdapter>>,
    capabilities: Vec<Capability>,
    counters: Arc<QueueCounters>,
    start_unix: u64,
    start: std::time::Instant,
}

impl HealthService {
    pub fn new(
        config: Arc<Config>,
        adapter: Option<Arc<dyn ModelAdapter>>,
        capabilities: Vec<Capability>,
        counters: Arc<QueueCounters>,
    ) -> Self {
        Self {
            config,
            adapter,
            capabilities,
            counters,
            start_unix: crate::unix_timestamp(),
            start: std::time::Instant::now(),
        }
    }

    /// Build a fresh snapshot.
    ///
    /// A worker without a loaded adapter still answers with minimal metadata
    /// so discovery keeps functioning during partial failures.
    pub fn snapshot(&self) -> HealthStatus {
        let model_info = match &self.adapter {
            Some(adapter) => adapter.metadata(),
            None => {
                warn!(model = %self.config.model_name, "model adapter is nil in health service");
                ModelMetadata {
                    architecture: "unknown".to_string(),
                    modalities: vec!["text".to_string()],
                    ..Default::default()
                }
            }
        };

        let pending = self.counters.pending();
        let queue_metrics = QueueMetrics {
            pending_messages: pending,
            active_processing: self.counters.active(),
            total_processed: self.counters.total_processed(),
            queue_capacity: self.config.max_msgs,
            last_processed_time: self.counters.last_processed_unix(),
        };

        let utilization = if self.config.max_msgs > 0 {
            pending as f64 / self.config.max_msgs as f64
        } else {
            0.0
        };
        let backpressure_status = BackpressureStatus {
            level: classify_backpressure(pending, self.config.backpressure_threshold).to_string(),
            utilization,
            threshold: if self.config.backpressure_threshold <= 0 {
                5
            } else {
                self.config.backpressure_threshold
            },
        };

        HealthStatus {
            model_name: self.config.model_name.clone(),
            status: ServiceState::Online,
            last_activity: crate::unix_timestamp(),
            capabilities: capability_strings(&self.capabilities),
            http_endpoint: self.config.http_endpoint(),
            queue_subject: self.config.subject.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            model_info,
            queue_metrics,
            backpressure_status,
            start_time: self.start_unix,
            uptime: self.start.elapsed().as_secs(),
        }
    }

    /// Serve point-to-point health requests until shutdown.
    pub async fn serve(
        &self,
        client: async_nats::Client,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), HealthError> {
        use futures::StreamExt;

        let topic = health_topic(&self.config.model_name);
        let mut subscriber = client
            .subscribe(topic.clone())
            .await
            .map_err(|e| HealthError::Subscribe(e.to_string()))?;

        info!(topic = %topic, "health service started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                message = subscriber.next() => {
                    let Some(message) = message else { break };
                    let Some(reply) = message.reply else { continue };

                    let payload = match serde_json::to_vec(&self.snapshot()) {
                        Ok(p) => p,
                        Err(e) => {
                            error!(error = %e, "failed to serialize health status");
                            continue;
                        }
                    };
                    if let Err(e) = client.publish(reply, payload.into()).await {
                        error!(error = %e, "failed to respond to health check");
                    }
                }
            }
        }

        info!("health service stopped");
        Ok(())
    }

    /// Publish a heartbeat every 30 seconds until shutdown.
    ///
    /// Snapshot construction is guarded: a panic is recovered and logged and
    /// the loop keeps going.
    pub async fn heartbeat_loop(
        &self,
        client: async_nats::Client,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let topic = heartbeat_topic(&self.config.model_name);
        info!(
            model = %self.config.model_name,
            topic = %topic,
            "starting heartbeat publishing"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(model = %self.config.model_name, "heartbeat publishing stopped");
                        return;
                    }
                }
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                    self.publish_heartbeat(&client, &topic).await;
                }
            }
        }
    }

    async fn publish_heartbeat(&self, client: &async_nats::Client, topic: &str) {
        let snapshot = match std::panic::catch_unwind(AssertUnwindSafe(|| self.snapshot())) {
            Ok(snapshot) => snapshot,
            Err(_) => {
                error!(model = %self.config.model_name, "panic while building health snapshot");
                return;
            }
        };

        let payload = match serde_json::to_vec(&snapshot) {
            Ok(p) => p,
            Err(e) => {
                error!(model = %self.config.model_name, error = %e, "failed to serialize heartbeat");
                return;
            }
        };

        match client.publish(topic.to_string(), payload.into()).await {
            Ok(()) => {
                info!(model = %self.config.model_name, topic = topic, "published heartbeat");
            }
            Err(e) => {
                error!(
                    model = %self.config.model_name,
                    topic = topic,
                    error = %e,
                    "failed to publish heartbeat"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_replaces_dots_and_underscores() {
        assert_eq!(normalize_model_name("nomic-embed-v1.5"), "nomic-embed-v1-5");
        assert_eq!(normalize_model_name("gpt_oss_20b"), "gpt-oss-20b");
        assert_eq!(normalize_model_name("plain"), "plain");
    }

    #[test]
    fn test_heartbeat_topic_uses_normalized_name() {
        assert_eq!(
            heartbeat_topic("nomic-embed-v1.5"),
            "monitoring.models.heartbeat.nomic-embed-v1-5"
        );
    }

    #[test]
    fn test_health_topic_shape() {
        assert_eq!(health_topic("gemma3-1b"), "models.gemma3-1b.health");
    }

    #[test]
    fn test_classify_backpressure_below_threshold_is_healthy() {
        assert_eq!(classify_backpressure(0, 5), "healthy");
        assert_eq!(classify_backpressure(4, 5), "healthy");
    }

    #[test]
    fn test_classify_backpressure_between_one_and_two_thresholds_is_warning() {
        assert_eq!(classify_backpressure(5, 5), "warning");
        assert_eq!(classify_backpressure(9, 5), "warning");
    }

    #[test]
    fn test_classify_backpressure_at_double_threshold_is_critical() {
        assert_eq!(classify_backpressure(10, 5), "critical");
        assert_eq!(classify_backpressure(50, 5), "critical");
    }

    #[test]
    fn test_classify_backpressure_zero_threshold_defaults_to_five() {
        assert_eq!(classify_backpressure(4, 0), "healthy");
        assert_eq!(classify_backpressure(5, 0), "warning");
        assert_eq!(classify_backpressure(10, 0), "critical");
    }

    #[test]
    fn test_service_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ServiceState::Online).unwrap(),
            "\"online\""
        );
        assert_eq!(
            serde_json::to_string(&ServiceState::Offline).unwrap(),
            "\"offline\""
        );
        let state: ServiceState = serde_json::from_str("\"busy\"").unwrap();
        assert_eq!(state, ServiceState::Busy);
    }

    fn service_without_adapter() -> HealthService {
        let config = Arc::new(Config::load(None).unwrap());
        HealthService::new(config, None, Vec::new(), QueueCounters::new())
    }

    #[test]
    fn test_snapshot_degrades_gracefully_without_adapter() {
        let snapshot = service_without_adapter().snapshot();
        assert_eq!(snapshot.status, ServiceState::Online);
        assert_eq!(snapshot.model_info.architecture, "unknown");
        assert_eq!(snapshot.model_info.modalities, vec!["text".to_string()]);
    }

    #[test]
    fn test_snapshot_reflects_queue_counters() {
        let config = Arc::new(Config::load(None).unwrap());
        let counters = QueueCounters::new();
        for _ in 0..6 {
            counters.increment_pending();
        }
        counters.record_processed();

        let service = HealthService::new(config, None, Vec::new(), Arc::clone(&counters));
        let snapshot = service.snapshot();
        assert_eq!(snapshot.queue_metrics.pending_messages, 6);
        assert_eq!(snapshot.queue_metrics.total_processed, 1);
        // 6 pending against the default threshold of 5 reads as warning.
        assert_eq!(snapshot.backpressure_status.level, "warning");
        assert!(snapshot.backpressure_status.utilization > 0.0);
        assert!(snapshot.queue_metrics.last_processed_time > 0);
    }

    #[test]
    fn test_snapshot_is_rebuilt_per_call() {
        let config = Arc::new(Config::load(None).unwrap());
        let counters = QueueCounters::new();
        let service = HealthService::new(config, None, Vec::new(), Arc::clone(&counters));

        assert_eq!(service.snapshot().queue_metrics.pending_messages, 0);
        counters.increment_pending();
        assert_eq!(service.snapshot().queue_metrics.pending_messages, 1);
    }

    #[test]
    fn test_health_status_round_trips_through_json() {
        let status = HealthStatus {
            model_name: "m".into(),
            status: ServiceState::Online,
            last_activity: 1,
            capabilities: vec!["text-generation".into()],
            http_endpoint: "http://localhost:8081".into(),
            queue_subject: "inference.request.m".into(),
            version: "0.3.1".into(),
            model_info: ModelMetadata {
                architecture: "echo".into(),
                modalities: vec!["text".into()],
                ..Default::default()
            },
            queue_metrics: QueueMetrics::default(),
            backpressure_status: BackpressureStatus {
                level: "healthy".into(),
                utilization: 0.0,
                threshold: 5,
            },
            start_time: 1,
            uptime: 0,
        };

        let json = serde_json::to_string(&status).unwrap();
        let parsed: HealthStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.model_name, "m");
        assert_eq!(parsed.status, ServiceState::Online);
        assert_eq!(parsed.backpressure_status.level, "healthy");
    }
}
