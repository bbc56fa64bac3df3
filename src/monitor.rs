//! # Fleet Monitor
//!
//! ## Responsibility
//! Aggregate worker heartbeats into a live fleet view, keyed by model name.
//! Workers that stop heartbeating are marked offline after two minutes but
//! never deleted; `first_seen` is preserved across updates so uptime stays
//! monotonic.
//!
//! ## Guarantees
//! - `first_seen` for a given model never moves forward once recorded
//! - A worker missing from heartbeats can still be found through on-demand
//!   health queries over a configured candidate list
//! - Listeners receive one notification per fleet change
//!
//! ## NOT Responsible For
//! - Producing heartbeats (see: `health`)

use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// A worker is offline after this long without a heartbeat.
const STALE_AFTER_SECS: u64 = 120;
/// How often the stale sweep runs.
const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// How often candidate discovery re-runs.
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(120);
/// Timeout for one on-demand health query.
const HEALTH_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Fleet monitor errors.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("failed to connect to NATS: {0}")]
    Connect(String),

    #[error("failed to subscribe to heartbeats: {0}")]
    Subscribe(String),

    #[error("health check failed: {0}")]
    Request(String),

    #[error("failed to parse payload: {0}")]
    Parse(String),
}

/// One tracked worker, as shown in the fleet view.
///
/// Nested blocks stay loosely typed so the monitor tolerates payloads from
/// newer or older workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub model_name: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub http_endpoint: String,
    #[serde(default)]
    pub queue_subject: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub model_info: serde_json::Value,
    #[serde(default)]
    pub queue_metrics: serde_json::Value,
    #[serde(default)]
    pub backpressure_status: serde_json::Value,
    /// Unix seconds this monitor last heard from the worker.
    #[serde(default)]
    pub last_seen: u64,
    /// Unix seconds this monitor first saw the worker.
    #[serde(default)]
    pub first_seen: u64,
    /// Seconds since `first_seen`.
    #[serde(default)]
    pub uptime: u64,
}

fn default_status() -> String {
    "online".to_string()
}

/// In-memory fleet state, separated from transport for testability.
pub struct FleetState {
    services: DashMap<String, ServiceStatus>,
    notifier: broadcast::Sender<Vec<ServiceStatus>>,
}

impl FleetState {
    pub fn new() -> Self {
        let (notifier, _) = broadcast::channel(32);
        Self {
            services: DashMap::new(),
            notifier,
        }
    }

    /// Apply one heartbeat payload observed at `now`.
    pub fn apply_heartbeat(&self, mut status: ServiceStatus, now: u64) {
        let first_seen = self
            .services
            .get(&status.model_name)
            .map(|existing| existing.first_seen)
            .unwrap_or(now);

        status.first_seen = first_seen;
        status.last_seen = now;
        status.uptime = now.saturating_sub(first_seen);

        debug!(
            model = %status.model_name,
            status = %status.status,
            uptime = status.uptime,
            "fleet update"
        );
        self.services.insert(status.model_name.clone(), status);
        self.notify();
    }

    /// Record a worker discovered by an on-demand health query. Heartbeat
    /// tracking wins: an already-known worker is left untouched.
    pub fn apply_discovery(&self, mut status: ServiceStatus, now: u64) {
        if self.services.contains_key(&status.model_name) {
            return;
        }
        status.first_seen = now;
        status.last_seen = now;
        status.uptime = 0;
        info!(model = %status.model_name, "discovered worker via health query");
        self.services.insert(status.model_name.clone(), status);
        self.notify();
    }

    /// Mark workers silent for over [`STALE_AFTER_SECS`] as offline.
    /// Offline workers are kept so dashboards can show the outage.
    pub fn mark_stale(&self, now: u64) {
        let mut changed = false;
        for mut entry in self.services.iter_mut() {
            if now.saturating_sub(entry.last_seen) > STALE_AFTER_SECS
                && entry.status != "offline"
            {
                entry.status = "offline".to_string();
                info!(model = %entry.model_name, "marked worker offline");
                changed = true;
            }
        }
        if changed {
            self.notify();
        }
    }

    /// Snapshot of every tracked worker, sorted by model name.
    pub fn services(&self) -> Vec<ServiceStatus> {
        let mut list: Vec<ServiceStatus> =
            self.services.iter().map(|e| e.value().clone()).collect();
        list.sort_by(|a, b| a.model_name.cmp(&b.model_name));
        list
    }

    /// Subscribe to fleet-change notifications.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<Vec<ServiceStatus>> {
        self.notifier.subscribe()
    }

    fn notify(&self) {
        // No receivers is fine; events are best-effort.
        let _ = self.notifier.send(self.services());
    }
}

impl Default for FleetState {
    fn default() -> Self {
        Self::new()
    }
}

/// The monitor process core: heartbeat subscription + discovery + state.
pub struct FleetMonitor {
    client: async_nats::Client,
    state: Arc<FleetState>,
    candidates: Vec<String>,
}

impl FleetMonitor {
    /// Connect to the bus. `candidates` seeds on-demand discovery for
    /// workers whose heartbeats have not arrived yet.
    pub async fn connect(nats_url: &str, candidates: Vec<String>) -> Result<Self, MonitorError> {
        let client = async_nats::connect(nats_url)
            .await
            .map_err(|e| MonitorError::Connect(e.to_string()))?;
        Ok(Self {
            client,
            state: Arc::new(FleetState::new()),
            candidates,
        })
    }

    pub fn state(&self) -> Arc<FleetState> {
        Arc::clone(&self.state)
    }

    /// Run heartbeat consumption, the stale sweep, and periodic discovery
    /// until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), MonitorError> {
        let mut subscriber = self
            .client
            .subscribe("monitoring.models.heartbeat.*".to_string())
            .await
            .map_err(|e| MonitorError::Subscribe(e.to_string()))?;

        info!("fleet monitor started, listening for heartbeats");

        // Initial discovery pass before the first sweep.
        self.discover().await;

        let mut stale_tick = tokio::time::interval(STALE_SWEEP_INTERVAL);
        let mut discovery_tick = tokio::time::interval(DISCOVERY_INTERVAL);
        stale_tick.tick().await;
        discovery_tick.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("fleet monitor shutting down");
                        return Ok(());
                    }
                }
                message = subscriber.next() => {
                    let Some(message) = message else { return Ok(()) };
                    match serde_json::from_slice::<ServiceStatus>(&message.payload) {
                        Ok(status) => {
                            self.state.apply_heartbeat(status, crate::unix_timestamp());
                        }
                        Err(e) => {
                            warn!(
                                subject = %message.subject,
                                error = %e,
                                "failed to parse heartbeat"
                            );
                        }
                    }
                }
                _ = stale_tick.tick() => {
                    self.state.mark_stale(crate::unix_timestamp());
                }
                _ = discovery_tick.tick() => {
                    self.discover().await;
                }
            }
        }
    }

    /// Query health for one model (used by the live `/api/services/<name>`
    /// endpoint as well as discovery).
    pub async fn query_health(&self, model_name: &str) -> Result<ServiceStatus, MonitorError> {
        let subject = crate::health::health_topic(model_name);
        let response = tokio::time::timeout(
            HEALTH_QUERY_TIMEOUT,
            self.client.request(subject, "{}".into()),
        )
        .await
        .map_err(|_| MonitorError::Request(format!("health query for {model_name} timed out")))?
        .map_err(|e| MonitorError::Request(e.to_string()))?;

        serde_json::from_slice(&response.payload).map_err(|e| MonitorError::Parse(e.to_string()))
    }

    async fn discover(&self) {
        for model in &self.candidates {
            match self.query_health(model).await {
                Ok(status) => self.state.apply_discovery(status, crate::unix_timestamp()),
                Err(e) => debug!(model = %model, error = %e, "discovery probe failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(model: &str) -> ServiceStatus {
        ServiceStatus {
            model_name: model.to_string(),
            status: "online".to_string(),
            capabilities: vec!["text-generation".to_string()],
            http_endpoint: String::new(),
            queue_subject: String::new(),
            version: String::new(),
            model_info: serde_json::Value::Null,
            queue_metrics: serde_json::Value::Null,
            backpressure_status: serde_json::Value::Null,
            last_seen: 0,
            first_seen: 0,
            uptime: 0,
        }
    }

    #[test]
    fn test_first_seen_preserved_across_heartbeats() {
        let state = FleetState::new();
        state.apply_heartbeat(heartbeat("m"), 100);
        state.apply_heartbeat(heartbeat("m"), 250);

        let services = state.services();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].first_seen, 100);
        assert_eq!(services[0].last_seen, 250);
        assert_eq!(services[0].uptime, 150);
    }

    #[test]
    fn test_stale_worker_marked_offline_not_deleted() {
        let state = FleetState::new();
        state.apply_heartbeat(heartbeat("m"), 100);
        state.mark_stale(100 + STALE_AFTER_SECS + 1);

        let services = state.services();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].status, "offline");
    }

    #[test]
    fn test_fresh_worker_not_marked_offline() {
        let state = FleetState::new();
        state.apply_heartbeat(heartbeat("m"), 100);
        state.mark_stale(100 + STALE_AFTER_SECS);
        assert_eq!(state.services()[0].status, "online");
    }

    #[test]
    fn test_heartbeat_revives_offline_worker() {
        let state = FleetState::new();
        state.apply_heartbeat(heartbeat("m"), 100);
        state.mark_stale(100 + STALE_AFTER_SECS + 1);
        state.apply_heartbeat(heartbeat("m"), 400);
        assert_eq!(state.services()[0].status, "online");
        assert_eq!(state.services()[0].first_seen, 100);
    }

    #[test]
    fn test_discovery_does_not_overwrite_heartbeat_tracking() {
        let state = FleetState::new();
        state.apply_heartbeat(heartbeat("m"), 100);
        state.apply_discovery(heartbeat("m"), 500);
        assert_eq!(state.services()[0].first_seen, 100);
    }

    #[test]
    fn test_discovery_adds_unknown_worker_with_zero_uptime() {
        let state = FleetState::new();
        state.apply_discovery(heartbeat("new"), 500);
        let services = state.services();
        assert_eq!(services[0].first_seen, 500);
        assert_eq!(services[0].uptime, 0);
    }

    #[test]
    fn test_services_sorted_by_model_name() {
        let state = FleetState::new();
        state.apply_heartbeat(heartbeat("zeta"), 1);
        state.apply_heartbeat(heartbeat("alpha"), 1);
        let names: Vec<_> = state.services().into_iter().map(|s| s.model_name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_change_notifications_fan_out() {
        let state = FleetState::new();
        let mut rx = state.subscribe_changes();
        state.apply_heartbeat(heartbeat("m"), 1);
        let update = rx.try_recv().expect("one change notification");
        assert_eq!(update.len(), 1);
        assert_eq!(update[0].model_name, "m");
    }

    #[test]
    fn test_heartbeat_parses_health_status_payload() {
        // A worker heartbeat payload must deserialize into the monitor's view.
        let payload = serde_json::json!({
            "model_name": "gemma3-1b",
            "status": "online",
            "last_activity": 1,
            "capabilities": ["text-generation"],
            "http_endpoint": "http://localhost:8081",
            "queue_subject": "inference.request.gemma3-1b",
            "version": "0.3.1",
            "model_info": {"architecture": "gemma", "modalities": ["text"]},
            "queue_metrics": {"pending_messages": 0},
            "backpressure_status": {"level": "healthy", "utilization": 0.0, "threshold": 5},
            "start_time": 1,
            "uptime": 10,
        });
        let status: ServiceStatus = serde_json::from_value(payload).unwrap();
        assert_eq!(status.model_name, "gemma3-1b");
        assert_eq!(status.status, "online");
        assert_eq!(status.model_info["architecture"], "gemma");
    }
}
