//! # inference-fabric
//!
//! A distributed inference-serving fabric: per-model worker processes that
//! load a local model behind a narrow adapter, advertise their capabilities,
//! and serve requests over NATS JetStream and HTTP.
//!
//! ## Architecture
//!
//! ```text
//! client ── publish ──▶ inference.request.<model> ─▶ JetStream work queue
//!                                                        │ pull (1 msg, ~1s wait)
//!                                                   worker pool (W tasks)
//!                                                        │ dispatch by subject
//!                                     ┌──────────────────┼──────────────────┐
//!                                inference           embedding            audio
//!                                     └──────────────────┼──────────────────┘
//!                                                  model adapter
//!                                                        │
//! client ◀── publish on payload reply_to ────────────────┘  + audit row
//! ```
//!
//! The HTTP surface mirrors the queue handlers for debugging and direct
//! clients; the messaging path is the primary interface. A separate
//! `fabric-monitor` process aggregates worker heartbeats into a fleet view.

use thiserror::Error;

pub mod audit;
pub mod capabilities;
pub mod client;
pub mod config;
pub mod format;
pub mod grammar;
pub mod health;
pub mod http_api;
pub mod model;
pub mod monitor;
pub mod monitoring;
pub mod queue;
pub mod services;

// Re-exports for the common wiring path.
pub use config::Config;
pub use model::{EchoModel, GenerationParams, ModelAdapter, ModelMetadata};
pub use queue::QueueRuntime;

/// Top-level error for binary startup and wiring.
///
/// Module-specific failures carry their own error enums; this variant set
/// exists so `main` can propagate any of them with `?`.
#[derive(Error, Debug)]
pub enum FabricError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("audit store error: {0}")]
    Audit(#[from] audit::AuditError),

    #[error("model error: {0}")]
    Model(#[from] model::ModelError),

    #[error("queue error: {0}")]
    Queue(#[from] queue::QueueError),

    #[error("http error: {0}")]
    Http(#[from] http_api::HttpError),

    #[error("{0}")]
    Other(String),
}

/// Initialise tracing with env-filter support. Call once at binary startup.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}

/// Current Unix timestamp in seconds.
pub fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current Unix timestamp in milliseconds.
pub fn unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
