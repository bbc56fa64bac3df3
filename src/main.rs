//! Worker entry point: configuration, model provisioning, service wiring,
//! and orchestrated shutdown.

use inference_fabric::audit::AuditStore;
use inference_fabric::capabilities::{capabilities_summary, detect_capabilities};
use inference_fabric::config::Config;
use inference_fabric::grammar::GrammarService;
use inference_fabric::health::HealthService;
use inference_fabric::http_api::{self, AppState};
use inference_fabric::model::{self, EchoModel, ModelAdapter};
use inference_fabric::monitoring::{BackpressureMonitor, QueueCounters};
use inference_fabric::queue::QueueRuntime;
use inference_fabric::services::{AudioService, EmbeddingService, InferenceService};
use inference_fabric::FabricError;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    inference_fabric::init_tracing();

    if let Err(e) = run().await {
        error!(error = %e, "worker failed");
        std::process::exit(1);
    }
}

/// `--env <file>` is the only flag; everything else comes from the
/// environment.
fn env_file_arg() -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--env" || arg == "-e" {
            return args.next();
        }
    }
    None
}

async fn run() -> Result<(), FabricError> {
    let env_file = env_file_arg();
    let config = Arc::new(Config::load(env_file.as_deref())?);

    // The audit store is the only forensic trail; failing to open it is
    // fatal before any traffic is accepted.
    let audit = Arc::new(AuditStore::open(&config.db_path)?);
    audit.record_event(
        "info",
        "startup",
        "worker starting",
        serde_json::json!({
            "model_name": config.model_name,
            "http_addr": config.http_addr,
            "db_path": config.db_path,
        }),
    );

    audit.record_event(
        "info",
        "model.loading",
        "model loading started",
        serde_json::json!({
            "model_path": config.model_path,
            "model_name": config.model_name,
            "threads": config.threads,
            "ctx_size": config.ctx_size,
        }),
    );

    if let Err(e) = model::ensure_model_available(&config.model_path, &config.model_url).await {
        audit.record_event(
            "error",
            "model.failed",
            "model loading failed",
            serde_json::json!({"model_path": config.model_path, "error": e.to_string()}),
        );
        return Err(e.into());
    }

    let adapter: Arc<dyn ModelAdapter> = Arc::new(
        EchoModel::new()
            .with_architecture(&config.model_name)
            .with_embedding_size(0),
    );

    audit.record_event(
        "info",
        "model.loaded",
        "model loaded",
        serde_json::json!({"model_path": config.model_path, "model_name": config.model_name}),
    );

    let capabilities = detect_capabilities(&adapter.metadata());
    info!(
        model = %config.model_name,
        capabilities = %capabilities_summary(&capabilities),
        "capability detection completed"
    );

    audit.record_event(
        "info",
        "services.init",
        "initializing services",
        serde_json::json!({"http_addr": config.http_addr, "nats_url": config.nats_url}),
    );

    let grammar = Arc::new(GrammarService::new(config.grammar_root()));
    let inference = Arc::new(InferenceService::new(
        Arc::clone(&adapter),
        Arc::clone(&audit),
        Arc::clone(&grammar),
        &config,
    ));
    let embedding = Arc::new(EmbeddingService::new(
        Arc::clone(&adapter),
        Arc::clone(&audit),
    ));
    let audio = Arc::new(AudioService::new(Arc::clone(&adapter), Arc::clone(&audit)));

    let counters = QueueCounters::new();
    let queue = Arc::new(
        QueueRuntime::connect(
            Arc::clone(&config),
            Arc::clone(&counters),
            Arc::clone(&inference),
            Arc::clone(&embedding),
            Arc::clone(&audio),
        )
        .await?,
    );
    let nats_client = queue.client();

    let health = Arc::new(HealthService::new(
        Arc::clone(&config),
        Some(Arc::clone(&adapter)),
        capabilities,
        Arc::clone(&counters),
    ));

    let backpressure = BackpressureMonitor::new(
        nats_client.clone(),
        Arc::clone(&config),
        Arc::clone(&counters),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_state = Arc::new(AppState {
        inference,
        embedding,
        audio,
        grammar,
        health: Arc::clone(&health),
    });
    let http_addr = config.http_bind_addr();
    let http_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = http_api::start_server(&http_addr, http_state, http_shutdown).await {
            error!(error = %e, "http surface failed");
        }
    });

    let health_serve = Arc::clone(&health);
    let health_client = nats_client.clone();
    let health_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = health_serve.serve(health_client, health_shutdown).await {
            error!(error = %e, "health service failed");
        }
    });

    let heartbeat = Arc::clone(&health);
    let heartbeat_client = nats_client.clone();
    let heartbeat_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        heartbeat.heartbeat_loop(heartbeat_client, heartbeat_shutdown).await;
    });

    let monitor_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        backpressure.run(monitor_shutdown).await;
    });

    audit.record_event(
        "info",
        "server.ready",
        "worker ready to accept requests",
        serde_json::json!({
            "http_addr": config.http_addr,
            "model_name": config.model_name,
            "nats_url": config.nats_url,
        }),
    );

    // The worker pool is the process's reason to exist: if it stops without
    // being asked to, that is fatal.
    let mut queue_handle = tokio::spawn(queue.run(shutdown_rx));

    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            Ok(())
        }
        result = &mut queue_handle => {
            audit.record_event(
                "error",
                "queue.stopped",
                "queue runtime stopped unexpectedly",
                serde_json::json!({}),
            );
            match result {
                Ok(Ok(())) => Err(FabricError::Other(
                    "queue runtime stopped unexpectedly".to_string(),
                )),
                Ok(Err(e)) => Err(e.into()),
                Err(join_err) => Err(FabricError::Other(join_err.to_string())),
            }
        }
    };

    let _ = shutdown_tx.send(true);
    if !queue_handle.is_finished() {
        let _ = queue_handle.await;
    }

    info!("worker stopped");
    outcome
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
