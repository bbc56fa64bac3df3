//! Fleet monitor binary: aggregates worker heartbeats and serves the fleet
//! view over HTTP (`/api/services`, `/api/services/:name`, `/api/events`).

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use inference_fabric::monitor::FleetMonitor;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, info};

struct MonitorState {
    monitor: Arc<FleetMonitor>,
}

#[derive(Debug, Clone)]
struct Options {
    nats_url: String,
    http_addr: String,
    candidates: Vec<String>,
}

/// `--nats <url> --http <addr> --models <a,b,c>`, with environment
/// fallbacks `NATS_URL`, `MONITOR_HTTP_ADDR`, `MONITOR_MODELS`.
fn parse_options() -> Options {
    let mut options = Options {
        nats_url: std::env::var("NATS_URL").unwrap_or_else(|_| "nats://127.0.0.1:4222".into()),
        http_addr: std::env::var("MONITOR_HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:5780".into()),
        candidates: std::env::var("MONITOR_MODELS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    };

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--nats" => {
                if let Some(v) = args.next() {
                    options.nats_url = v;
                }
            }
            "--http" => {
                if let Some(v) = args.next() {
                    options.http_addr = v;
                }
            }
            "--models" => {
                if let Some(v) = args.next() {
                    options.candidates = v
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect();
                }
            }
            _ => {}
        }
    }

    options
}

#[tokio::main]
async fn main() {
    inference_fabric::init_tracing();
    let options = parse_options();

    let monitor = match FleetMonitor::connect(&options.nats_url, options.candidates.clone()).await
    {
        Ok(monitor) => Arc::new(monitor),
        Err(e) => {
            error!(url = %options.nats_url, error = %e, "failed to start fleet monitor");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runner = Arc::clone(&monitor);
    let run_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = runner.run(run_shutdown).await {
            error!(error = %e, "fleet monitor stopped");
        }
    });

    let state = Arc::new(MonitorState { monitor });
    let app = Router::new()
        .route("/api/services", get(list_services))
        .route("/api/services/:name", get(live_service))
        .route("/api/events", get(events))
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(&options.http_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %options.http_addr, error = %e, "failed to bind monitor http");
            std::process::exit(1);
        }
    };
    info!(addr = %options.http_addr, "fleet monitor http listening");

    let mut serve_shutdown = shutdown_rx;
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = serve_shutdown.changed().await;
    });

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!(error = %e, "monitor http failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
}

/// Current fleet snapshot.
async fn list_services(State(state): State<Arc<MonitorState>>) -> Response {
    Json(state.monitor.state().services()).into_response()
}

/// Live health query for one worker, bypassing the cached fleet view.
async fn live_service(
    State(state): State<Arc<MonitorState>>,
    Path(name): Path<String>,
) -> Response {
    match state.monitor.query_health(&name).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": {"message": e.to_string(), "type": "not_found"}
            })),
        )
            .into_response(),
    }
}

/// Server-sent events: one event per fleet change.
async fn events(
    State(state): State<Arc<MonitorState>>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.monitor.state().subscribe_changes();
    let stream = BroadcastStream::new(rx).filter_map(|update| async move {
        let services = update.ok()?;
        let data = serde_json::to_string(&services).ok()?;
        Some(Ok(Event::default().data(data)))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
