//! Integration tests for the HTTP surface.
//!
//! Each test spawns a real server on a unique port backed by the echo model
//! adapter and an in-memory audit store, then exercises it via `reqwest`.
//! No messaging bus or native model required.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use inference_fabric::audit::AuditStore;
use inference_fabric::capabilities::detect_capabilities;
use inference_fabric::config::Config;
use inference_fabric::grammar::GrammarService;
use inference_fabric::health::HealthService;
use inference_fabric::http_api::{start_server, AppState};
use inference_fabric::model::{EchoModel, ModelAdapter};
use inference_fabric::monitoring::QueueCounters;
use inference_fabric::services::{AudioService, EmbeddingService, InferenceService};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::sync::watch;

/// Unique per-test port allocation; starts high to avoid common services.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(29400);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::Relaxed)
}

struct TestServer {
    base: String,
    _shutdown: watch::Sender<bool>,
    _data_dir: tempfile::TempDir,
}

async fn spawn_server() -> TestServer {
    let data_dir = tempfile::tempdir().expect("test: temp dir");
    let mut config = Config::load(None).expect("test: config");
    config.data_dir = data_dir.path().join("data").display().to_string();
    config.model_path = data_dir.path().join("model.gguf").display().to_string();
    config.model_format = "standard".to_string();
    let config = Arc::new(config);

    let adapter: Arc<dyn ModelAdapter> = Arc::new(
        EchoModel::new()
            .with_embedding_size(8)
            .with_modalities(&["text", "audio"]),
    );
    let audit = Arc::new(AuditStore::in_memory().expect("test: audit store"));
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
    let health = Arc::new(HealthService::new(
        Arc::clone(&config),
        Some(Arc::clone(&adapter)),
        detect_capabilities(&adapter.metadata()),
        QueueCounters::new(),
    ));

    let state = Arc::new(AppState {
        inference,
        embedding,
        audio,
        grammar,
        health,
    });

    let port = next_port();
    let addr = format!("127.0.0.1:{port}");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_addr = addr.clone();
    tokio::spawn(async move {
        let _ = start_server(&server_addr, state, shutdown_rx).await;
    });
    // Give the server a moment to bind.
    tokio::time::sleep(Duration::from_millis(200)).await;

    TestServer {
        base: format!("http://{addr}"),
        _shutdown: shutdown_tx,
        _data_dir: data_dir,
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .expect("test: reqwest client")
}

// ── completions ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_completions_happy_path() {
    let server = spawn_server().await;
    let resp = client()
        .post(format!("{}/v1/completions", server.base))
        .json(&json!({
            "req_id": "r1",
            "input": "what is two plus two",
            "params": {"max_tokens": 8, "temperature": 0}
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["req_id"], "r1");
    assert!(!body["text"].as_str().unwrap().is_empty());
    assert!(body["tokens_in"].as_i64().unwrap() > 0);
    let tokens_out = body["tokens_out"].as_i64().unwrap();
    assert!((1..=8).contains(&tokens_out));
    assert!(body.get("error").is_none());
}

#[tokio::test]
async fn test_completions_generates_req_id_when_absent() {
    let server = spawn_server().await;
    let resp = client()
        .post(format!("{}/v1/completions", server.base))
        .json(&json!({"req_id": "", "input": "hello"}))
        .send()
        .await
        .unwrap();

    let body: Value = resp.json().await.unwrap();
    assert!(!body["req_id"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_completions_malformed_body_is_400() {
    let server = spawn_server().await;
    let resp = client()
        .post(format!("{}/v1/completions", server.base))
        .header("content-type", "application/json")
        .body("{not valid json")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"]["message"].is_string());
    assert_eq!(body["error"]["type"], "invalid_request");
}

#[tokio::test]
async fn test_completions_wrong_method_is_405() {
    let server = spawn_server().await;
    let resp = client()
        .get(format!("{}/v1/completions", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
}

// ── healthz / logs ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_healthz_reports_online_with_capabilities() {
    let server = spawn_server().await;
    let resp = client()
        .get(format!("{}/healthz", server.base))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "online");
    let caps: Vec<String> = body["capabilities"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c.as_str().unwrap().to_string())
        .collect();
    assert!(caps.contains(&"text-generation".to_string()));
    assert!(caps.contains(&"embeddings".to_string()));
    assert!(caps.contains(&"audio-transcription".to_string()));
    assert!(body["queue_metrics"]["pending_messages"].is_i64());
    assert!(body["backpressure_status"]["level"].is_string());
}

#[tokio::test]
async fn test_logs_returns_audited_requests() {
    let server = spawn_server().await;
    let http = client();

    for req_id in ["l1", "l2"] {
        let _ = http
            .post(format!("{}/v1/completions", server.base))
            .json(&json!({"req_id": req_id, "input": "hi"}))
            .send()
            .await
            .unwrap();
    }

    let resp = http
        .get(format!("{}/logs?limit=1", server.base))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    let logs = body["logs"].as_array().unwrap();
    assert_eq!(logs.len(), 1);
    // Newest first.
    assert_eq!(logs[0]["req_id"], "l2");
    assert_eq!(logs[0]["status"], "ok");
}

// ── embeddings ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_embeddings_batch_shape() {
    let server = spawn_server().await;
    let resp = client()
        .post(format!("{}/v1/embeddings", server.base))
        .json(&json!({"req_id": "e1", "input": ["a", "b", "c"], "model": "E"}))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["object"], "list");
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 3);
    for (i, item) in data.iter().enumerate() {
        assert_eq!(item["index"].as_u64().unwrap() as usize, i);
        assert_eq!(item["embedding"].as_array().unwrap().len(), 8);
    }
    assert_eq!(body["usage"]["total_tokens"], 3);
}

#[tokio::test]
async fn test_embeddings_empty_input_carries_error_in_body() {
    let server = spawn_server().await;
    let resp = client()
        .post(format!("{}/v1/embeddings", server.base))
        .json(&json!({"req_id": "e2", "input": []}))
        .send()
        .await
        .unwrap();

    // Handler errors are 200s with an error payload.
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "empty input");
}

// ── audio ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_transcriptions_without_file_field_is_400() {
    let server = spawn_server().await;
    let form = reqwest::multipart::Form::new().text("language", "en");
    let resp = client()
        .post(format!("{}/v1/audio/transcriptions", server.base))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_transcriptions_with_file_returns_response_payload() {
    let server = spawn_server().await;
    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(vec![0u8; 64]).file_name("clip.wav"),
    );
    let resp = client()
        .post(format!("{}/v1/audio/transcriptions", server.base))
        .multipart(form)
        .send()
        .await
        .unwrap();

    // Conversion outcome depends on the host having ffmpeg; either way the
    // handler answers 200 with a response-shaped body.
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert!(body["req_id"].is_string());
    assert!(body.get("text").is_some() || body.get("error").is_some());
}

// ── grammar CRUD ─────────────────────────────────────────────────────────

const GRAMMAR_BODY: &str = "root ::= \"yes\" | \"no\"";

#[tokio::test]
async fn test_grammar_crud_lifecycle() {
    let server = spawn_server().await;
    let http = client();

    // Create.
    let resp = http
        .post(format!("{}/grammars/default/yesno", server.base))
        .json(&json!({"grammar": GRAMMAR_BODY, "description": "binary answers"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    // Duplicate create conflicts.
    let resp = http
        .post(format!("{}/grammars/default/yesno", server.base))
        .json(&json!({"grammar": GRAMMAR_BODY}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    // Read back.
    let resp = http
        .get(format!("{}/grammars/default/yesno", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["name"], "yesno");
    assert_eq!(body["body"], GRAMMAR_BODY);

    // Update.
    let resp = http
        .put(format!("{}/grammars/default/yesno", server.base))
        .json(&json!({"grammar": "root ::= \"maybe\""}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // List.
    let resp = http
        .get(format!("{}/grammars/default", server.base))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["grammars"].as_array().unwrap().len(), 1);

    // Delete, then 404.
    let resp = http
        .delete(format!("{}/grammars/default/yesno", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = http
        .get(format!("{}/grammars/default/yesno", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_grammar_invalid_name_is_400() {
    let server = spawn_server().await;
    let resp = client()
        .post(format!("{}/grammars/default/bad:name", server.base))
        .json(&json!({"grammar": GRAMMAR_BODY}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_grammar_missing_rules_is_400() {
    let server = spawn_server().await;
    let resp = client()
        .post(format!("{}/grammars/default/norules", server.base))
        .json(&json!({"grammar": "plain text"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_default_grammar_directory_cannot_be_deleted() {
    let server = spawn_server().await;
    let resp = client()
        .delete(format!("{}/grammars/default", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_grammar_directory_lifecycle() {
    let server = spawn_server().await;
    let http = client();

    let resp = http
        .post(format!("{}/grammars/team", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = http.get(format!("{}/grammars", server.base)).send().await.unwrap();
    let body: Value = resp.json().await.unwrap();
    let dirs: Vec<&str> = body["directories"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d.as_str().unwrap())
        .collect();
    assert!(dirs.contains(&"team"));

    let resp = http
        .delete(format!("{}/grammars/team", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}
