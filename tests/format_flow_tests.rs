//! Cross-module tests: configured prompt formats flowing through the
//! text-generation service, with the audit trail as the observation point.

use inference_fabric::audit::AuditStore;
use inference_fabric::config::Config;
use inference_fabric::grammar::GrammarService;
use inference_fabric::model::EchoModel;
use inference_fabric::services::{InferenceRequest, InferenceService};
use std::sync::Arc;

fn build_service(format: &str, dir: &tempfile::TempDir) -> (InferenceService, Arc<AuditStore>) {
    let mut config = Config::load(None).expect("test: config");
    config.data_dir = dir.path().join("data").display().to_string();
    config.model_path = dir.path().join("model.gguf").display().to_string();
    config.model_format = format.to_string();
    config.format_config.clear();

    let audit = Arc::new(AuditStore::in_memory().expect("test: audit store"));
    let grammar = Arc::new(GrammarService::new(config.grammar_root()));
    let service = InferenceService::new(
        Arc::new(EchoModel::new()),
        Arc::clone(&audit),
        grammar,
        &config,
    );
    (service, audit)
}

fn request(req_id: &str, input: &str) -> InferenceRequest {
    InferenceRequest {
        req_id: req_id.to_string(),
        input: input.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_standard_format_without_system_prompt_is_passthrough() {
    let dir = tempfile::tempdir().unwrap();
    let (service, audit) = build_service("standard", &dir);

    let _ = service.process(request("f1", "plain input"), "test", "w").await;

    let row = &audit.recent_requests(1).unwrap()[0];
    assert_eq!(row.formatted_input, row.raw_input);
}

#[tokio::test]
async fn test_chatml_format_frames_the_audited_prompt() {
    let dir = tempfile::tempdir().unwrap();
    let (service, audit) = build_service("chatml", &dir);

    let _ = service.process(request("f2", "hello"), "test", "w").await;

    let row = &audit.recent_requests(1).unwrap()[0];
    assert!(row
        .formatted_input
        .starts_with("<|im_start|>user\nhello<|im_end|>"));
    assert!(row.formatted_input.ends_with("<|im_start|>assistant\n"));
    assert_eq!(row.raw_input, "hello");
}

#[tokio::test]
async fn test_template_format_reads_model_directory_template() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("prompt_template.json"),
        serde_json::json!({
            "name": "framed",
            "system_role": "You answer briefly.",
            "user_prefix": "<q>",
            "user_suffix": "</q>",
            "model_prefix": "<a>"
        })
        .to_string(),
    )
    .unwrap();

    let (service, audit) = build_service("template", &dir);
    let _ = service.process(request("f3", "why"), "test", "w").await;

    let row = &audit.recent_requests(1).unwrap()[0];
    assert_eq!(row.formatted_input, "You answer briefly.\n<q>why</q><a>");
}

#[tokio::test]
async fn test_raw_flag_bypasses_configured_format() {
    let dir = tempfile::tempdir().unwrap();
    let (service, audit) = build_service("chatml", &dir);

    let mut req = request("f4", "no framing please");
    req.raw = true;
    let _ = service.process(req, "test", "w").await;

    let row = &audit.recent_requests(1).unwrap()[0];
    assert_eq!(row.formatted_input, "no framing please");
}

#[tokio::test]
async fn test_exactly_one_audit_row_per_invocation() {
    let dir = tempfile::tempdir().unwrap();
    let (service, audit) = build_service("standard", &dir);

    for _ in 0..3 {
        let _ = service.process(request("same-id", "x"), "test", "w").await;
    }
    assert_eq!(audit.count_requests("same-id").unwrap(), 3);
}
