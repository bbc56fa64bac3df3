//! Text-generation service: grammar resolution, prompt formatting, model
//! invocation, and the audit trail for every request.

use crate::audit::{AuditStore, RequestRecord};
use crate::config::Config;
use crate::format::FormatEngine;
use crate::grammar::GrammarService;
use crate::model::{GenerationParams, ModelAdapter};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// A text-generation request as it arrives off the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InferenceRequest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trace_id: String,
    pub req_id: String,
    pub input: String,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reply_to: String,
    /// Bypass all prompt formatting.
    #[serde(default)]
    pub raw: bool,
}

/// A text-generation response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub req_id: String,
    pub text: String,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub finish_reason: String,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The text-generation service.
pub struct InferenceService {
    adapter: Arc<dyn ModelAdapter>,
    audit: Arc<AuditStore>,
    grammar: Arc<GrammarService>,
    format: FormatEngine,
    grammar_enabled: bool,
}

impl InferenceService {
    pub fn new(
        adapter: Arc<dyn ModelAdapter>,
        audit: Arc<AuditStore>,
        grammar: Arc<GrammarService>,
        config: &Config,
    ) -> Self {
        Self {
            adapter,
            audit,
            grammar,
            format: FormatEngine::from_config(config),
            grammar_enabled: config.grammar_enabled,
        }
    }

    /// Process one generation request.
    ///
    /// Always returns a response; failures, including panics inside the
    /// model call, are carried in the `error` field and recorded in the
    /// audit store.
    pub async fn process(
        &self,
        req: InferenceRequest,
        source: &str,
        worker_id: &str,
    ) -> InferenceResponse {
        let start = Instant::now();
        let ts = crate::unix_timestamp_ms() as f64 / 1000.0;

        let trace_id = if req.trace_id.is_empty() {
            req.req_id.clone()
        } else {
            req.trace_id.clone()
        };

        // Resolve a grammar reference when present. Resolution failure is
        // logged and the request proceeds unconstrained.
        let grammar_ref = req
            .params
            .get("grammar")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let mut resolved_grammar = None;
        if !grammar_ref.is_empty() {
            match self.grammar.resolve(&grammar_ref) {
                Ok(body) if !body.is_empty() => {
                    if self.grammar_enabled {
                        resolved_grammar = Some(body);
                    } else {
                        // Parity switch for runtimes with broken grammar
                        // support: resolution still happens, application is
                        // skipped.
                        warn!(
                            reference = %grammar_ref,
                            grammar_length = body.len(),
                            "grammar resolved but application is disabled"
                        );
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(reference = %grammar_ref, error = %e, "grammar resolution failed");
                }
            }
        }

        let mut params = GenerationParams::from_request(&req.params);
        params.grammar = resolved_grammar;

        let formatted_input = if req.raw {
            debug!(req_id = %req.req_id, "raw mode, bypassing prompt formatting");
            req.input.clone()
        } else {
            self.format.apply(&req.input)
        };

        let generation = AssertUnwindSafe(self.adapter.generate(&formatted_input, &params))
            .catch_unwind()
            .await;

        let duration_ms = start.elapsed().as_millis() as i64;

        let (text, tokens_in, tokens_out, status, error_str) = match generation {
            Err(panic) => {
                let panic_text = panic_message(panic);
                let err = format!("service panic: {panic_text}");
                error!(req_id = %req.req_id, error = %err, "inference panicked");

                self.audit.record_request(&RequestRecord {
                    ts,
                    trace_id: trace_id.clone(),
                    req_id: req.req_id.clone(),
                    worker_id: worker_id.to_string(),
                    source: source.to_string(),
                    reply_to: req.reply_to.clone(),
                    raw_input: req.input.clone(),
                    formatted_input: "[CRASHED]".to_string(),
                    response_text: "[CRASHED]".to_string(),
                    input_len: req.input.len() as i64,
                    params_json: params_json(&req.params),
                    grammar_used: grammar_or_none(&grammar_ref),
                    duration_ms: duration_ms as f64,
                    status: "panic".to_string(),
                    error: err.clone(),
                    ..Default::default()
                });

                return InferenceResponse {
                    req_id: req.req_id,
                    finish_reason: "error".to_string(),
                    duration_ms,
                    error: Some(err),
                    ..Default::default()
                };
            }
            Ok(Err(e)) => (String::new(), 0, 0, "error", Some(e.to_string())),
            Ok(Ok(out)) => {
                let text = if req.raw {
                    out.text
                } else {
                    self.format.parse(&out.text)
                };
                (
                    text,
                    out.tokens_in as i64,
                    out.tokens_out as i64,
                    "ok",
                    None,
                )
            }
        };

        self.audit.record_request(&RequestRecord {
            ts,
            trace_id,
            req_id: req.req_id.clone(),
            worker_id: worker_id.to_string(),
            source: source.to_string(),
            reply_to: req.reply_to.clone(),
            raw_input: req.input.clone(),
            formatted_input,
            response_text: text.clone(),
            input_len: req.input.len() as i64,
            params_json: params_json(&req.params),
            grammar_used: grammar_or_none(&grammar_ref),
            tokens_in,
            tokens_out,
            duration_ms: duration_ms as f64,
            status: status.to_string(),
            error: error_str.clone().unwrap_or_default(),
        });

        InferenceResponse {
            req_id: req.req_id,
            text,
            tokens_in,
            tokens_out,
            finish_reason: "stop".to_string(),
            duration_ms,
            error: error_str,
        }
    }

    /// Audit readback for the HTTP `/logs` endpoint.
    pub fn recent_logs(&self, limit: usize) -> Vec<RequestRecord> {
        self.audit.recent_requests(limit).unwrap_or_default()
    }
}

fn params_json(params: &serde_json::Map<String, serde_json::Value>) -> String {
    serde_json::to_string(params).unwrap_or_else(|_| "{}".to_string())
}

fn grammar_or_none(reference: &str) -> String {
    if reference.is_empty() {
        "none".to_string()
    } else {
        reference.to_string()
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
