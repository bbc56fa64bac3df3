//! Embedding service: input normalization, per-element embedding, and a
//! single audit entry per batch.

use crate::audit::{AuditStore, RequestRecord};
use crate::model::ModelAdapter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

/// An embedding request; `input` may be a string or an array of strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trace_id: String,
    pub req_id: String,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reply_to: String,
}

/// One embedding vector with its position in the input batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingData {
    pub object: String,
    pub embedding: Vec<f32>,
    pub index: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingUsage {
    pub prompt_tokens: i64,
    pub total_tokens: i64,
}

/// The embedding response, list-shaped like the common HTTP embedding APIs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub object: String,
    pub data: Vec<EmbeddingData>,
    pub model: String,
    pub usage: EmbeddingUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EmbeddingResponse {
    fn failure(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            ..Default::default()
        }
    }
}

/// Normalize the request `input` to a non-empty list of strings.
///
/// Accepts a bare string or an array of strings; anything else (including a
/// non-string array element) is rejected without touching the model.
pub fn normalize_input(input: &serde_json::Value) -> Result<Vec<String>, &'static str> {
    match input {
        serde_json::Value::String(s) => Ok(vec![s.clone()]),
        serde_json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    serde_json::Value::String(s) => out.push(s.clone()),
                    _ => return Err("all input items must be strings"),
                }
            }
            if out.is_empty() {
                return Err("empty input");
            }
            Ok(out)
        }
        serde_json::Value::Null => Err("empty input"),
        _ => Err("input must be a string or array of strings"),
    }
}

/// The embedding service.
pub struct EmbeddingService {
    adapter: Arc<dyn ModelAdapter>,
    audit: Arc<AuditStore>,
}

impl EmbeddingService {
    pub fn new(adapter: Arc<dyn ModelAdapter>, audit: Arc<AuditStore>) -> Self {
        Self { adapter, audit }
    }

    /// Process one embedding batch. Always returns a response; validation
    /// failures short-circuit before any model call.
    pub async fn process(
        &self,
        req: EmbeddingRequest,
        source: &str,
        worker_id: &str,
    ) -> EmbeddingResponse {
        let start = Instant::now();
        let ts = crate::unix_timestamp_ms() as f64 / 1000.0;

        if !self.adapter.supports_embeddings() {
            return EmbeddingResponse::failure("model does not support embedding generation");
        }

        let inputs = match normalize_input(&req.input) {
            Ok(inputs) => inputs,
            Err(msg) => return EmbeddingResponse::failure(msg),
        };

        let mut data = Vec::with_capacity(inputs.len());
        let mut total_tokens: i64 = 0;

        for (index, input) in inputs.iter().enumerate() {
            match self.adapter.embed(input).await {
                Ok(out) => {
                    total_tokens += out.tokens as i64;
                    data.push(EmbeddingData {
                        object: "embedding".to_string(),
                        embedding: out.embedding,
                        index,
                    });
                }
                Err(e) => {
                    error!(input_index = index, error = %e, "embedding generation failed");
                    return EmbeddingResponse::failure(&format!(
                        "embedding generation failed: {e}"
                    ));
                }
            }
        }

        let duration_ms = start.elapsed().as_millis() as f64;
        let trace_id = if req.trace_id.is_empty() {
            req.req_id.clone()
        } else {
            req.trace_id.clone()
        };

        // One audit row covers the whole batch; vector geometry rides in
        // params_json since the relation has no embedding columns.
        let raw_input = req.input.to_string();
        self.audit.record_request(&RequestRecord {
            ts,
            trace_id,
            req_id: req.req_id.clone(),
            worker_id: worker_id.to_string(),
            source: source.to_string(),
            reply_to: req.reply_to.clone(),
            raw_input: raw_input.clone(),
            formatted_input: raw_input.clone(),
            input_len: raw_input.len() as i64,
            params_json: serde_json::json!({
                "embedding_size": self.adapter.embedding_size(),
                "embedding_count": data.len(),
            })
            .to_string(),
            grammar_used: "none".to_string(),
            tokens_in: total_tokens,
            tokens_out: 0,
            duration_ms,
            status: "ok".to_string(),
            ..Default::default()
        });

        EmbeddingResponse {
            object: "list".to_string(),
            data,
            model: req.model,
            usage: EmbeddingUsage {
                prompt_tokens: total_tokens,
                total_tokens,
            },
            error: None,
        }
    }
}
