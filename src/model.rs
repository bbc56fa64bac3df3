//! # Model Adapter
//!
//! ## Responsibility
//! Define the narrow contract between the fabric and a native model runtime,
//! plus the generation-parameter extraction shared by every transport. The
//! actual llama.cpp / whisper.cpp bindings live out-of-tree; anything that
//! implements [`ModelAdapter`] can be served.
//!
//! ## Guarantees
//! - Capability queries are answered from [`ModelMetadata`] alone: no
//!   downcasting, no inheritance tree
//! - The adapter is shared immutably (`Arc<dyn ModelAdapter>`); a single
//!   handle is assumed internally serialized, so pool concurrency controls
//!   I/O overlap rather than compute parallelism
//!
//! ## NOT Responsible For
//! - Prompt formatting (see: `format`)
//! - Audit logging (see: `services`)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::info;

/// Model adapter errors.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model not found at {path} and no download URL provided")]
    NotFound { path: String },

    #[error("model download failed: {0}")]
    Download(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("model does not support {0}")]
    Unsupported(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Static facts about a loaded model, read once after startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub architecture: String,
    pub modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter_count: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_family: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
}

/// Sampling and budget parameters for one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repeat_penalty: f32,
    pub repeat_last_n: u32,
    /// Resolved grammar body, when grammar-constrained generation is active.
    pub grammar: Option<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
            top_p: 1.0,
            top_k: 40,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
            grammar: None,
        }
    }
}

impl GenerationParams {
    /// Extract parameters from a request `params` map.
    ///
    /// Unrecognized keys are ignored. A missing `max_tokens` means "natural
    /// stopping" and widens the budget to 2048; an explicit value of zero or
    /// less is clamped to 1.
    pub fn from_request(params: &serde_json::Map<String, serde_json::Value>) -> Self {
        let defaults = Self::default();

        let max_tokens = match params.get("max_tokens") {
            None => 2048,
            Some(v) => {
                let requested = v.as_i64().unwrap_or(defaults.max_tokens as i64);
                requested.max(1) as u32
            }
        };

        Self {
            max_tokens,
            temperature: get_f32(params, "temperature", defaults.temperature),
            top_p: get_f32(params, "top_p", defaults.top_p),
            top_k: get_u32(params, "top_k", defaults.top_k),
            repeat_penalty: get_f32(params, "repeat_penalty", defaults.repeat_penalty),
            repeat_last_n: get_u32(params, "repeat_last_n", defaults.repeat_last_n),
            grammar: None,
        }
    }
}

fn get_f32(params: &serde_json::Map<String, serde_json::Value>, key: &str, default: f32) -> f32 {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .map(|v| v as f32)
        .unwrap_or(default)
}

fn get_u32(params: &serde_json::Map<String, serde_json::Value>, key: &str, default: u32) -> u32 {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .map(|v| v.max(0) as u32)
        .unwrap_or(default)
}

/// Result of one generation call.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub text: String,
    pub tokens_in: usize,
    pub tokens_out: usize,
}

/// Result of one embedding call.
#[derive(Debug, Clone)]
pub struct EmbeddingOutput {
    pub embedding: Vec<f32>,
    pub tokens: usize,
}

/// A single timed transcript segment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioSegment {
    pub id: usize,
    pub start_s: f64,
    pub end_s: f64,
    pub text: String,
}

/// Result of one transcription call.
#[derive(Debug, Clone)]
pub struct TranscriptionOutput {
    pub text: String,
    pub segments: Vec<AudioSegment>,
}

/// The contract between the fabric and a model runtime.
///
/// Implementations must be `Send + Sync`; calls may block a thread for the
/// entire duration of generation or transcription, so implementations over
/// blocking FFI should hop through `tokio::task::spawn_blocking` internally.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// Generate a completion for an already-formatted prompt.
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<GenerationOutput, ModelError>;

    /// Embed a single input string.
    async fn embed(&self, input: &str) -> Result<EmbeddingOutput, ModelError>;

    /// Transcribe 16 kHz mono float32 PCM audio.
    async fn transcribe(
        &self,
        pcm: &[f32],
        language: Option<&str>,
    ) -> Result<TranscriptionOutput, ModelError>;

    /// Count tokens in `text` under the model's tokenizer.
    async fn count_tokens(&self, text: &str) -> Result<usize, ModelError>;

    /// Static model facts; treated as read-only after startup.
    fn metadata(&self) -> ModelMetadata;

    /// Whether this model produces embeddings.
    fn supports_embeddings(&self) -> bool {
        self.metadata().embedding_size.unwrap_or(0) > 0
    }

    /// Embedding vector width; zero for non-embedding models.
    fn embedding_size(&self) -> usize {
        self.metadata().embedding_size.unwrap_or(0)
    }

    /// Supported input modalities (`text`, `audio`, `image`, …).
    fn modalities(&self) -> Vec<String> {
        self.metadata().modalities
    }
}

// ============================================================================
// Echo Model (Testing / Demo)
// ============================================================================

/// Deterministic echo adapter for pipeline smoke tests and demos.
///
/// Generation echoes the prompt's words back (bounded by `max_tokens`),
/// embeddings are a stable hash-derived vector, and transcription reports the
/// sample count. No native dependencies.
pub struct EchoModel {
    delay_ms: u64,
    metadata: ModelMetadata,
    /// When set, every operation fails with this message (error-path tests).
    fail_with: Option<String>,
}

impl EchoModel {
    pub fn new() -> Self {
        Self {
            delay_ms: 0,
            metadata: ModelMetadata {
                architecture: "echo".to_string(),
                modalities: vec!["text".to_string()],
                context_size: Some(4096),
                ..Default::default()
            },
            fail_with: None,
        }
    }

    /// Simulated per-call latency in milliseconds.
    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    /// Advertise an embedding width (enables the embeddings capability).
    pub fn with_embedding_size(mut self, size: usize) -> Self {
        self.metadata.embedding_size = Some(size);
        self
    }

    /// Override the advertised modalities.
    pub fn with_modalities(mut self, modalities: &[&str]) -> Self {
        self.metadata.modalities = modalities.iter().map(|m| m.to_string()).collect();
        self
    }

    /// Override the advertised architecture string.
    pub fn with_architecture(mut self, architecture: &str) -> Self {
        self.metadata.architecture = architecture.to_string();
        self
    }

    /// Override the advertised parameter count (e.g. `"4B"`).
    pub fn with_parameter_count(mut self, count: &str) -> Self {
        self.metadata.parameter_count = Some(count.to_string());
        self
    }

    /// Make every operation fail with the given message.
    pub fn failing(mut self, message: &str) -> Self {
        self.fail_with = Some(message.to_string());
        self
    }

    async fn simulate_latency(&self) {
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
    }

    fn check_failure(&self) -> Result<(), ModelError> {
        match &self.fail_with {
            Some(msg) => Err(ModelError::Inference(msg.clone())),
            None => Ok(()),
        }
    }
}

impl Default for EchoModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelAdapter for EchoModel {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<GenerationOutput, ModelError> {
        self.simulate_latency().await;
        self.check_failure()?;

        let words: Vec<&str> = prompt.split_whitespace().collect();
        let budget = params.max_tokens.max(1) as usize;
        let text = if words.is_empty() {
            "ok".to_string()
        } else {
            words[..words.len().min(budget)].join(" ")
        };
        let tokens_out = text.split_whitespace().count().max(1);

        Ok(GenerationOutput {
            text,
            tokens_in: words.len().max(1),
            tokens_out,
        })
    }

    async fn embed(&self, input: &str) -> Result<EmbeddingOutput, ModelError> {
        self.simulate_latency().await;
        self.check_failure()?;

        let size = self.embedding_size();
        if size == 0 {
            return Err(ModelError::Unsupported("embeddings".to_string()));
        }

        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        input.hash(&mut hasher);
        let seed = hasher.finish();

        let embedding = (0..size)
            .map(|i| (((seed.wrapping_add(i as u64)) % 1000) as f32) / 1000.0)
            .collect();

        Ok(EmbeddingOutput {
            embedding,
            tokens: input.split_whitespace().count().max(1),
        })
    }

    async fn transcribe(
        &self,
        pcm: &[f32],
        language: Option<&str>,
    ) -> Result<TranscriptionOutput, ModelError> {
        self.simulate_latency().await;
        self.check_failure()?;

        let duration_s = pcm.len() as f64 / 16_000.0;
        let text = format!(
            "[{} samples, {}]",
            pcm.len(),
            language.unwrap_or("auto")
        );
        Ok(TranscriptionOutput {
            text: text.clone(),
            segments: vec![AudioSegment {
                id: 0,
                start_s: 0.0,
                end_s: duration_s,
                text,
            }],
        })
    }

    async fn count_tokens(&self, text: &str) -> Result<usize, ModelError> {
        self.check_failure()?;
        Ok(text.split_whitespace().count().max(1))
    }

    fn metadata(&self) -> ModelMetadata {
        self.metadata.clone()
    }
}

// ============================================================================
// Model file provisioning
// ============================================================================

/// Ensure the model file exists at `path`, downloading from `url` if missing.
///
/// A missing file with an empty URL is a fatal startup error. Download
/// progress is logged roughly every 256 MiB so multi-gigabyte GGUF pulls stay
/// observable without flooding the log.
pub async fn ensure_model_available(path: &str, url: &str) -> Result<(), ModelError> {
    if Path::new(path).exists() {
        return Ok(());
    }
    if url.is_empty() {
        return Err(ModelError::NotFound {
            path: path.to_string(),
        });
    }

    info!(url = url, path = path, "model not found, downloading");

    if let Some(parent) = Path::new(path).parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut response = reqwest::get(url)
        .await
        .map_err(|e| ModelError::Download(format!("request failed: {e}")))?;
    if !response.status().is_success() {
        return Err(ModelError::Download(format!(
            "bad status: {}",
            response.status()
        )));
    }

    let total = response.content_length();
    let mut file = tokio::fs::File::create(path).await?;
    let mut downloaded: u64 = 0;
    let mut next_report: u64 = 256 * 1024 * 1024;

    use tokio::io::AsyncWriteExt;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| ModelError::Download(format!("read failed: {e}")))?
    {
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
        if downloaded >= next_report {
            info!(
                downloaded_mb = downloaded / (1024 * 1024),
                total_mb = total.map(|t| t / (1024 * 1024)),
                path = path,
                "download progress"
            );
            next_report += 256 * 1024 * 1024;
        }
    }
    file.flush().await?;

    info!(
        size_mb = downloaded / (1024 * 1024),
        path = path,
        "model downloaded"
    );
    Ok(())
}
