//! Audio transcription service: source decoding, external re-encoding to
//! 16 kHz mono float32 PCM, and the transcription audit trail.

use crate::audit::{AuditStore, RequestRecord};
use crate::model::{AudioSegment, ModelAdapter};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// An audio transcription request. Exactly one of `audio`, `audio_base64`,
/// or `audio_url` should be populated; precedence follows that order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioRequest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trace_id: String,
    pub req_id: String,
    /// Raw audio bytes (HTTP multipart path).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audio: Vec<u8>,
    /// Base64-encoded audio (small files over the bus).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub audio_base64: String,
    /// Remote audio URL. Accepted by the protocol, answered with an explicit
    /// not-implemented error.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub audio_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub language: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reply_to: String,
}

/// A transcription response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioResponse {
    pub req_id: String,
    pub text: String,
    pub language: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<AudioSegment>,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Audio conversion errors (external `ffmpeg` pipeline).
#[derive(Error, Debug)]
pub enum AudioConvertError {
    #[error("audio converter unavailable: {0}")]
    ConverterUnavailable(String),

    #[error("audio conversion failed: {0}")]
    ConversionFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// MP3 sniffing: an MPEG sync header or an ID3 tag prefix.
pub fn looks_like_mp3(data: &[u8]) -> bool {
    if data.len() < 3 {
        return false;
    }
    (data[0] == 0xFF && (data[1] & 0xE0) == 0xE0) || &data[0..3] == b"ID3"
}

/// Interpret raw bytes as little-endian float32 PCM samples.
///
/// Trailing bytes that do not fill a whole sample are dropped.
pub fn decode_f32le(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn scratch_path(suffix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("fabric-audio-{}{suffix}", uuid::Uuid::new_v4()))
}

async fn run_ffmpeg(args: &[&str]) -> Result<(), AudioConvertError> {
    let output = tokio::process::Command::new("ffmpeg")
        .args(args)
        .output()
        .await
        .map_err(|e| AudioConvertError::ConverterUnavailable(e.to_string()))?;

    if !output.status.success() {
        return Err(AudioConvertError::ConversionFailed(
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }
    Ok(())
}

/// Re-encode arbitrary input audio to 16 kHz mono float32 PCM.
///
/// MP3 input is first converted to 16-bit PCM WAV, then everything goes
/// through a second pass to raw `f32le`, matching what the transcription
/// runtime expects.
pub async fn convert_to_pcm_f32(data: &[u8]) -> Result<Vec<f32>, AudioConvertError> {
    let input_path = scratch_path(".input");
    tokio::fs::write(&input_path, data).await?;

    let mut source = input_path.clone();
    let mut wav_path = None;
    if looks_like_mp3(data) {
        let wav = scratch_path(".wav");
        let src = source.display().to_string();
        let dst = wav.display().to_string();
        let result = run_ffmpeg(&[
            "-i", &src, "-ar", "16000", "-ac", "1", "-c:a", "pcm_s16le", &dst, "-y",
        ])
        .await;
        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&input_path).await;
            return Err(e);
        }
        source = wav.clone();
        wav_path = Some(wav);
    }

    let f32_path = scratch_path(".f32");
    let src = source.display().to_string();
    let dst = f32_path.display().to_string();
    let result = run_ffmpeg(&[
        "-i", &src, "-ar", "16000", "-ac", "1", "-f", "f32le", &dst, "-y",
    ])
    .await;

    let samples = match result {
        Ok(()) => {
            let raw = tokio::fs::read(&f32_path).await?;
            Ok(decode_f32le(&raw))
        }
        Err(e) => Err(e),
    };

    let _ = tokio::fs::remove_file(&input_path).await;
    if let Some(wav) = wav_path {
        let _ = tokio::fs::remove_file(&wav).await;
    }
    let _ = tokio::fs::remove_file(&f32_path).await;

    samples
}

/// The audio transcription service.
pub struct AudioService {
    adapter: Arc<dyn ModelAdapter>,
    audit: Arc<AuditStore>,
}

impl AudioService {
    pub fn new(adapter: Arc<dyn ModelAdapter>, audit: Arc<AuditStore>) -> Self {
        Self { adapter, audit }
    }

    /// Decode the request's audio source into raw bytes.
    ///
    /// Returns a client-facing error message when no usable source exists.
    fn decode_source(req: &AudioRequest) -> Result<Vec<u8>, String> {
        if !req.audio.is_empty() {
            return Ok(req.audio.clone());
        }
        if !req.audio_base64.is_empty() {
            return BASE64
                .decode(&req.audio_base64)
                .map_err(|_| "invalid base64 audio data".to_string());
        }
        if !req.audio_url.is_empty() {
            return Err("audio url processing not implemented".to_string());
        }
        Err("no audio input".to_string())
    }

    /// Process one transcription request. Always returns a response.
    pub async fn process(
        &self,
        req: AudioRequest,
        source: &str,
        worker_id: &str,
    ) -> AudioResponse {
        let start = Instant::now();
        let ts = crate::unix_timestamp_ms() as f64 / 1000.0;
        let trace_id = if req.trace_id.is_empty() {
            req.req_id.clone()
        } else {
            req.trace_id.clone()
        };

        debug!(
            worker_id = worker_id,
            req_id = %req.req_id,
            trace_id = %trace_id,
            source = source,
            "processing transcription request"
        );

        let audio_bytes = match Self::decode_source(&req) {
            Ok(bytes) => bytes,
            Err(message) => {
                self.record(&req, &trace_id, ts, source, worker_id, start, 0, "error", &message);
                return AudioResponse {
                    req_id: req.req_id,
                    language: req.language,
                    duration_ms: start.elapsed().as_millis() as i64,
                    error: Some(message),
                    ..Default::default()
                };
            }
        };

        let pcm = match convert_to_pcm_f32(&audio_bytes).await {
            Ok(pcm) => pcm,
            Err(e) => {
                let message = format!("audio conversion failed: {e}");
                warn!(req_id = %req.req_id, error = %e, "audio conversion failed");
                self.record(
                    &req,
                    &trace_id,
                    ts,
                    source,
                    worker_id,
                    start,
                    audio_bytes.len(),
                    "error",
                    &message,
                );
                return AudioResponse {
                    req_id: req.req_id,
                    language: req.language,
                    duration_ms: start.elapsed().as_millis() as i64,
                    error: Some(message),
                    ..Default::default()
                };
            }
        };

        let language = if req.language.is_empty() {
            None
        } else {
            Some(req.language.as_str())
        };

        match self.adapter.transcribe(&pcm, language).await {
            Ok(out) => {
                let duration_ms = start.elapsed().as_millis() as i64;
                info!(
                    worker_id = worker_id,
                    req_id = %req.req_id,
                    duration_ms = duration_ms,
                    text_length = out.text.len(),
                    segments = out.segments.len(),
                    "transcription completed"
                );
                self.record(
                    &req,
                    &trace_id,
                    ts,
                    source,
                    worker_id,
                    start,
                    audio_bytes.len(),
                    "ok",
                    "",
                );
                AudioResponse {
                    req_id: req.req_id,
                    text: out.text,
                    language: req.language,
                    segments: out.segments,
                    duration_ms,
                    error: None,
                }
            }
            Err(e) => {
                let message = format!("transcription failed: {e}");
                self.record(
                    &req,
                    &trace_id,
                    ts,
                    source,
                    worker_id,
                    start,
                    audio_bytes.len(),
                    "error",
                    &message,
                );
                AudioResponse {
                    req_id: req.req_id,
                    language: req.language,
                    duration_ms: start.elapsed().as_millis() as i64,
                    error: Some(message),
                    ..Default::default()
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        req: &AudioRequest,
        trace_id: &str,
        ts: f64,
        source: &str,
        worker_id: &str,
        start: Instant,
        audio_len: usize,
        status: &str,
        error: &str,
    ) {
        let descriptor = format!("[audio: {audio_len} bytes]");
        self.audit.record_request(&RequestRecord {
            ts,
            trace_id: trace_id.to_string(),
            req_id: req.req_id.clone(),
            worker_id: worker_id.to_string(),
            source: source.to_string(),
            reply_to: req.reply_to.clone(),
            raw_input: descriptor.clone(),
            formatted_input: descriptor,
            input_len: audio_len as i64,
            params_json: serde_json::json!({"language": req.language}).to_string(),
            grammar_used: "none".to_string(),
            duration_ms: start.elapsed().as_millis() as f64,
            status: status.to_string(),
            error: error.to_string(),
            ..Default::default()
        });
    }
}
