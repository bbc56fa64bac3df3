//! # Capability Detection
//!
//! ## Responsibility
//! Derive the ordered capability set a worker advertises from model
//! introspection. Computed once at startup and immutable for the lifetime of
//! the process; health snapshots and endpoint registration consume it.
//!
//! ## Guarantees
//! - Pure: detection reads [`ModelMetadata`] only, never calls into the model
//! - Stable ordering: the same metadata always yields the same list
//!
//! ## NOT Responsible For
//! - Enforcing capabilities at request time (services validate themselves)

use crate::model::ModelMetadata;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Operation classes a worker can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapabilityType {
    #[serde(rename = "text-generation")]
    TextGeneration,
    #[serde(rename = "embeddings")]
    Embeddings,
    #[serde(rename = "image-understanding")]
    ImageUnderstanding,
    #[serde(rename = "audio-transcription")]
    AudioTranscription,
    #[serde(rename = "reasoning")]
    Reasoning,
    #[serde(rename = "grammar-constrained")]
    GrammarConstrained,
    #[serde(rename = "tool-calling")]
    ToolCalling,
}

impl CapabilityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TextGeneration => "text-generation",
            Self::Embeddings => "embeddings",
            Self::ImageUnderstanding => "image-understanding",
            Self::AudioTranscription => "audio-transcription",
            Self::Reasoning => "reasoning",
            Self::GrammarConstrained => "grammar-constrained",
            Self::ToolCalling => "tool-calling",
        }
    }
}

/// One advertised capability with optional parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    #[serde(rename = "type")]
    pub kind: CapabilityType,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<HashMap<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Capability {
    fn new(kind: CapabilityType, description: &str) -> Self {
        Self {
            kind,
            version: "1.0".to_string(),
            parameters: None,
            description: Some(description.to_string()),
        }
    }
}

/// Architectures/families assumed capable of multi-step reasoning.
const REASONING_ARCHS: &[&str] = &[
    "gpt", "gemma", "qwen", "llama", "phi", "mistral", "claude", "o1", "deepseek", "yi",
    "baichuan", "internlm", "chatglm",
];

/// Architectures/families assumed capable of tool calling.
const TOOL_ARCHS: &[&str] = &[
    "gpt-4", "gpt-3.5", "claude", "gemini", "qwen", "deepseek", "yi", "mistral", "llama-3",
    "phi-3",
];

/// Derive the full ordered capability set from model metadata.
pub fn detect_capabilities(metadata: &ModelMetadata) -> Vec<Capability> {
    let mut caps = Vec::new();

    caps.push(Capability::new(
        CapabilityType::TextGeneration,
        "Generate text completions",
    ));

    if let Some(size) = metadata.embedding_size.filter(|s| *s > 0) {
        let mut cap = Capability::new(CapabilityType::Embeddings, "Generate text embeddings");
        let mut params = HashMap::new();
        params.insert("dimension".to_string(), serde_json::json!(size));
        cap.parameters = Some(params);
        caps.push(cap);
    }

    for modality in &metadata.modalities {
        match modality.as_str() {
            "image" => caps.push(Capability::new(
                CapabilityType::ImageUnderstanding,
                "Understand and analyze images",
            )),
            "audio" => caps.push(Capability::new(
                CapabilityType::AudioTranscription,
                "Transcribe audio to text",
            )),
            _ => {}
        }
    }

    if supports_reasoning(metadata) {
        caps.push(Capability::new(
            CapabilityType::Reasoning,
            "Advanced reasoning and problem solving",
        ));
    }

    caps.push(Capability::new(
        CapabilityType::GrammarConstrained,
        "Generate text following specific grammar rules",
    ));

    if supports_tool_calling(metadata) {
        caps.push(Capability::new(
            CapabilityType::ToolCalling,
            "Call external tools and functions",
        ));
    }

    caps
}

/// Convert capabilities to their string names for wire payloads.
pub fn capability_strings(caps: &[Capability]) -> Vec<String> {
    caps.iter().map(|c| c.kind.as_str().to_string()).collect()
}

/// Human-readable one-line summary for startup logs.
pub fn capabilities_summary(caps: &[Capability]) -> String {
    let parts: Vec<String> = caps
        .iter()
        .map(|c| match c.kind {
            CapabilityType::TextGeneration => "Text Generation".to_string(),
            CapabilityType::Embeddings => {
                let dim = c
                    .parameters
                    .as_ref()
                    .and_then(|p| p.get("dimension"))
                    .and_then(|d| d.as_u64())
                    .unwrap_or(0);
                if dim > 0 {
                    format!("Embeddings ({dim}D)")
                } else {
                    "Embeddings".to_string()
                }
            }
            CapabilityType::ImageUnderstanding => "Vision".to_string(),
            CapabilityType::AudioTranscription => "Audio".to_string(),
            CapabilityType::Reasoning => "Reasoning".to_string(),
            CapabilityType::GrammarConstrained => "Grammar".to_string(),
            CapabilityType::ToolCalling => "Tool Calling".to_string(),
        })
        .collect();

    if parts.is_empty() {
        "Text Only".to_string()
    } else {
        parts.join(", ")
    }
}

fn supports_reasoning(metadata: &ModelMetadata) -> bool {
    let arch = metadata.architecture.to_lowercase();
    let family = metadata
        .model_family
        .as_deref()
        .unwrap_or("")
        .to_lowercase();

    if REASONING_ARCHS
        .iter()
        .any(|a| arch.contains(a) || family.contains(a))
    {
        return true;
    }

    // Parameter counts quoted in billions imply enough scale for reasoning.
    metadata
        .parameter_count
        .as_deref()
        .is_some_and(|p| p.ends_with('B'))
}

fn supports_tool_calling(metadata: &ModelMetadata) -> bool {
    let arch = metadata.architecture.to_lowercase();
    let family = metadata
        .model_family
        .as_deref()
        .unwrap_or("")
        .to_lowercase();

    TOOL_ARCHS
        .iter()
        .any(|a| arch.contains(a) || family.contains(a))
}
