//! Harmony conversation framing.
//!
//! A three-role (`system`, `developer`, `user`) framed prompt format whose
//! assistant replies are split into channels; the `final` channel carries the
//! user-visible text. The system header encodes model identity, knowledge
//! cutoff, reasoning level, and the valid channel list.

use serde::{Deserialize, Serialize};

const CHANNEL_FINAL: &str = "<|channel|>final<|message|>";
const CHANNEL_ANALYSIS: &str = "<|channel|>analysis<|message|>";
const END: &str = "<|end|>";

/// Reasoning effort requested from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningLevel {
    Low,
    Medium,
    High,
}

impl ReasoningLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// Keywords that bump the reasoning level up.
const HIGH_REASONING_KEYWORDS: &[&str] = &[
    "explain",
    "analyze",
    "compare",
    "evaluate",
    "detailed",
    "comprehensive",
    "step by step",
    "reasoning",
    "logic",
    "proof",
    "algorithm",
    "strategy",
    "complex",
    "intricate",
    "sophisticated",
    "elaborate",
    "thorough",
];

/// Keywords that indicate a trivial exchange.
const LOW_REASONING_KEYWORDS: &[&str] = &[
    "hello", "hi", "thanks", "thank you", "yes", "no", "ok", "okay", "simple", "quick", "brief",
    "short", "what is", "who is",
];

/// Choose a reasoning level from input keywords; medium when nothing matches.
pub fn determine_reasoning_level(input: &str) -> ReasoningLevel {
    let input = input.to_lowercase();
    if HIGH_REASONING_KEYWORDS.iter().any(|k| input.contains(k)) {
        return ReasoningLevel::High;
    }
    if LOW_REASONING_KEYWORDS.iter().any(|k| input.contains(k)) {
        return ReasoningLevel::Low;
    }
    ReasoningLevel::Medium
}

/// A conversation under construction.
#[derive(Debug, Clone)]
pub struct Conversation {
    model_identity: String,
    knowledge_cutoff: String,
    reasoning_level: ReasoningLevel,
    /// (role, content) in insertion order.
    messages: Vec<(&'static str, String)>,
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            model_identity: "ChatGPT, a large language model trained by OpenAI".to_string(),
            knowledge_cutoff: "2024-06".to_string(),
            reasoning_level: ReasoningLevel::Medium,
            messages: Vec::new(),
        }
    }

    pub fn with_model_identity(mut self, identity: &str) -> Self {
        self.model_identity = identity.to_string();
        self
    }

    pub fn with_knowledge_cutoff(mut self, cutoff: &str) -> Self {
        self.knowledge_cutoff = cutoff.to_string();
        self
    }

    pub fn with_reasoning_level(mut self, level: ReasoningLevel) -> Self {
        self.reasoning_level = level;
        self
    }

    pub fn developer_message(mut self, content: &str) -> Self {
        self.messages.push(("developer", content.to_string()));
        self
    }

    pub fn user_message(mut self, content: &str) -> Self {
        self.messages.push(("user", content.to_string()));
        self
    }

    /// Render the conversation as a completion prompt ending at the open
    /// assistant turn.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str("<|start|>system<|message|>");
        out.push_str(&self.model_identity);
        if !self.model_identity.ends_with('.') {
            out.push('.');
        }
        out.push_str("\nKnowledge cutoff: ");
        out.push_str(&self.knowledge_cutoff);
        out.push_str("\n\nReasoning: ");
        out.push_str(self.reasoning_level.as_str());
        out.push_str("\n\n# Valid channels: analysis, commentary, final.");
        out.push_str(" Channel must be included for every message.");
        out.push_str(END);

        for (role, content) in &self.messages {
            out.push_str("<|start|>");
            out.push_str(role);
            out.push_str("<|message|>");
            if *role == "developer" {
                out.push_str("# Instructions\n\n");
            }
            out.push_str(content);
            out.push_str(END);
        }

        out.push_str("<|start|>assistant");
        out
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract one channel's content: the text between `marker` and the next
/// `<|end|>` (or end of string).
fn extract_channel(response: &str, marker: &str) -> Option<String> {
    let start = response.find(marker)? + marker.len();
    let rest = &response[start..];
    let end = rest.find(END).unwrap_or(rest.len());
    Some(rest[..end].trim().to_string())
}

/// Extract the user-visible reply from an assistant completion.
///
/// Precedence: `final` channel, then `analysis`, then the whole response when
/// no channel markers are present.
pub fn extract_final_response(response: &str) -> String {
    if let Some(text) = extract_channel(response, CHANNEL_FINAL) {
        return text;
    }
    if let Some(text) = extract_channel(response, CHANNEL_ANALYSIS) {
        return text;
    }
    response.to_string()
}
