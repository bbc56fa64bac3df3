//! # Prompt Format Engine
//!
//! ## Responsibility
//! Map raw user text plus a named format (`standard`, `template`, `chatml`,
//! `harmony`) to the exact token stream a model expects, and parse the
//! model's reply back into a user-visible string.
//!
//! ## Guarantees
//! - Passthrough identity: `standard` with no system prompt leaves input
//!   untouched
//! - Unknown format names fall back to `standard` with a warning
//! - A request with `raw=true` bypasses this module entirely (services
//!   enforce that, not the engine)
//!
//! ## NOT Responsible For
//! - Grammar resolution (see: `grammar`)
//! - Token counting (see: `model`)

pub mod harmony;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

/// Context handed to every formatter call: the model path (templates live
/// next to the weights) and the format-specific option sub-map.
#[derive(Debug, Clone, Default)]
pub struct FormatContext {
    pub model_path: String,
    pub options: HashMap<String, serde_json::Value>,
}

impl FormatContext {
    fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(|v| v.as_str())
    }

    fn option_bool(&self, key: &str, default: bool) -> bool {
        self.options
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(default)
    }
}

/// A named prompt format.
pub trait PromptFormatter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Turn raw input (plus an optional system prompt) into the model prompt.
    fn format(&self, input: &str, system_prompt: &str, ctx: &FormatContext) -> String;

    /// Turn the model's raw completion into the user-visible reply.
    fn parse(&self, response: &str, ctx: &FormatContext) -> String;
}

// ── standard ─────────────────────────────────────────────────────────────

/// Plain prompts: optional `system` preamble, otherwise verbatim.
pub struct StandardFormatter;

impl PromptFormatter for StandardFormatter {
    fn name(&self) -> &'static str {
        "standard"
    }

    fn format(&self, input: &str, system_prompt: &str, _ctx: &FormatContext) -> String {
        if system_prompt.is_empty() {
            input.to_string()
        } else {
            format!("{system_prompt}\n\nUser: {input}\nAssistant: ")
        }
    }

    fn parse(&self, response: &str, _ctx: &FormatContext) -> String {
        response.to_string()
    }
}

// ── template ─────────────────────────────────────────────────────────────

/// Per-model JSON template loaded from the model directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptTemplate {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub system_role: String,
    #[serde(default)]
    pub user_prefix: String,
    #[serde(default)]
    pub user_suffix: String,
    #[serde(default)]
    pub model_prefix: String,
    #[serde(default)]
    pub model_suffix: String,
}

/// Load `prompt_template.json` from a model directory.
///
/// A missing file is not an error; it means passthrough mode.
pub fn load_template(model_dir: &Path) -> Option<PromptTemplate> {
    let path = model_dir.join("prompt_template.json");
    let data = match std::fs::read_to_string(&path) {
        Ok(d) => d,
        Err(_) => {
            debug!(path = %path.display(), "no prompt template, using passthrough");
            return None;
        }
    };
    match serde_json::from_str(&data) {
        Ok(t) => Some(t),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "template parse failed, using passthrough");
            None
        }
    }
}

/// Formatter driven by the per-model template file.
pub struct TemplateFormatter;

impl PromptFormatter for TemplateFormatter {
    fn name(&self) -> &'static str {
        "template"
    }

    fn format(&self, input: &str, _system_prompt: &str, ctx: &FormatContext) -> String {
        let model_dir = Path::new(&ctx.model_path)
            .parent()
            .unwrap_or_else(|| Path::new("."));
        let Some(template) = load_template(model_dir) else {
            return input.to_string();
        };

        let mut out = String::new();
        if !template.system_role.is_empty() {
            out.push_str(&template.system_role);
            out.push('\n');
        }
        out.push_str(&template.user_prefix);
        out.push_str(input);
        out.push_str(&template.user_suffix);
        out.push_str(&template.model_prefix);
        out
    }

    fn parse(&self, response: &str, _ctx: &FormatContext) -> String {
        response.to_string()
    }
}

// ── chatml ───────────────────────────────────────────────────────────────

/// ChatML `<|im_start|>` / `<|im_end|>` framing.
pub struct ChatMlFormatter;

impl PromptFormatter for ChatMlFormatter {
    fn name(&self) -> &'static str {
        "chatml"
    }

    fn format(&self, input: &str, system_prompt: &str, _ctx: &FormatContext) -> String {
        let mut out = String::new();
        if !system_prompt.is_empty() {
            out.push_str("<|im_start|>system\n");
            out.push_str(system_prompt);
            out.push_str("<|im_end|>\n");
        }
        out.push_str("<|im_start|>user\n");
        out.push_str(input);
        out.push_str("<|im_end|>\n");
        out.push_str("<|im_start|>assistant\n");
        out
    }

    fn parse(&self, response: &str, _ctx: &FormatContext) -> String {
        response
            .trim_end()
            .trim_end_matches("<|im_end|>")
            .trim()
            .to_string()
    }
}

// ── harmony ──────────────────────────────────────────────────────────────

/// Role-and-channel framed conversations; heavy lifting in [`harmony`].
pub struct HarmonyFormatter;

impl PromptFormatter for HarmonyFormatter {
    fn name(&self) -> &'static str {
        "harmony"
    }

    fn format(&self, input: &str, system_prompt: &str, ctx: &FormatContext) -> String {
        let level = match ctx.option_str("reasoning_level") {
            Some(s) => harmony::ReasoningLevel::parse(s)
                .unwrap_or_else(|| harmony::determine_reasoning_level(input)),
            None => harmony::determine_reasoning_level(input),
        };

        let mut conversation = harmony::Conversation::new().with_reasoning_level(level);
        if let Some(identity) = ctx.option_str("model_identity") {
            conversation = conversation.with_model_identity(identity);
        }
        if let Some(cutoff) = ctx.option_str("knowledge_cutoff") {
            conversation = conversation.with_knowledge_cutoff(cutoff);
        }
        if !system_prompt.is_empty() {
            conversation = conversation.developer_message(system_prompt);
        }
        conversation.user_message(input).render()
    }

    fn parse(&self, response: &str, ctx: &FormatContext) -> String {
        if !ctx.option_bool("extract_final", true) {
            return response.to_string();
        }
        harmony::extract_final_response(response)
    }
}

// ── registry / engine ────────────────────────────────────────────────────

/// Look up a formatter by configured name, falling back to `standard`.
pub fn formatter_for(name: &str) -> Box<dyn PromptFormatter> {
    match name {
        "standard" => Box::new(StandardFormatter),
        "template" => Box::new(TemplateFormatter),
        "chatml" => Box::new(ChatMlFormatter),
        "harmony" => Box::new(HarmonyFormatter),
        other => {
            warn!(
                format = other,
                "unknown model format, falling back to standard"
            );
            Box::new(StandardFormatter)
        }
    }
}

/// Names of all built-in formats.
pub fn available_formats() -> Vec<&'static str> {
    vec!["standard", "template", "chatml", "harmony"]
}

/// The configured format engine a worker applies to every non-raw request.
pub struct FormatEngine {
    formatter: Box<dyn PromptFormatter>,
    context: FormatContext,
}

impl FormatEngine {
    pub fn new(format_name: &str, model_path: &str, options: HashMap<String, serde_json::Value>) -> Self {
        Self {
            formatter: formatter_for(format_name),
            context: FormatContext {
                model_path: model_path.to_string(),
                options,
            },
        }
    }

    pub fn from_config(cfg: &crate::config::Config) -> Self {
        Self::new(&cfg.model_format, &cfg.model_path, cfg.format_config.clone())
    }

    pub fn name(&self) -> &'static str {
        self.formatter.name()
    }

    /// Format `input` for the model.
    ///
    /// The system prompt is the `system_role` of the model-directory template
    /// when one exists; the template file is re-read per call so operators
    /// can adjust it without a restart.
    pub fn apply(&self, input: &str) -> String {
        let model_dir = Path::new(&self.context.model_path)
            .parent()
            .unwrap_or_else(|| Path::new("."));
        let system_prompt = load_template(model_dir)
            .map(|t| t.system_role)
            .unwrap_or_default();
        self.formatter.format(input, &system_prompt, &self.context)
    }

    /// Parse the model's completion back into the user-visible reply.
    pub fn parse(&self, response: &str) -> String {
        self.formatter.parse(response, &self.context)
    }
}
