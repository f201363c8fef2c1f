// Static catalog of the model configurations this service knows how to run.
// Every entry is validated once, before any model ever loads: keys must be
// unique and each prompt template must contain exactly one substitution point.

use std::sync::OnceLock;

use crate::error::{Error, Result};

/// Substitution point every prompt template must contain exactly once.
pub const PROMPT_SLOT: &str = "{prompt}";

/// Policy for isolating the answer from raw decoded output.
///
/// Dispatch is always on this enum, never on model name strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    /// Strip the echoed formatted prompt prefix, if present.
    TemplateStrip,
    /// Keep everything after the last occurrence of the family's role marker;
    /// falls back to `TemplateStrip` when the marker is absent.
    TagSplit { marker: &'static str },
    /// Keep the text between the first opening code fence and the next
    /// closing fence; falls back to `TemplateStrip` without a closing fence.
    CodeFence,
    /// Return the raw decoded text unchanged.
    Raw,
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub key: &'static str,
    /// HuggingFace repo id the weights and tokenizer come from.
    pub canonical_id: &'static str,
    pub description: &'static str,
    pub prompt_template: &'static str,
    pub stop_sequences: &'static [&'static str],
    pub extraction: Extraction,
    pub eos_marker: &'static str,
}

#[derive(Debug)]
pub struct ModelConfigRegistry {
    entries: Vec<ModelConfig>,
}

impl ModelConfigRegistry {
    /// Build a registry, rejecting duplicate keys and malformed templates.
    pub fn new(entries: Vec<ModelConfig>) -> Result<Self> {
        for (i, entry) in entries.iter().enumerate() {
            if entries[..i].iter().any(|e| e.key == entry.key) {
                return Err(Error::MalformedTemplate(format!(
                    "duplicate model key '{}' in catalog",
                    entry.key
                )));
            }
            let slots = entry.prompt_template.matches(PROMPT_SLOT).count();
            if slots != 1 {
                return Err(Error::MalformedTemplate(format!(
                    "template for '{}' has {} '{}' substitution points, expected exactly 1",
                    entry.key, slots, PROMPT_SLOT
                )));
            }
        }
        Ok(Self { entries })
    }

    fn builtin() -> Result<Self> {
        Self::new(vec![
            ModelConfig {
                key: "tinyllama",
                canonical_id: "TinyLlama/TinyLlama-1.1B-Chat-v1.0",
                description: "TinyLlama 1.1B chat model, fast general assistant",
                prompt_template: "<|system|>You are a helpful AI assistant.</s><|user|>{prompt}</s><|assistant|>",
                stop_sequences: &["</s>", "<|user|>", "<|system|>"],
                extraction: Extraction::TagSplit {
                    marker: "<|assistant|>",
                },
                eos_marker: "</s>",
            },
            ModelConfig {
                key: "deepseek-coder",
                canonical_id: "deepseek-ai/deepseek-coder-1.3b-base",
                description: "DeepSeek Coder 1.3B, instruction-tuned code generation",
                prompt_template: "Below is an instruction that describes a task. Write a response that appropriately completes the request.\n\n### Instruction:\n{prompt}\n\n### Response:\n",
                stop_sequences: &["### Instruction:", "<|EOT|>"],
                extraction: Extraction::TagSplit {
                    marker: "### Response:",
                },
                eos_marker: "<|EOT|>",
            },
            ModelConfig {
                key: "codellama",
                canonical_id: "codellama/CodeLlama-7b-Instruct-hf",
                description: "CodeLlama 7B Instruct, fenced code answers",
                prompt_template: "Please write code for the following request:\n\n{prompt}\n\n```",
                stop_sequences: &["</s>"],
                extraction: Extraction::CodeFence,
                eos_marker: "</s>",
            },
            ModelConfig {
                key: "phi-2",
                canonical_id: "microsoft/phi-2",
                description: "Phi-2 2.7B, compact reasoning model",
                prompt_template: "Instruct: {prompt}\nOutput:",
                stop_sequences: &["\nInstruct:"],
                extraction: Extraction::TemplateStrip,
                eos_marker: "<|endoftext|>",
            },
        ])
    }

    /// Look up a model configuration by key.
    pub fn get(&self, key: &str) -> Result<&ModelConfig> {
        self.entries
            .iter()
            .find(|e| e.key == key)
            .ok_or_else(|| Error::UnknownModel(key.to_string()))
    }

    /// Lazy, restartable listing of (key, description) pairs.
    pub fn list(&self) -> impl Iterator<Item = (&'static str, &'static str)> + '_ {
        self.entries.iter().map(|e| (e.key, e.description))
    }
}

static GLOBAL_REGISTRY: OnceLock<ModelConfigRegistry> = OnceLock::new();

/// Process-wide catalog instance. The first call validates the builtin
/// catalog; a malformed catalog fails here, before any model load.
pub fn global() -> Result<&'static ModelConfigRegistry> {
    match GLOBAL_REGISTRY.get() {
        Some(registry) => Ok(registry),
        None => {
            let built = ModelConfigRegistry::builtin()?;
            Ok(GLOBAL_REGISTRY.get_or_init(|| built))
        }
    }
}
