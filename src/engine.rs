//! Seam between the session core and the native inference engine.
//!
//! The core never touches weights or tokens directly: it drives an
//! [`InferenceEngine`] for model lifecycle and generation and its [`KvCache`]
//! side for window management. The default implementation lives in
//! [`candle`] behind the `candle` feature.

#[cfg(feature = "candle")]
pub mod candle;
#[cfg(feature = "candle")]
pub mod template;
#[cfg(feature = "candle")]
pub mod tokenizer;

use std::path::Path;

use serde::Serialize;

use crate::config::model::{ModelConfig, SamplingConfig};
use crate::session::SessionId;

/// KV sequence id. Every session decodes into the sequence of the same number.
pub type SeqId = SessionId;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("model load failed: {0}")]
    ModelLoad(String),

    #[error("tokenization failed: {0}")]
    Tokenization(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("no model loaded")]
    NotLoaded,
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// What the engine reports about a freshly loaded model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDescription {
    /// Free-form, architecture name first (e.g. `"llama 8B Q4_K_M"`).
    pub description: String,
    pub vocab_size: u32,
    pub context_length: u32,
}

impl ModelDescription {
    pub fn architecture(&self) -> &str {
        self.description.split_whitespace().next().unwrap_or("unknown")
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest<'a> {
    pub seq: SeqId,
    pub messages: &'a [ChatMessage],
    pub sampling: &'a SamplingConfig,
    /// <= 0 means "until end of sequence or context".
    pub max_tokens: i32,
    pub stop: &'a [String],
    pub ignore_eos: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndOfSequence,
    StopSequence,
    MaxTokens,
    ContextFull,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub prompt_tokens: u32,
    pub generated_tokens: u32,
    pub stop_reason: StopReason,
}

/// Position-level view of the shared KV cache.
///
/// `seq = None` addresses every sequence. Ranges are half-open; `p1 = None`
/// runs to the end of the sequence.
pub trait KvCache {
    fn n_ctx(&self) -> u32;

    /// Largest occupied position of `seq`, `None` when the sequence is empty.
    fn seq_pos_max(&self, seq: Option<SeqId>) -> Option<u32>;

    /// Removes cells in `[p0, p1)`. Returns false when the engine refuses a
    /// partial removal.
    fn seq_rm(&self, seq: Option<SeqId>, p0: u32, p1: Option<u32>) -> bool;

    /// Adds `delta` to the positions of cells in `[p0, p1)`.
    fn seq_add(&self, seq: SeqId, p0: u32, p1: Option<u32>, delta: i32);

    fn clear(&self);

    /// Tokens the sequence occupies, i.e. the next position to decode at.
    fn n_past(&self, seq: SeqId) -> u32 {
        self.seq_pos_max(Some(seq)).map_or(0, |p| p + 1)
    }
}

/// Native engine contract. Implementations are shared between caller threads
/// and the task worker, hence `&self` everywhere.
pub trait InferenceEngine: KvCache + Send + Sync {
    fn load_model(&self, path: &Path, config: &ModelConfig) -> EngineResult<ModelDescription>;

    /// Builds per-slot runtime state (samplers, batch buffers) for the
    /// currently loaded model.
    fn init_runtime(&self, config: &ModelConfig) -> EngineResult<()>;

    /// Frees samplers, draft contexts and batch buffers of every slot.
    fn release_slots(&self);

    /// Drops the model and its context. Idempotent.
    fn unload_model(&self);

    fn is_loaded(&self) -> bool;

    fn generate(&self, request: &GenerationRequest<'_>) -> EngineResult<Generation>;

    /// Tokens `seq` still has to ingest before it can decode `messages`.
    /// Engines that cannot tell report 0.
    fn pending_tokens(&self, _seq: SeqId, _messages: &[ChatMessage]) -> u32 {
        0
    }
}

/// Byte offset of the earliest stop sequence in `text`, if any.
pub fn find_stop(text: &str, stop: &[String]) -> Option<usize> {
    stop.iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earliest_stop_sequence_wins() {
        let stops = vec!["User:".to_string(), "\n\n".to_string(), String::new()];
        assert_eq!(find_stop("hello\n\nUser: hi", &stops), Some(5));
        assert_eq!(find_stop("no stop here", &stops), None);
    }

    #[test]
    fn architecture_is_first_word_of_description() {
        let desc = ModelDescription {
            description: "qwen2 7B Q4_K_M".into(),
            vocab_size: 151_936,
            context_length: 32_768,
        };
        assert_eq!(desc.architecture(), "qwen2");
        let empty = ModelDescription {
            description: String::new(),
            ..desc
        };
        assert_eq!(empty.architecture(), "unknown");
    }
}
