use crate::cancel::CancelToken;
use crate::chunking::ChunkingConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A bounded piece of a source document, the unit of retrieval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fragment {
    pub text: String,
    pub embedding: Option<Vec<f32>>,
}

impl Fragment {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            embedding: None,
        }
    }

    pub fn embedded(text: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            text: text.into(),
            embedding: Some(embedding),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Where the runtime should fetch model weights from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ModelSource {
    Url(String),
    /// One or more local `.gguf` shards, loaded in order.
    Files(Vec<PathBuf>),
}

impl ModelSource {
    pub fn parse(identifier: &str) -> Self {
        let trimmed = identifier.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            return Self::Url(trimmed.to_string());
        }

        Self::Files(
            trimmed
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(PathBuf::from)
                .collect(),
        )
    }
}

/// Resource limits a quantized model may carry for the runtime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct RuntimeHints {
    pub max_threads: Option<usize>,
    pub max_ram_gb: Option<f32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_ubatch: u32,
    pub embeddings: bool,
    pub offload_kqv: bool,
    pub hints: RuntimeHints,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_ctx: 2_048,
            n_batch: 512,
            n_ubatch: 512,
            embeddings: false,
            offload_kqv: true,
            hints: RuntimeHints::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SamplingConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repeat_penalty: f32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            top_p: 0.9,
            top_k: 40,
            repeat_penalty: 1.1,
        }
    }
}

/// Per-request options handed to the runtime's chat completion call.
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub stream: bool,
    pub n_predict: u32,
    pub sampling: SamplingConfig,
    pub stop_tokens: Vec<String>,
    pub use_cache: bool,
    pub abort: Option<CancelToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatOptions {
    pub system_prompt: String,
    pub sampling: SamplingConfig,
    pub n_predict: u32,
    pub fallback_n_predict: u32,
    pub fallback_temperature: f32,
    pub top_k_fragments: usize,
    pub stop_tokens: Vec<String>,
    pub stopped_marker: String,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            system_prompt: "You are a helpful assistant. When a context block is provided, \
                            answer from it and say so when it does not contain the answer."
                .to_string(),
            sampling: SamplingConfig::default(),
            n_predict: 512,
            fallback_n_predict: 256,
            fallback_temperature: 0.1,
            top_k_fragments: 3,
            stop_tokens: vec!["</s>".to_string()],
            stopped_marker: "[stopped]".to_string(),
        }
    }
}

/// What to do with text that still fails to embed after bisection bottoms out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum EmbeddingFailurePolicy {
    /// Leave the text out of the index and count it in the report.
    #[default]
    Drop,
    /// Finish the pass, then fail indexing if anything was dropped.
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexingOptions {
    pub chunking: ChunkingConfig,
    pub token_threshold: usize,
    pub tokenize_concurrency: usize,
    pub embed_concurrency: usize,
    pub min_embed_chars: usize,
    pub failure_policy: EmbeddingFailurePolicy,
}

impl Default for IndexingOptions {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            token_threshold: 300,
            tokenize_concurrency: 4,
            embed_concurrency: 1,
            min_embed_chars: 10,
            failure_policy: EmbeddingFailurePolicy::Drop,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexProgress {
    pub completed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexReport {
    pub document_name: String,
    pub source_chunks: usize,
    pub corrected_pieces: usize,
    pub embedded: usize,
    pub dropped_pieces: usize,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelSwitch {
    pub model: String,
    pub previous: Option<String>,
    pub index_invalidated: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TurnState {
    Idle,
    Retrieving,
    Generating,
    Completed,
    Cancelled,
    Failed,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    State(TurnState),
    /// Full visible assistant text so far.
    Text(String),
    Warning(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnOutcome {
    pub state: TurnState,
    /// What the user sees for this turn, including stop markers or error text.
    pub text: String,
    /// What was recorded as the assistant message, if anything.
    pub history_text: Option<String>,
    pub context_fragments: usize,
    pub used_fallback: bool,
    pub warnings: Vec<String>,
}
