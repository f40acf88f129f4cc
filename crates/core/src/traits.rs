use crate::{ChatMessage, CompletionOptions, ModelConfig, ModelSource, RuntimeError};
use async_trait::async_trait;
use futures_util::stream::Stream;
use std::pin::Pin;

/// One increment of streamed output. Runtimes emit either form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    /// Raw bytes of the newly generated piece. May split a UTF-8 sequence.
    Delta(Vec<u8>),
    /// Everything generated so far.
    Snapshot(String),
}

pub type CompletionStream =
    Pin<Box<dyn Stream<Item = Result<StreamChunk, RuntimeError>> + Send>>;

pub enum Completion {
    Text(String),
    Stream(CompletionStream),
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// The inference runtime that owns the model, its context and its KV cache.
///
/// Implementations may be called concurrently for `tokenize`; every other
/// call is issued one at a time by the session.
#[async_trait]
pub trait InferenceRuntime: Send + Sync {
    async fn load_model(&self, source: &ModelSource, config: &ModelConfig)
        -> Result<(), RuntimeError>;

    async fn exit(&self) -> Result<(), RuntimeError>;

    fn is_multithread(&self) -> bool;

    async fn tokenize(&self, text: &str) -> Result<Vec<u32>, RuntimeError>;

    /// Returns a normalized embedding for `text`. Requires embedding mode.
    async fn embeddings(&self, text: &str) -> Result<Vec<f32>, RuntimeError>;

    async fn set_embedding_mode(&self, enabled: bool) -> Result<(), RuntimeError>;

    async fn create_chat_completion(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Completion, RuntimeError>;
}
