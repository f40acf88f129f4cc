//! Scripted in-memory runtime shared by the unit tests.

use crate::traits::{Completion, InferenceRuntime, StreamChunk};
use crate::{ChatMessage, CompletionOptions, ModelConfig, ModelSource, RuntimeError};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

const DIMENSIONS: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Load(ModelSource),
    Exit,
    Tokenize(String),
    Embed(String),
    SetEmbeddingMode(bool),
    Completion {
        messages: Vec<ChatMessage>,
        stream: bool,
        n_predict: u32,
        temperature: f32,
    },
}

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Stream(Vec<StreamChunk>),
    /// Emits the chunks, then waits until the request's abort token trips.
    StreamThenHang(Vec<StreamChunk>),
    StreamThenFail(Vec<StreamChunk>, String),
    Text(String),
    Fail(String),
}

#[derive(Default)]
pub(crate) struct FakeRuntime {
    calls: Mutex<Vec<Call>>,
    replies: Mutex<VecDeque<Reply>>,
    embedding_mode: Mutex<bool>,
    tokens_per_char: bool,
    embed_fail_over: Option<usize>,
    embed_fail_marker: Option<String>,
    fail_embeddings: Mutex<bool>,
    fail_load: Option<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FakeRuntime {
    pub(crate) fn with_tokens_per_char(mut self) -> Self {
        self.tokens_per_char = true;
        self
    }

    pub(crate) fn failing_embeddings_over(mut self, chars: usize) -> Self {
        self.embed_fail_over = Some(chars);
        self
    }

    pub(crate) fn failing_embeddings_containing(mut self, marker: &str) -> Self {
        self.embed_fail_marker = Some(marker.to_string());
        self
    }

    pub(crate) fn failing_load_of(mut self, needle: &str) -> Self {
        self.fail_load = Some(needle.to_string());
        self
    }

    pub(crate) fn with_replies(self, replies: impl IntoIterator<Item = Reply>) -> Self {
        lock(&self.replies).extend(replies);
        self
    }

    pub(crate) fn set_embeddings_failing(&self, failing: bool) {
        *lock(&self.fail_embeddings) = failing;
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    pub(crate) fn tokenize_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Tokenize(_)))
            .count()
    }

    pub(crate) fn completions(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Completion { .. }))
            .collect()
    }

    fn record(&self, call: Call) {
        lock(&self.calls).push(call);
    }
}

/// Character trigram hashing into a fixed number of buckets, L2-normalized.
pub(crate) fn trigram_embedding(text: &str) -> Vec<f32> {
    let mut vector = vec![0f32; DIMENSIONS];
    let chars: Vec<char> = text.to_lowercase().chars().collect();

    for window in chars.windows(3) {
        let mut hash = 1469598103934665603u64;
        for ch in window {
            hash ^= *ch as u64;
            hash = hash.wrapping_mul(1099511628211);
        }
        vector[(hash % DIMENSIONS as u64) as usize] += 1.0;
    }

    let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for value in &mut vector {
            *value /= magnitude;
        }
    }
    vector
}

#[async_trait]
impl InferenceRuntime for FakeRuntime {
    async fn load_model(
        &self,
        source: &ModelSource,
        _config: &ModelConfig,
    ) -> Result<(), RuntimeError> {
        self.record(Call::Load(source.clone()));
        if let Some(needle) = &self.fail_load {
            if format!("{source:?}").contains(needle.as_str()) {
                return Err(RuntimeError::LoadFailed(format!("cannot fetch {needle}")));
            }
        }
        Ok(())
    }

    async fn exit(&self) -> Result<(), RuntimeError> {
        self.record(Call::Exit);
        Ok(())
    }

    fn is_multithread(&self) -> bool {
        false
    }

    async fn tokenize(&self, text: &str) -> Result<Vec<u32>, RuntimeError> {
        self.record(Call::Tokenize(text.to_string()));
        let count = if self.tokens_per_char {
            text.chars().count()
        } else {
            text.split_whitespace().count()
        };
        Ok((0..count as u32).collect())
    }

    async fn embeddings(&self, text: &str) -> Result<Vec<f32>, RuntimeError> {
        self.record(Call::Embed(text.to_string()));
        if !*lock(&self.embedding_mode) {
            return Err(RuntimeError::Embedding(
                "context is in generation mode".to_string(),
            ));
        }
        if *lock(&self.fail_embeddings) {
            return Err(RuntimeError::Embedding("runtime fault".to_string()));
        }
        if self
            .embed_fail_over
            .is_some_and(|limit| text.chars().count() > limit)
        {
            return Err(RuntimeError::Embedding("batch overflow".to_string()));
        }
        if let Some(marker) = &self.embed_fail_marker {
            if text.contains(marker.as_str()) {
                return Err(RuntimeError::Embedding("rejected input".to_string()));
            }
        }
        Ok(trigram_embedding(text))
    }

    async fn set_embedding_mode(&self, enabled: bool) -> Result<(), RuntimeError> {
        self.record(Call::SetEmbeddingMode(enabled));
        *lock(&self.embedding_mode) = enabled;
        Ok(())
    }

    async fn create_chat_completion(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Completion, RuntimeError> {
        self.record(Call::Completion {
            messages: messages.to_vec(),
            stream: options.stream,
            n_predict: options.n_predict,
            temperature: options.sampling.temperature,
        });
        if *lock(&self.embedding_mode) {
            return Err(RuntimeError::Generation(
                "context is in embedding mode".to_string(),
            ));
        }

        let reply = lock(&self.replies)
            .pop_front()
            .unwrap_or_else(|| Reply::Text(String::new()));

        Ok(match reply {
            Reply::Text(text) => Completion::Text(text),
            Reply::Fail(message) => return Err(RuntimeError::Generation(message)),
            Reply::Stream(chunks) => {
                Completion::Stream(stream::iter(chunks.into_iter().map(Ok)).boxed())
            }
            Reply::StreamThenFail(chunks, message) => Completion::Stream(
                stream::iter(chunks.into_iter().map(Ok))
                    .chain(stream::once(async move {
                        Err(RuntimeError::Generation(message))
                    }))
                    .boxed(),
            ),
            Reply::StreamThenHang(chunks) => {
                let abort = options.abort.clone();
                Completion::Stream(
                    stream::iter(chunks.into_iter().map(Ok))
                        .chain(
                            stream::once(async move {
                                if let Some(token) = abort {
                                    token.cancelled().await;
                                }
                                Err(RuntimeError::Generation("aborted".to_string()))
                            }),
                        )
                        .boxed(),
                )
            }
        })
    }
}
