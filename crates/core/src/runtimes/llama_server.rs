use crate::cancel::CancelToken;
use crate::traits::{Completion, CompletionStream, InferenceRuntime, StreamChunk};
use crate::{ChatMessage, CompletionOptions, ModelConfig, ModelSource, RuntimeError};
use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};
use reqwest::{Client, Response};
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

const BACKEND: &str = "llama-server";

type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send>>;

/// [`InferenceRuntime`] backed by a llama.cpp-compatible HTTP server.
///
/// The server is started with its model already resident, so `load_model`
/// checks readiness and records the selection. Embedding and generation
/// modes are tracked on this side and enforced before each call.
pub struct LlamaServerRuntime {
    client: Client,
    endpoint: String,
    state: Mutex<ServerState>,
}

#[derive(Debug, Default)]
struct ServerState {
    model: Option<String>,
    embedding_mode: bool,
}

impl LlamaServerRuntime {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, RuntimeError> {
        let endpoint = endpoint.into();
        url::Url::parse(&endpoint)?;

        Ok(Self {
            client: Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            state: Mutex::default(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn loaded_model(&self) -> Option<String> {
        self.state().model.clone()
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_loaded(&self) -> Result<(), RuntimeError> {
        if self.state().model.is_some() {
            Ok(())
        } else {
            Err(RuntimeError::NotLoaded)
        }
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Response, RuntimeError> {
        let response = self
            .client
            .post(format!("{}/{}", self.endpoint, path))
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            return Err(RuntimeError::BackendResponse {
                backend: BACKEND.to_string(),
                details: format!("{path} returned {status}: {details}"),
            });
        }
        Ok(response)
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, RuntimeError> {
        Ok(self.post(path, body).await?.json::<Value>().await?)
    }
}

#[async_trait]
impl InferenceRuntime for LlamaServerRuntime {
    async fn load_model(
        &self,
        source: &ModelSource,
        config: &ModelConfig,
    ) -> Result<(), RuntimeError> {
        let response = self
            .client
            .get(format!("{}/health", self.endpoint))
            .send()
            .await
            .map_err(|error| RuntimeError::LoadFailed(error.to_string()))?;

        if !response.status().is_success() {
            return Err(RuntimeError::LoadFailed(format!(
                "{BACKEND} at {} is not ready: {}",
                self.endpoint,
                response.status()
            )));
        }

        let name = model_name(source);
        debug!(
            model = %name,
            n_ctx = config.n_ctx,
            n_batch = config.n_batch,
            max_threads = ?config.hints.max_threads,
            max_ram_gb = ?config.hints.max_ram_gb,
            "server ready"
        );

        let mut state = self.state();
        state.model = Some(name);
        state.embedding_mode = config.embeddings;
        Ok(())
    }

    async fn exit(&self) -> Result<(), RuntimeError> {
        let mut state = self.state();
        if let Some(model) = state.model.take() {
            info!(model = %model, "released server model");
        }
        state.embedding_mode = false;
        Ok(())
    }

    fn is_multithread(&self) -> bool {
        true
    }

    async fn tokenize(&self, text: &str) -> Result<Vec<u32>, RuntimeError> {
        self.ensure_loaded()?;
        let value = self.post_json("tokenize", &json!({ "content": text })).await?;
        parse_tokens(&value).ok_or_else(|| RuntimeError::Tokenize(format!("unexpected payload: {value}")))
    }

    async fn embeddings(&self, text: &str) -> Result<Vec<f32>, RuntimeError> {
        self.ensure_loaded()?;
        if !self.state().embedding_mode {
            return Err(RuntimeError::Embedding(
                "runtime is in generation mode".to_string(),
            ));
        }

        let value = self.post_json("embedding", &json!({ "content": text })).await?;
        let embedding = parse_embedding(&value)
            .ok_or_else(|| RuntimeError::Embedding(format!("unexpected payload: {value}")))?;
        Ok(normalize(embedding))
    }

    async fn set_embedding_mode(&self, enabled: bool) -> Result<(), RuntimeError> {
        self.state().embedding_mode = enabled;
        Ok(())
    }

    async fn create_chat_completion(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Completion, RuntimeError> {
        self.ensure_loaded()?;
        if self.state().embedding_mode {
            return Err(RuntimeError::Generation(
                "runtime is in embedding mode".to_string(),
            ));
        }

        let body = json!({
            "messages": messages,
            "stream": options.stream,
            "max_tokens": options.n_predict,
            "n_predict": options.n_predict,
            "temperature": options.sampling.temperature,
            "top_p": options.sampling.top_p,
            "top_k": options.sampling.top_k,
            "repeat_penalty": options.sampling.repeat_penalty,
            "stop": options.stop_tokens,
            "cache_prompt": options.use_cache,
        });

        let response = self.post("v1/chat/completions", &body).await?;
        if !options.stream {
            let value = response.json::<Value>().await?;
            return value
                .pointer("/choices/0/message/content")
                .and_then(Value::as_str)
                .map(|content| Completion::Text(content.to_string()))
                .ok_or_else(|| RuntimeError::BackendResponse {
                    backend: BACKEND.to_string(),
                    details: format!("completion without message content: {value}"),
                });
        }

        let body = response
            .bytes_stream()
            .map(|item| item.map(|bytes| bytes.to_vec()))
            .boxed();
        Ok(Completion::Stream(sse_stream(SseReader::new(
            body,
            options.abort.clone(),
        ))))
    }
}

fn model_name(source: &ModelSource) -> String {
    match source {
        ModelSource::Url(url) => url.clone(),
        ModelSource::Files(paths) => paths
            .iter()
            .map(|path| path.to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join(","),
    }
}

fn parse_tokens(value: &Value) -> Option<Vec<u32>> {
    value
        .get("tokens")?
        .as_array()?
        .iter()
        .map(|token| {
            token
                .as_u64()
                .or_else(|| token.get("id").and_then(Value::as_u64))
                .and_then(|id| u32::try_from(id).ok())
        })
        .collect()
}

/// Accepts `{"embedding": [..]}` as well as the list form `[{"embedding": [[..]]}]`.
fn parse_embedding(value: &Value) -> Option<Vec<f32>> {
    let entry = match value {
        Value::Array(items) => items.first()?,
        other => other,
    };
    let embedding = entry.get("embedding")?.as_array()?;
    let vector = match embedding.first() {
        Some(Value::Array(pooled)) => pooled,
        _ => embedding,
    };

    vector
        .iter()
        .map(|component| component.as_f64().map(|number| number as f32))
        .collect()
}

fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for value in &mut vector {
            *value /= magnitude;
        }
    }
    vector
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Delta(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseEvent, RuntimeError> {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return Ok(SseEvent::Skip);
    };
    let data = data.trim();
    if data.is_empty() {
        return Ok(SseEvent::Skip);
    }
    if data == "[DONE]" {
        return Ok(SseEvent::Done);
    }

    let value: Value = serde_json::from_str(data)?;
    if let Some(error) = value.get("error") {
        return Err(RuntimeError::Generation(error.to_string()));
    }

    match value
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
    {
        Some(content) if !content.is_empty() => Ok(SseEvent::Delta(content.to_string())),
        _ => Ok(SseEvent::Skip),
    }
}

struct SseReader {
    body: ByteStream,
    buffer: Vec<u8>,
    body_done: bool,
    finished: bool,
    abort: Option<CancelToken>,
}

impl SseReader {
    fn new(body: ByteStream, abort: Option<CancelToken>) -> Self {
        Self {
            body,
            buffer: Vec::new(),
            body_done: false,
            finished: false,
            abort,
        }
    }

    fn next_line(&mut self) -> Option<String> {
        let position = self.buffer.iter().position(|byte| *byte == b'\n')?;
        let line: Vec<u8> = self.buffer.drain(..=position).collect();
        Some(String::from_utf8_lossy(&line).trim_end().to_string())
    }

    async fn next_chunk(&mut self) -> Option<Result<StreamChunk, RuntimeError>> {
        loop {
            if self.finished || self.abort.as_ref().is_some_and(CancelToken::is_cancelled) {
                return None;
            }

            if let Some(line) = self.next_line() {
                match parse_sse_line(&line) {
                    Ok(SseEvent::Delta(text)) => {
                        return Some(Ok(StreamChunk::Delta(text.into_bytes())))
                    }
                    Ok(SseEvent::Skip) => continue,
                    Ok(SseEvent::Done) => {
                        self.finished = true;
                        return None;
                    }
                    Err(error) => {
                        self.finished = true;
                        return Some(Err(error));
                    }
                }
            }

            if self.body_done {
                if self.buffer.is_empty() {
                    return None;
                }
                self.buffer.push(b'\n');
                continue;
            }

            match self.body.next().await {
                Some(Ok(bytes)) => self.buffer.extend_from_slice(&bytes),
                Some(Err(error)) => {
                    self.finished = true;
                    return Some(Err(error.into()));
                }
                None => self.body_done = true,
            }
        }
    }
}

fn sse_stream(reader: SseReader) -> CompletionStream {
    stream::unfold(reader, |mut reader| async move {
        reader.next_chunk().await.map(|item| (item, reader))
    })
    .boxed()
}
