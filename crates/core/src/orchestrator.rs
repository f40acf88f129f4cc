use crate::cancel::{CancelHandle, CancelToken};
use crate::conversation::ConversationState;
use crate::extractor::{extract_document_text, LopdfExtractor, PdfExtractor};
use crate::index::{checksum_bytes, DocumentIndex};
use crate::ingest::{IndexingPipeline, SourceText};
use crate::stream::StreamAccumulator;
use crate::traits::{Completion, InferenceRuntime, StreamChunk};
use crate::{
    ChatError, ChatMessage, ChatOptions, ChatRole, CompletionOptions, IndexProgress, IndexReport,
    IndexingOptions, ModelConfig, ModelSource, ModelSwitch, RetrievalError, RuntimeError,
    SamplingConfig, TurnEvent, TurnOutcome, TurnState,
};
use futures_util::StreamExt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Owns the active model, the conversation and the indexed document.
///
/// One chat turn runs at a time. A turn can be stopped from elsewhere through
/// [`ChatSession::cancel_handle`].
pub struct ChatSession<R> {
    runtime: R,
    model_config: ModelConfig,
    chat_options: ChatOptions,
    indexing_options: IndexingOptions,
    extractor: Arc<dyn PdfExtractor + Send + Sync>,
    active_model: Option<String>,
    conversation: ConversationState,
    transcript: Vec<ChatMessage>,
    document_index: Option<DocumentIndex>,
    state: TurnState,
    cancel: CancelHandle,
}

enum Generation {
    Completed { text: String, used_fallback: bool },
    Cancelled { partial: String },
    Failed { error: RuntimeError },
}

impl<R> ChatSession<R>
where
    R: InferenceRuntime,
{
    pub fn new(runtime: R) -> Self {
        let chat_options = ChatOptions::default();
        Self {
            runtime,
            model_config: ModelConfig::default(),
            conversation: ConversationState::new(chat_options.system_prompt.clone()),
            chat_options,
            indexing_options: IndexingOptions::default(),
            extractor: Arc::new(LopdfExtractor),
            active_model: None,
            transcript: Vec::new(),
            document_index: None,
            state: TurnState::Idle,
            cancel: CancelHandle::default(),
        }
    }

    pub fn with_model_config(mut self, config: ModelConfig) -> Self {
        self.model_config = config;
        self
    }

    /// Replaces chat options and restarts the conversation under the new system prompt.
    pub fn with_chat_options(mut self, options: ChatOptions) -> Self {
        self.conversation = ConversationState::new(options.system_prompt.clone());
        self.transcript.clear();
        self.chat_options = options;
        self
    }

    pub fn with_indexing_options(mut self, options: IndexingOptions) -> Self {
        self.indexing_options = options;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn PdfExtractor + Send + Sync>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn active_model(&self) -> Option<&str> {
        self.active_model.as_deref()
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn conversation(&self) -> &ConversationState {
        &self.conversation
    }

    /// What the user sees: raw user text and annotated assistant replies.
    pub fn transcript(&self) -> &[ChatMessage] {
        &self.transcript
    }

    pub fn document_index(&self) -> Option<&DocumentIndex> {
        self.document_index.as_ref()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel_turn(&self) -> bool {
        self.cancel.cancel()
    }

    pub fn reset_conversation(&mut self) {
        self.conversation.clear();
        self.transcript.clear();
    }

    /// Unloads the current model, if any, then loads `identifier`.
    ///
    /// An index built by another model keeps its text but loses its embeddings.
    /// On load failure the session is left without an active model.
    pub async fn load_model(&mut self, identifier: &str) -> Result<ModelSwitch, ChatError> {
        self.ensure_idle()?;
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(ChatError::ModelLoad(RuntimeError::LoadFailed(
                "model identifier is empty".to_string(),
            )));
        }

        let mut warnings = Vec::new();
        let previous = self.active_model.take();
        if let Some(previous) = &previous {
            info!(model = %previous, "unloading model");
            if let Err(error) = self.runtime.exit().await {
                warn!(model = %previous, %error, "runtime exit failed");
                warnings.push(format!("unloading {previous} failed: {error}"));
            }
        }

        let mut index_invalidated = false;
        if let Some(index) = self.document_index.as_mut() {
            let tagged = index.source_model.clone();
            if index.invalidate_for_model(identifier) {
                let message = format!(
                    "{} was indexed with {tagged}; re-index it to use it with {identifier}",
                    index.document_name
                );
                warn!(document = %index.document_name, from = %tagged, to = %identifier, "document embeddings cleared");
                warnings.push(message);
                index_invalidated = true;
            }
        }

        let source = ModelSource::parse(identifier);
        let config = ModelConfig {
            embeddings: false,
            ..self.model_config
        };
        if let Err(error) = self.runtime.load_model(&source, &config).await {
            warn!(model = %identifier, %error, "model load failed");
            return Err(ChatError::ModelLoad(error));
        }

        info!(
            model = %identifier,
            n_ctx = config.n_ctx,
            multithread = self.runtime.is_multithread(),
            "model loaded"
        );
        self.active_model = Some(identifier.to_string());

        Ok(ModelSwitch {
            model: identifier.to_string(),
            previous,
            index_invalidated,
            warnings,
        })
    }

    pub async fn unload_model(&mut self) -> Result<(), ChatError> {
        self.ensure_idle()?;
        if let Some(model) = self.active_model.take() {
            info!(model = %model, "unloading model");
            self.runtime.exit().await?;
        }
        Ok(())
    }

    /// Unloads the model and drops the session.
    pub async fn dispose(mut self) -> Result<(), ChatError> {
        self.unload_model().await
    }

    /// Extracts, chunks and embeds a PDF, replacing any previous index.
    ///
    /// On failure the previous index stays in place.
    pub async fn index_document<F>(
        &mut self,
        document_name: &str,
        bytes: &[u8],
        on_progress: F,
    ) -> Result<IndexReport, ChatError>
    where
        F: FnMut(IndexProgress) + Send,
    {
        self.ensure_idle()?;
        let model = self.active_model.clone().ok_or(ChatError::NoModelLoaded)?;
        let checksum = checksum_bytes(bytes);
        let text = extract_document_text(Arc::clone(&self.extractor), bytes.to_vec()).await?;
        debug!(document = %document_name, chars = text.chars().count(), "extracted document text");

        self.index_source(
            SourceText {
                document_name,
                checksum: &checksum,
                text: &text,
            },
            &model,
            on_progress,
        )
        .await
    }

    /// Indexes text that is already extracted.
    pub async fn index_text<F>(
        &mut self,
        document_name: &str,
        text: &str,
        on_progress: F,
    ) -> Result<IndexReport, ChatError>
    where
        F: FnMut(IndexProgress) + Send,
    {
        self.ensure_idle()?;
        let model = self.active_model.clone().ok_or(ChatError::NoModelLoaded)?;
        let checksum = checksum_bytes(text.as_bytes());
        self.index_source(
            SourceText {
                document_name,
                checksum: &checksum,
                text,
            },
            &model,
            on_progress,
        )
        .await
    }

    async fn index_source<F>(
        &mut self,
        source: SourceText<'_>,
        model: &str,
        on_progress: F,
    ) -> Result<IndexReport, ChatError>
    where
        F: FnMut(IndexProgress) + Send,
    {
        let pipeline = IndexingPipeline::new(&self.runtime, &self.indexing_options);
        let (index, report) = pipeline.index(source, model, on_progress).await?;

        if let Some(previous) = self.document_index.replace(index) {
            debug!(previous = %previous.document_name, "replaced document index");
        }
        Ok(report)
    }

    /// Runs one chat turn to a terminal state and returns to idle.
    ///
    /// Retrieval and generation faults end up in the outcome, not in `Err`.
    pub async fn send_turn<F>(
        &mut self,
        user_text: &str,
        mut on_event: F,
    ) -> Result<TurnOutcome, ChatError>
    where
        F: FnMut(TurnEvent) + Send,
    {
        self.ensure_idle()?;
        let user_text = user_text.trim();
        if user_text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if self.active_model.is_none() {
            return Err(ChatError::NoModelLoaded);
        }

        let token = self.cancel.arm();
        let mut turn = TurnGuard {
            session: self,
            settled: false,
        };
        let mut warnings = Vec::new();
        turn.transcript.push(ChatMessage::user(user_text));

        let (prompt, context_fragments) = turn
            .prepare_prompt(user_text, &mut warnings, &mut on_event)
            .await;
        turn.conversation.push_user(prompt);

        turn.enter(TurnState::Generating, &mut on_event);
        let generation = turn.generate(&token, &mut on_event).await;
        let outcome = turn.finish_turn(generation, context_fragments, warnings, &mut on_event);

        turn.cancel.disarm();
        turn.enter(TurnState::Idle, &mut on_event);
        turn.settled = true;
        Ok(outcome)
    }

    fn ensure_idle(&self) -> Result<(), ChatError> {
        if self.state == TurnState::Idle {
            Ok(())
        } else {
            Err(ChatError::TurnInProgress)
        }
    }

    fn enter<F>(&mut self, state: TurnState, on_event: &mut F)
    where
        F: FnMut(TurnEvent),
    {
        self.state = state;
        if state.is_terminal() {
            debug!(?state, "turn settled");
        }
        on_event(TurnEvent::State(state));
    }

    /// Returns the text to send and how many fragments were injected.
    async fn prepare_prompt<F>(
        &mut self,
        user_text: &str,
        warnings: &mut Vec<String>,
        on_event: &mut F,
    ) -> (String, usize)
    where
        F: FnMut(TurnEvent) + Send,
    {
        let retrievable = match &self.document_index {
            None => return (user_text.to_string(), 0),
            Some(index) => index.is_retrievable(),
        };

        if !retrievable {
            let name = self
                .document_index
                .as_ref()
                .map(|index| index.document_name.clone())
                .unwrap_or_default();
            push_warning(
                warnings,
                on_event,
                format!("{name} has no embeddings for the active model; answering without document context"),
            );
            return (user_text.to_string(), 0);
        }

        self.enter(TurnState::Retrieving, on_event);

        let Some(index) = self.document_index.as_ref() else {
            return (user_text.to_string(), 0);
        };
        match retrieve_context(
            &self.runtime,
            index,
            user_text,
            self.chat_options.top_k_fragments,
        )
        .await
        {
            Ok(fragments) if !fragments.is_empty() => {
                debug!(fragments = fragments.len(), "injecting document context");
                let count = fragments.len();
                (append_context(user_text, &fragments), count)
            }
            Ok(_) => (user_text.to_string(), 0),
            Err(error) => {
                push_warning(
                    warnings,
                    on_event,
                    format!("retrieval failed, answering without document context: {error}"),
                );
                (user_text.to_string(), 0)
            }
        }
    }

    async fn generate<F>(&self, token: &CancelToken, on_event: &mut F) -> Generation
    where
        F: FnMut(TurnEvent) + Send,
    {
        if let Err(error) = self.runtime.set_embedding_mode(false).await {
            return Generation::Failed { error };
        }

        let options = CompletionOptions {
            stream: true,
            n_predict: self.chat_options.n_predict,
            sampling: self.chat_options.sampling,
            stop_tokens: self.chat_options.stop_tokens.clone(),
            use_cache: true,
            abort: Some(token.clone()),
        };

        let mut output = StreamAccumulator::new();
        if let Err(error) = self.request(&options, token, &mut output, on_event).await {
            return settle_error(token, output, error);
        }
        if token.is_cancelled() {
            return Generation::Cancelled {
                partial: output.into_text(),
            };
        }
        if !output.is_empty() {
            return Generation::Completed {
                text: output.into_text(),
                used_fallback: false,
            };
        }

        warn!("streamed completion was empty, retrying once without streaming");
        let fallback = CompletionOptions {
            stream: false,
            n_predict: self.chat_options.fallback_n_predict,
            sampling: SamplingConfig {
                temperature: self.chat_options.fallback_temperature,
                ..self.chat_options.sampling
            },
            ..options
        };
        if let Err(error) = self.request(&fallback, token, &mut output, on_event).await {
            return settle_error(token, output, error);
        }
        if token.is_cancelled() {
            return Generation::Cancelled {
                partial: output.into_text(),
            };
        }

        Generation::Completed {
            text: output.into_text(),
            used_fallback: true,
        }
    }

    /// Issues one completion request and folds its output into `output`.
    ///
    /// Returns early, without error, once `token` trips.
    async fn request<F>(
        &self,
        options: &CompletionOptions,
        token: &CancelToken,
        output: &mut StreamAccumulator,
        on_event: &mut F,
    ) -> Result<(), RuntimeError>
    where
        F: FnMut(TurnEvent) + Send,
    {
        let completion = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            result = self.runtime.create_chat_completion(self.conversation.messages(), options) => result?,
        };

        match completion {
            Completion::Text(text) => {
                if output.push(StreamChunk::Snapshot(text)) {
                    on_event(TurnEvent::Text(output.text().to_string()));
                }
            }
            Completion::Stream(mut stream) => loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    next = stream.next() => match next {
                        Some(Ok(chunk)) => {
                            if output.push(chunk) {
                                on_event(TurnEvent::Text(output.text().to_string()));
                            }
                        }
                        Some(Err(error)) => return Err(error),
                        None => break,
                    },
                }
            },
        }

        Ok(())
    }

    fn finish_turn<F>(
        &mut self,
        generation: Generation,
        context_fragments: usize,
        mut warnings: Vec<String>,
        on_event: &mut F,
    ) -> TurnOutcome
    where
        F: FnMut(TurnEvent),
    {
        let (state, text, history_text, used_fallback) = match generation {
            Generation::Completed {
                text,
                used_fallback,
            } => {
                if text.is_empty() {
                    push_warning(&mut warnings, on_event, "the model returned no output".to_string());
                }
                self.conversation.push_assistant(text.clone());
                (TurnState::Completed, text.clone(), Some(text), used_fallback)
            }
            Generation::Cancelled { partial } => {
                let marker = &self.chat_options.stopped_marker;
                info!(chars = partial.chars().count(), "turn cancelled");
                if partial.is_empty() {
                    self.conversation.rollback_pending_user();
                    (TurnState::Cancelled, marker.clone(), None, false)
                } else {
                    self.conversation.push_assistant(partial.clone());
                    let shown = format!("{partial} {marker}");
                    (TurnState::Cancelled, shown, Some(partial), false)
                }
            }
            Generation::Failed { error } => {
                warn!(%error, "generation failed");
                self.conversation.rollback_pending_user();
                (TurnState::Failed, format!("Error: {error}"), None, false)
            }
        };

        self.transcript.push(ChatMessage::assistant(text.clone()));
        on_event(TurnEvent::Text(text.clone()));
        self.enter(state, on_event);

        TurnOutcome {
            state,
            text,
            history_text,
            context_fragments,
            used_fallback,
            warnings,
        }
    }
}

impl<R> ChatSession<R> {
    /// Unwinds a turn whose future was dropped mid-flight.
    fn abandon_turn(&mut self) {
        warn!(state = ?self.state, "chat turn dropped before it settled");
        self.cancel.cancel();
        self.cancel.disarm();
        self.conversation.rollback_pending_user();
        if self
            .transcript
            .last()
            .is_some_and(|message| message.role == ChatRole::User)
        {
            self.transcript.pop();
        }
        self.state = TurnState::Idle;
    }
}

/// Returns the session to idle if the turn holding it is dropped unsettled.
struct TurnGuard<'s, R> {
    session: &'s mut ChatSession<R>,
    settled: bool,
}

impl<R> Deref for TurnGuard<'_, R> {
    type Target = ChatSession<R>;

    fn deref(&self) -> &Self::Target {
        self.session
    }
}

impl<R> DerefMut for TurnGuard<'_, R> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
    }
}

impl<R> Drop for TurnGuard<'_, R> {
    fn drop(&mut self) {
        if !self.settled {
            self.session.abandon_turn();
        }
    }
}

fn settle_error(token: &CancelToken, output: StreamAccumulator, error: RuntimeError) -> Generation {
    if token.is_cancelled() {
        Generation::Cancelled {
            partial: output.into_text(),
        }
    } else {
        Generation::Failed { error }
    }
}

fn push_warning<F>(warnings: &mut Vec<String>, on_event: &mut F, message: String)
where
    F: FnMut(TurnEvent),
{
    warn!(%message, "chat turn warning");
    on_event(TurnEvent::Warning(message.clone()));
    warnings.push(message);
}

async fn retrieve_context<R>(
    runtime: &R,
    index: &DocumentIndex,
    query: &str,
    k: usize,
) -> Result<Vec<String>, RetrievalError>
where
    R: InferenceRuntime + ?Sized,
{
    runtime.set_embedding_mode(true).await?;
    let query_embedding = runtime.embeddings(query).await?;
    let hits = index.search(&query_embedding, k)?;
    Ok(hits
        .into_iter()
        .map(|hit| hit.fragment.text.clone())
        .collect())
}

/// Appends numbered fragments after the user's text.
pub fn append_context(user_text: &str, fragments: &[String]) -> String {
    let numbered = fragments
        .iter()
        .enumerate()
        .map(|(position, fragment)| format!("[{}] {}", position + 1, fragment))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("{user_text}\n\nContext:\n{numbered}")
}
