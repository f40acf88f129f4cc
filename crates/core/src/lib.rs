pub mod cancel;
pub mod catalog;
pub mod chunking;
pub mod conversation;
pub mod error;
pub mod extractor;
pub mod index;
pub mod ingest;
pub mod models;
pub mod orchestrator;
pub mod runtimes;
pub mod similarity;
pub mod stream;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use cancel::{CancelHandle, CancelToken};
pub use catalog::{discover_model_files, ModelFile};
pub use chunking::{normalize_whitespace, split_text, ChunkingConfig};
pub use conversation::ConversationState;
pub use error::{ChatError, IngestError, RetrievalError, RuntimeError};
pub use extractor::{extract_document_text, join_pages, LopdfExtractor, PageText, PdfExtractor};
pub use index::{checksum_bytes, DocumentIndex};
pub use ingest::{IndexingPipeline, SourceText};
pub use models::{
    ChatMessage, ChatOptions, ChatRole, CompletionOptions, EmbeddingFailurePolicy, Fragment,
    IndexProgress, IndexReport, IndexingOptions, ModelConfig, ModelSource, ModelSwitch,
    RuntimeHints, SamplingConfig, TurnEvent, TurnOutcome, TurnState,
};
pub use orchestrator::{append_context, ChatSession};
pub use runtimes::LlamaServerRuntime;
pub use similarity::{cosine_similarity, rank, top_k, RankedFragment, DEFAULT_TOP_K};
pub use stream::StreamAccumulator;
pub use traits::{Completion, CompletionStream, InferenceRuntime, StreamChunk};
