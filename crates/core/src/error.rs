use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("model load failed: {0}")]
    LoadFailed(String),

    #[error("no model is loaded")]
    NotLoaded,

    #[error("tokenization failed: {0}")]
    Tokenize(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("{dropped} piece(s) could not be embedded")]
    EmbeddingExhausted { dropped: usize },
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("embedding dimension {found} does not match query dimension {expected}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("document index is stale, re-index it with the active model")]
    StaleIndex,

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("no model is loaded")]
    NoModelLoaded,

    #[error("a chat turn is already in progress")]
    TurnInProgress,

    #[error("message is empty")]
    EmptyMessage,

    #[error("model load failed: {0}")]
    ModelLoad(#[source] RuntimeError),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("indexing failed: {0}")]
    Ingest(#[from] IngestError),
}
