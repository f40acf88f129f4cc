use crate::chunking::split_text;
use crate::index::DocumentIndex;
use crate::traits::InferenceRuntime;
use crate::{
    EmbeddingFailurePolicy, Fragment, IndexProgress, IndexReport, IndexingOptions, IngestError,
};
use futures_util::stream::{self, StreamExt};
use tracing::{debug, info, warn};

/// Bisection depth after which an oversized piece is accepted as-is.
const MAX_SPLIT_DEPTH: usize = 32;

/// Text to index, already extracted from its container format.
#[derive(Debug, Clone, Copy)]
pub struct SourceText<'a> {
    pub document_name: &'a str,
    pub checksum: &'a str,
    pub text: &'a str,
}

#[derive(Debug, Default)]
struct EmbeddedPiece {
    fragments: Vec<Fragment>,
    dropped: usize,
}

/// Chunks, size-corrects and embeds a document against one runtime.
pub struct IndexingPipeline<'a, R: ?Sized> {
    runtime: &'a R,
    options: &'a IndexingOptions,
}

impl<'a, R> IndexingPipeline<'a, R>
where
    R: InferenceRuntime + ?Sized,
{
    pub fn new(runtime: &'a R, options: &'a IndexingOptions) -> Self {
        Self { runtime, options }
    }

    pub async fn index<F>(
        &self,
        source: SourceText<'_>,
        model: &str,
        mut on_progress: F,
    ) -> Result<(DocumentIndex, IndexReport), IngestError>
    where
        F: FnMut(IndexProgress) + Send,
    {
        self.options.chunking.validate()?;

        let chunks = split_text(source.text, &self.options.chunking);
        let source_chunks = chunks.len();

        let min_chars = self.options.chunking.min_chars;
        let (pieces, short): (Vec<String>, Vec<String>) = stream::iter(chunks)
            .map(|chunk| self.fit_to_token_budget(chunk))
            .buffered(self.options.tokenize_concurrency.max(1))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flatten()
            .partition(|piece| piece.trim().chars().count() > min_chars);
        if !short.is_empty() {
            debug!(count = short.len(), min_chars, "discarding pieces below the fragment minimum");
        }
        let total = pieces.len();

        self.runtime.set_embedding_mode(true).await?;

        let mut embedded_fragments = Vec::with_capacity(total);
        let mut failed = 0usize;
        let mut completed = 0usize;

        let mut embedded = stream::iter(pieces)
            .map(|piece| self.embed_with_recovery(piece))
            .buffered(self.options.embed_concurrency.max(1));

        while let Some(piece) = embedded.next().await {
            failed += piece.dropped;
            embedded_fragments.extend(piece.fragments);

            completed += 1;
            on_progress(IndexProgress { completed, total });
        }

        let (fragments, mismatched) = keep_dominant_dimension(embedded_fragments);
        failed += mismatched;
        let dropped = failed + short.len();

        let report = IndexReport {
            document_name: source.document_name.to_string(),
            source_chunks,
            corrected_pieces: total,
            embedded: fragments.len(),
            dropped_pieces: dropped,
            model: model.to_string(),
        };

        info!(
            document = %report.document_name,
            model = %report.model,
            source_chunks = report.source_chunks,
            corrected_pieces = report.corrected_pieces,
            embedded = report.embedded,
            dropped = report.dropped_pieces,
            "document indexed"
        );

        if failed > 0 && self.options.failure_policy == EmbeddingFailurePolicy::Fail {
            return Err(IngestError::EmbeddingExhausted { dropped: failed });
        }

        let index = DocumentIndex::new(source.document_name, source.checksum, model, fragments);
        Ok((index, report))
    }

    /// Bisects `chunk` at whitespace until every piece tokenizes within the threshold.
    ///
    /// Pieces without interior whitespace are kept even when still oversized.
    pub async fn fit_to_token_budget(&self, chunk: String) -> Vec<String> {
        let mut accepted = Vec::new();
        let mut pending = vec![(chunk, 0usize)];

        while let Some((piece, depth)) = pending.pop() {
            let token_count = match self.runtime.tokenize(&piece).await {
                Ok(tokens) => tokens.len(),
                Err(error) => {
                    warn!(%error, chars = piece.chars().count(), "tokenize failed, keeping piece unsplit");
                    accepted.push(piece);
                    continue;
                }
            };

            if token_count <= self.options.token_threshold || depth >= MAX_SPLIT_DEPTH {
                accepted.push(piece);
                continue;
            }

            match split_at_whitespace_near_middle(&piece) {
                Some((left, right)) => {
                    debug!(token_count, depth, "bisecting oversized chunk");
                    for half in [right, left] {
                        if !half.is_empty() {
                            pending.push((half, depth + 1));
                        }
                    }
                }
                None => accepted.push(piece),
            }
        }

        accepted
    }

    async fn embed_with_recovery(&self, piece: String) -> EmbeddedPiece {
        let floor = self
            .options
            .min_embed_chars
            .max(self.options.chunking.min_chars);
        let mut result = EmbeddedPiece::default();
        let mut pending = vec![piece];

        while let Some(text) = pending.pop() {
            match self.runtime.embeddings(&text).await {
                Ok(embedding) => result.fragments.push(Fragment::embedded(text, embedding)),
                Err(error) => {
                    let chars = text.chars().count();
                    if chars <= floor {
                        debug!(%error, chars, "dropping piece below embedding floor");
                        result.dropped += 1;
                        continue;
                    }

                    debug!(%error, chars, "embedding failed, retrying halves");
                    let (left, right) = split_at_char_middle(&text);
                    for half in [right, left] {
                        if half.chars().count() <= floor {
                            if !half.is_empty() {
                                result.dropped += 1;
                            }
                        } else {
                            pending.push(half);
                        }
                    }
                }
            }
        }

        result
    }
}

/// Keeps fragments carrying the most common embedding length and counts the rest.
///
/// Ties go to the length seen first.
fn keep_dominant_dimension(fragments: Vec<Fragment>) -> (Vec<Fragment>, usize) {
    let dimension = |fragment: &Fragment| fragment.embedding.as_ref().map_or(0, Vec::len);

    let mut counts: Vec<(usize, usize)> = Vec::new();
    for fragment in &fragments {
        let length = dimension(fragment);
        match counts.iter_mut().find(|(seen, _)| *seen == length) {
            Some((_, count)) => *count += 1,
            None => counts.push((length, 1)),
        }
    }

    let Some(expected) = counts
        .iter()
        .rev()
        .max_by_key(|(_, count)| *count)
        .map(|(length, _)| *length)
    else {
        return (fragments, 0);
    };

    let (kept, mismatched): (Vec<Fragment>, Vec<Fragment>) = fragments
        .into_iter()
        .partition(|fragment| dimension(fragment) == expected);
    for fragment in &mismatched {
        warn!(expected, found = dimension(fragment), "dropping fragment with mismatched embedding dimension");
    }
    (kept, mismatched.len())
}

/// Splits at the whitespace character closest to the character midpoint.
fn split_at_whitespace_near_middle(text: &str) -> Option<(String, String)> {
    let chars: Vec<char> = text.chars().collect();
    let middle = chars.len() / 2;

    let position = chars
        .iter()
        .enumerate()
        .filter(|(_, ch)| ch.is_whitespace())
        .min_by_key(|(index, _)| index.abs_diff(middle))
        .map(|(index, _)| index)?;

    let left: String = chars[..position].iter().collect();
    let right: String = chars[position + 1..].iter().collect();
    Some((left.trim().to_string(), right.trim().to_string()))
}

fn split_at_char_middle(text: &str) -> (String, String) {
    let chars: Vec<char> = text.chars().collect();
    let middle = chars.len() / 2;
    let left: String = chars[..middle].iter().collect();
    let right: String = chars[middle..].iter().collect();
    (left.trim().to_string(), right.trim().to_string())
}
