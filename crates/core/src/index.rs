use crate::error::RetrievalError;
use crate::models::Fragment;
use crate::similarity::{top_k, RankedFragment};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Fragments of one indexed document, tagged with the model that embedded them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentIndex {
    pub document_name: String,
    pub checksum: String,
    pub source_model: String,
    pub indexed_at: DateTime<Utc>,
    fragments: Vec<Fragment>,
}

impl DocumentIndex {
    pub fn new(
        document_name: impl Into<String>,
        checksum: impl Into<String>,
        source_model: impl Into<String>,
        fragments: Vec<Fragment>,
    ) -> Self {
        Self {
            document_name: document_name.into(),
            checksum: checksum.into(),
            source_model: source_model.into(),
            indexed_at: Utc::now(),
            fragments,
        }
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn embedded_count(&self) -> usize {
        self.fragments
            .iter()
            .filter(|fragment| fragment.embedding.is_some())
            .count()
    }

    /// True when at least one fragment carries an embedding from the current model.
    pub fn is_retrievable(&self) -> bool {
        self.embedded_count() > 0
    }

    /// Clears embeddings when `active_model` differs from the model that produced them.
    ///
    /// Fragment text and count are kept. Returns whether anything was invalidated.
    pub fn invalidate_for_model(&mut self, active_model: &str) -> bool {
        if self.source_model == active_model || !self.is_retrievable() {
            return false;
        }

        for fragment in &mut self.fragments {
            fragment.embedding = None;
        }
        true
    }

    pub fn search(
        &self,
        query_embedding: &[f32],
        k: usize,
    ) -> Result<Vec<RankedFragment<'_>>, RetrievalError> {
        if !self.is_retrievable() {
            return Err(RetrievalError::StaleIndex);
        }
        top_k(query_embedding, &self.fragments, k)
    }
}

pub fn checksum_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
