use crate::chunking::normalize_whitespace;
use crate::error::IngestError;
use lopdf::Document;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

pub trait PdfExtractor {
    fn extract_pages(&self, bytes: &[u8]) -> Result<Vec<PageText>, IngestError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn extract_pages(&self, bytes: &[u8]) -> Result<Vec<PageText>, IngestError> {
        let document =
            Document::load_mem(bytes).map_err(|error| IngestError::PdfParse(error.to_string()))?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| IngestError::PdfParse(error.to_string()))?;

            if !text.trim().is_empty() {
                pages.push(PageText {
                    number: page_no,
                    text,
                });
            }
        }

        if pages.is_empty() {
            return Err(IngestError::PdfParse(
                "pdf had no readable page text".to_string(),
            ));
        }

        Ok(pages)
    }
}

/// Joins normalized page text in page order.
pub fn join_pages(pages: &[PageText]) -> String {
    pages
        .iter()
        .map(|page| normalize_whitespace(&page.text))
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Runs `extractor` on the blocking pool and returns the whole document as one string.
pub async fn extract_document_text(
    extractor: Arc<dyn PdfExtractor + Send + Sync>,
    bytes: Vec<u8>,
) -> Result<String, IngestError> {
    let pages = tokio::task::spawn_blocking(move || extractor.extract_pages(&bytes))
        .await
        .map_err(|error| IngestError::PdfParse(format!("extraction task failed: {error}")))??;

    Ok(join_pages(&pages))
}
