//! PDF text extraction.
//!
//! The structural path reads the document with `lopdf` page by page. When it fails or yields no
//! text, `pdf-extract` reads the whole file as a single page. A file neither can read produces no
//! pages; ingestion then completes with zero chunks rather than failing the job.

use std::panic::{AssertUnwindSafe, catch_unwind};
use thiserror::Error;

/// Extraction failure. Logged, never surfaced to the job.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The structural reader rejected the file.
    #[error("structural PDF read failed: {0}")]
    Structural(String),
    /// The raw text reader rejected the file.
    #[error("raw PDF read failed: {0}")]
    Raw(String),
    /// A reader panicked on malformed input.
    #[error("PDF reader panicked")]
    Panicked,
}

/// Text of one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    /// 1-based page number.
    pub number: u32,
    /// Extracted text.
    pub text: String,
}

/// Extract page texts on the blocking pool.
pub async fn extract_pages(bytes: Vec<u8>) -> Vec<PageText> {
    match tokio::task::spawn_blocking(move || extract_pages_blocking(&bytes)).await {
        Ok(pages) => pages,
        Err(err) => {
            tracing::error!(error = %err, "PDF extraction task failed");
            Vec::new()
        }
    }
}

/// Extract page texts, dropping pages without visible text.
pub fn extract_pages_blocking(bytes: &[u8]) -> Vec<PageText> {
    match structural_pages(bytes) {
        Ok(pages) if !pages.is_empty() => return pages,
        Ok(_) => tracing::debug!("No text layer found by structural reader"),
        Err(err) => tracing::warn!(error = %err, "Falling back to raw PDF text"),
    }

    match raw_text(bytes) {
        Ok(text) if !text.trim().is_empty() => vec![PageText { number: 1, text }],
        Ok(_) => {
            tracing::info!("PDF contains no extractable text");
            Vec::new()
        }
        Err(err) => {
            tracing::warn!(error = %err, "PDF text extraction failed");
            Vec::new()
        }
    }
}

fn structural_pages(bytes: &[u8]) -> Result<Vec<PageText>, ExtractError> {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let document = lopdf::Document::load_mem(bytes)
            .map_err(|err| ExtractError::Structural(err.to_string()))?;
        let mut pages = Vec::new();
        for number in document.get_pages().into_keys() {
            match document.extract_text(&[number]) {
                Ok(text) if !text.trim().is_empty() => pages.push(PageText { number, text }),
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(page = number, error = %err, "Skipping unreadable page");
                }
            }
        }
        Ok(pages)
    }));
    result.unwrap_or(Err(ExtractError::Panicked))
}

fn raw_text(bytes: &[u8]) -> Result<String, ExtractError> {
    catch_unwind(|| pdf_extract::extract_text_from_mem(bytes))
        .map_err(|_| ExtractError::Panicked)?
        .map_err(|err| ExtractError::Raw(err.to_string()))
}

/// Minimal PDF with one Helvetica text line per page; xref offsets are computed.
#[cfg(test)]
pub(crate) fn minimal_pdf(pages: &[&str]) -> Vec<u8> {
    let page_count = pages.len();
    let font_id = 3 + 2 * page_count;
    let mut objects: Vec<String> = Vec::new();
    objects.push("<< /Type /Catalog /Pages 2 0 R >>".into());
    let kids: Vec<String> = (0..page_count)
        .map(|index| format!("{} 0 R", 3 + 2 * index))
        .collect();
    objects.push(format!(
        "<< /Type /Pages /Kids [{}] /Count {page_count} >>",
        kids.join(" ")
    ));
    for (index, text) in pages.iter().enumerate() {
        let content_id = 4 + 2 * index;
        objects.push(format!(
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents {content_id} 0 R /Resources << /Font << /F1 {font_id} 0 R >> >> >>"
        ));
        let stream = format!("BT /F1 12 Tf 72 700 Td ({text}) Tj ET");
        objects.push(format!(
            "<< /Length {} >>\nstream\n{stream}\nendstream",
            stream.len()
        ));
    }
    objects.push("<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".into());

    let mut out = b"%PDF-1.4\n".to_vec();
    let mut offsets = Vec::new();
    for (index, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.extend_from_slice(format!("{} 0 obj\n{body}\nendobj\n", index + 1).as_bytes());
    }
    let xref_start = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n", objects.len() + 1).as_bytes());
    out.extend_from_slice(b"0000000000 65535 f \n");
    for offset in offsets {
        out.extend_from_slice(format!("{offset:010} 00000 n \n").as_bytes());
    }
    out.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{xref_start}\n%%EOF\n",
            objects.len() + 1
        )
        .as_bytes(),
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(pages: &[PageText]) -> String {
        pages
            .iter()
            .map(|page| page.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn text_from_every_page_is_extracted_in_order() {
        let pdf = minimal_pdf(&["Invoice total: $42.00", "Due in thirty days"]);
        let pages = extract_pages_blocking(&pdf);

        assert!(!pages.is_empty());
        assert!(pages.windows(2).all(|pair| pair[0].number < pair[1].number));
        let text = joined(&pages);
        let total = text.find("Invoice total").expect("first page text");
        let due = text.find("thirty days").expect("second page text");
        assert!(total < due);
    }

    #[test]
    fn pages_without_text_are_dropped() {
        let pdf = minimal_pdf(&["", "Only page with words"]);
        let pages = extract_pages_blocking(&pdf);

        assert!(pages.iter().all(|page| !page.text.trim().is_empty()));
        assert!(joined(&pages).contains("Only page with words"));
    }

    #[test]
    fn garbage_yields_no_pages() {
        assert!(extract_pages_blocking(b"%PDF-1.4\nthis is not really a pdf").is_empty());
        assert!(extract_pages_blocking(b"").is_empty());
    }

    #[tokio::test]
    async fn extraction_runs_on_blocking_pool() {
        let pages = extract_pages(minimal_pdf(&["hello from the pool"])).await;
        assert_eq!(pages.len(), 1);
    }
}
