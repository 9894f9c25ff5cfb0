//! Titles, grounding prompts, and token accounting.

use crate::index::ChunkHit;
use serde_json::json;
use std::sync::OnceLock;
use tiktoken_rs::{CoreBPE, cl100k_base};

const TITLE_MAX_CHARS: usize = 60;
const TITLE_KEEP_CHARS: usize = 57;
const DEFAULT_TITLE: &str = "Conversation";

/// Title derived from the first question: whitespace collapsed, long questions cut with `...`.
pub fn build_title(question: &str) -> String {
    let collapsed = question.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    if collapsed.chars().count() > TITLE_MAX_CHARS {
        let kept: String = collapsed.chars().take(TITLE_KEEP_CHARS).collect();
        return format!("{kept}...");
    }
    collapsed
}

/// System instruction embedding the retrieved chunks verbatim.
pub fn build_system_prompt(hits: &[ChunkHit]) -> String {
    let context: Vec<_> = hits
        .iter()
        .map(|hit| {
            json!({
                "pageContent": hit.text,
                "metadata": {
                    "document_id": hit.tags.document_id,
                    "original_name": hit.tags.original_name,
                    "page": hit.tags.page,
                },
            })
        })
        .collect();
    let context = serde_json::Value::Array(context).to_string();
    format!(
        "You are a helpful AI Assistant who answers the user based on available context from PDF file.\nContext: {context}"
    )
}

fn encoder() -> Option<&'static CoreBPE> {
    static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();
    ENCODER
        .get_or_init(|| match cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(err) => {
                tracing::warn!(error = %err, "Falling back to whitespace token counting");
                None
            }
        })
        .as_ref()
}

/// Token count of `text` under `cl100k_base`, or its word count when the encoder is unavailable.
pub fn count_tokens(text: &str) -> i32 {
    let count = match encoder() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => text.split_whitespace().count(),
    };
    i32::try_from(count).unwrap_or(i32::MAX)
}
