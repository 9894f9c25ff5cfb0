//! Retrieval-grounded question answering over one tenant document.
//!
//! Each question resolves its conversation before retrieval so the caller always receives a
//! conversation id, even when the document has no indexed chunks yet. In that case the fixed
//! [`NOT_READY_MESSAGE`] is returned and nothing is persisted, so the question can be asked again
//! once ingestion finishes. Otherwise the question and the model reply are written together after
//! the model call succeeds.

mod engine;
mod prompt;

pub use engine::{Answer, ConversationEngine, Question};
pub use prompt::{build_system_prompt, build_title, count_tokens};

use crate::{
    chat::ChatError, embedding::EmbeddingClientError, index::IndexError, store::StoreError,
};
use thiserror::Error;
use uuid::Uuid;

/// Reply used when retrieval finds no chunks for the document.
pub const NOT_READY_MESSAGE: &str = "I couldn't find any indexed content for this document yet. Please wait for processing to finish and try again.";

/// Number of chunks retrieved per question unless configured otherwise.
pub const DEFAULT_TOP_K: usize = 2;

/// Errors raised while answering a question.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The supplied conversation does not exist.
    #[error("conversation {0} not found")]
    NotFound(Uuid),
    /// The supplied conversation belongs to another tenant.
    #[error("conversation {0} does not belong to the caller")]
    Forbidden(Uuid),
    /// The conversation is bound to a different document.
    #[error("{0}")]
    Conflict(String),
    /// Relational store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// The question could not be embedded.
    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingClientError),
    /// Retrieval failed.
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    /// The chat model failed.
    #[error("chat error: {0}")]
    Chat(#[from] ChatError),
}
