//! Relational persistence for tenants, documents, conversations, and messages.
//!
//! [`PgStore`] is the production implementation; [`MemoryStore`] mirrors its semantics,
//! including the one-conversation-per-(tenant, document) rule, for tests and local runs.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::storage::StorageLocator;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

/// Internal tenant identifier.
pub type TenantId = i64;

/// Metadata key under which a conversation's bound document id is stored.
pub const DOCUMENT_TAG_KEY: &str = "docId";

/// Errors raised by relational store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced row does not exist.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Kind of row.
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },
    /// A uniqueness rule rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),
    /// A persisted value could not be interpreted.
    #[error("corrupt row: {0}")]
    Corrupt(String),
    /// Database driver failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Embedded schema migrations failed to apply.
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Claims-derived profile used to create or refresh a tenant.
#[derive(Debug, Clone)]
pub struct TenantProfile {
    /// External subject identifier.
    pub external_id: String,
    /// Latest email from the token.
    pub email: Option<String>,
    /// Latest display name from the token.
    pub name: Option<String>,
}

/// Persisted tenant.
#[derive(Debug, Clone)]
pub struct Tenant {
    /// Internal id.
    pub id: TenantId,
    /// External subject identifier.
    pub external_id: String,
    /// Display email.
    pub email: Option<String>,
    /// Display name.
    pub name: Option<String>,
    /// First time the subject was seen.
    pub created_at: OffsetDateTime,
}

/// Document metadata written once per accepted upload.
#[derive(Debug, Clone)]
pub struct NewDocument {
    /// Document id (caller-supplied or generated).
    pub id: String,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Filename supplied by the client.
    pub original_name: String,
    /// Name the blob was stored under.
    pub stored_as: String,
    /// Blob location.
    pub locator: StorageLocator,
    /// Content type accepted at upload.
    pub mime_type: Option<String>,
    /// Size in bytes.
    pub size: i64,
}

/// Persisted document.
#[derive(Debug, Clone)]
pub struct DocumentRecord {
    /// Document id.
    pub id: String,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Filename supplied by the client.
    pub original_name: String,
    /// Name the blob was stored under.
    pub stored_as: String,
    /// Blob location.
    pub locator: StorageLocator,
    /// Content type accepted at upload.
    pub mime_type: Option<String>,
    /// Size in bytes.
    pub size: Option<i64>,
    /// Upload time.
    pub created_at: OffsetDateTime,
}

/// Persisted conversation.
#[derive(Debug, Clone)]
pub struct Conversation {
    /// Conversation id.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Title derived from the first question.
    pub title: Option<String>,
    /// Optional display name of the source PDF.
    pub source_pdf_name: Option<String>,
    /// Free-form metadata; the bound document id lives under [`DOCUMENT_TAG_KEY`].
    pub metadata: Option<Value>,
    /// Creation time.
    pub created_at: OffsetDateTime,
    /// Last activity.
    pub updated_at: OffsetDateTime,
}

impl Conversation {
    /// Document this conversation is bound to, if any.
    pub fn document_tag(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|metadata| metadata.get(DOCUMENT_TAG_KEY))
            .and_then(Value::as_str)
    }
}

/// Parameters for an explicitly created conversation.
#[derive(Debug, Clone, Default)]
pub struct NewConversation {
    /// Optional initial title; untitled conversations bind lazily on the first question.
    pub title: Option<String>,
    /// Optional display name of the source PDF.
    pub source_pdf_name: Option<String>,
}

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// End user question.
    User,
    /// Model reply.
    Assistant,
}

impl Role {
    /// Persisted name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub(crate) fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(StoreError::Corrupt(format!("unknown message role {other}"))),
        }
    }
}

/// Message to append.
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Author.
    pub role: Role,
    /// Text content.
    pub content: String,
    /// Model that produced the message.
    pub model_name: Option<String>,
    /// Token count of the content.
    pub token_count: Option<i32>,
}

/// Persisted message.
#[derive(Debug, Clone)]
pub struct Message {
    /// Message id (monotonic).
    pub id: i64,
    /// Owning conversation.
    pub conversation_id: Uuid,
    /// Author.
    pub role: Role,
    /// Text content.
    pub content: String,
    /// Model that produced the message.
    pub model_name: Option<String>,
    /// Token count of the content.
    pub token_count: Option<i32>,
    /// Creation time.
    pub created_at: OffsetDateTime,
}

/// Relational store used by the HTTP surface and the conversation engine.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert the tenant for `profile.external_id`, or refresh its email and name.
    async fn upsert_tenant(&self, profile: &TenantProfile) -> Result<Tenant, StoreError>;

    /// Record an accepted upload. Document ids are unique per tenant.
    async fn insert_document(&self, document: NewDocument) -> Result<DocumentRecord, StoreError>;

    /// Remove a tenant's document row, returning whether it existed.
    ///
    /// Releases the id of an upload that could not be stored or queued.
    async fn delete_document(&self, tenant_id: TenantId, id: &str) -> Result<bool, StoreError>;

    /// Tenant's documents, newest first.
    async fn list_documents(
        &self,
        tenant_id: TenantId,
        limit: i64,
    ) -> Result<Vec<DocumentRecord>, StoreError>;

    /// Look up a conversation by id regardless of owner.
    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError>;

    /// Tenant's conversations, most recently active first.
    async fn list_conversations(&self, tenant_id: TenantId)
    -> Result<Vec<Conversation>, StoreError>;

    /// Create an unbound conversation.
    async fn create_conversation(
        &self,
        tenant_id: TenantId,
        conversation: NewConversation,
    ) -> Result<Conversation, StoreError>;

    /// Return the tenant's conversation for `document_id`, creating it with `title` if absent.
    ///
    /// Concurrent callers for the same pair receive the same row.
    async fn find_or_create_conversation(
        &self,
        tenant_id: TenantId,
        document_id: &str,
        title: &str,
    ) -> Result<Conversation, StoreError>;

    /// Set the title and bind the document tag of an existing conversation.
    ///
    /// Fails with [`StoreError::Conflict`] when the tenant already has another conversation
    /// bound to `document_id`.
    async fn bind_conversation(
        &self,
        id: Uuid,
        document_id: &str,
        title: &str,
    ) -> Result<Conversation, StoreError>;

    /// Atomically append a question and its answer and touch the conversation.
    async fn append_exchange(
        &self,
        conversation_id: Uuid,
        question: NewMessage,
        answer: NewMessage,
    ) -> Result<(Message, Message), StoreError>;

    /// Messages of a conversation in creation order.
    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, StoreError>;
}
