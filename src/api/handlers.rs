//! REST handlers. Every handler except [`health`] runs behind [`super::middleware::require_tenant`].

use super::{AppState, error::ApiError};
use crate::{
    conversation::Question,
    metrics::ChatSnapshot,
    queue::IngestJob,
    storage::{StorageLocator, blob_key},
    store::{
        Conversation, DocumentRecord, Message, NewConversation, NewDocument, Tenant, TenantId,
    },
};
use axum::{
    Extension, Json,
    extract::{
        Multipart, Path, State,
        rejection::{JsonRejection, PathRejection},
    },
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use uuid::Uuid;

const PDF_FIELD: &str = "pdf";
const DOCUMENT_ID_FIELD: &str = "documentId";
const PDF_CONTENT_TYPE: &str = "application/pdf";
const PDF_MAGIC: &[u8] = b"%PDF-";
const MAX_DOCUMENT_ID_LEN: usize = 200;

fn rfc3339(at: OffsetDateTime) -> String {
    at.format(&Rfc3339)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

/// Liveness probe.
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Response body for `POST /upload`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    document_id: String,
    original_name: String,
    locator: StorageLocator,
    size: i64,
    job_id: Uuid,
}

struct UploadedFile {
    original_name: String,
    bytes: Vec<u8>,
}

/// Store an uploaded PDF, record it, and enqueue its ingestion.
///
/// Success means the file is durable and the job is queued; indexing completes later.
pub async fn upload(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut file: Option<UploadedFile> = None;
    let mut requested_id: Option<String> = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some(PDF_FIELD) => {
                if field.content_type() != Some(PDF_CONTENT_TYPE) {
                    return Err(ApiError::BadRequest("Only PDF files are accepted".into()));
                }
                let original_name = field.file_name().unwrap_or("document.pdf").to_string();
                let bytes = field.bytes().await?;
                file = Some(UploadedFile {
                    original_name,
                    bytes: bytes.to_vec(),
                });
            }
            Some(DOCUMENT_ID_FIELD) => {
                let value = field.text().await?;
                let value = value.trim();
                if !value.is_empty() {
                    requested_id = Some(value.to_string());
                }
            }
            _ => {}
        }
    }

    let Some(UploadedFile {
        original_name,
        bytes,
    }) = file
    else {
        return Err(ApiError::BadRequest("No file uploaded".into()));
    };
    if bytes.is_empty() {
        return Err(ApiError::BadRequest("Uploaded file is empty".into()));
    }
    if bytes.len() > state.limits.upload_max_bytes {
        return Err(ApiError::BadRequest("File too large".into()));
    }
    if !bytes.starts_with(PDF_MAGIC) {
        return Err(ApiError::BadRequest("Uploaded file is not a PDF".into()));
    }

    let document_id = match requested_id {
        Some(id) => validate_document_id(id)?,
        None => generate_document_id(),
    };
    let size = i64::try_from(bytes.len()).unwrap_or(i64::MAX);
    let key = blob_key(tenant.id, &document_id);
    let locator = StorageLocator {
        provider: state.blobs.provider(),
        key: key.clone(),
    };

    // The row claims the id first, so a rejected duplicate never touches the stored blob.
    state
        .store
        .insert_document(NewDocument {
            id: document_id.clone(),
            tenant_id: tenant.id,
            original_name: original_name.clone(),
            stored_as: key.clone(),
            locator: locator.clone(),
            mime_type: Some(PDF_CONTENT_TYPE.to_string()),
            size,
        })
        .await?;

    if let Err(err) = state.blobs.put(&key, bytes, PDF_CONTENT_TYPE).await {
        release_document(&state, tenant.id, &document_id).await;
        return Err(err.into());
    }
    let enqueued = state
        .queue
        .enqueue(&IngestJob {
            tenant_id: tenant.id,
            document_id: document_id.clone(),
            locator: locator.clone(),
            original_name: original_name.clone(),
            size,
            content_type: PDF_CONTENT_TYPE.to_string(),
        })
        .await;
    let job_id = match enqueued {
        Ok(job_id) => job_id,
        Err(err) => {
            release_document(&state, tenant.id, &document_id).await;
            return Err(err.into());
        }
    };

    tracing::info!(
        tenant_id = tenant.id,
        document_id = %document_id,
        job_id = %job_id,
        size,
        "Upload accepted"
    );
    Ok(Json(UploadResponse {
        document_id,
        original_name,
        locator,
        size,
        job_id,
    }))
}

/// Drop the row of an upload that failed after it was recorded, so the caller can retry the id.
async fn release_document(state: &AppState, tenant_id: TenantId, document_id: &str) {
    if let Err(err) = state.store.delete_document(tenant_id, document_id).await {
        tracing::error!(
            tenant_id,
            document_id = %document_id,
            error = %err,
            "Failed to release document after an incomplete upload"
        );
    }
}

fn generate_document_id() -> String {
    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    format!("pdf-{millis}-{}.pdf", Uuid::new_v4().simple())
}

/// Caller-supplied ids become part of the blob key, so only a conservative alphabet is accepted.
fn validate_document_id(id: String) -> Result<String, ApiError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_DOCUMENT_ID_LEN
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(id)
    } else {
        Err(ApiError::BadRequest("Invalid documentId".into()))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentView {
    id: String,
    original_name: String,
    stored_as: String,
    size: Option<i64>,
    mime_type: Option<String>,
    created_at: String,
}

impl From<DocumentRecord> for DocumentView {
    fn from(record: DocumentRecord) -> Self {
        Self {
            id: record.id,
            original_name: record.original_name,
            stored_as: record.stored_as,
            size: record.size,
            mime_type: record.mime_type,
            created_at: rfc3339(record.created_at),
        }
    }
}

/// Caller's documents, newest first.
pub async fn list_documents(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
) -> Result<Json<Value>, ApiError> {
    let documents: Vec<DocumentView> = state
        .store
        .list_documents(tenant.id, state.limits.documents_page_size)
        .await?
        .into_iter()
        .map(DocumentView::from)
        .collect();
    Ok(Json(json!({ "documents": documents })))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConversationView {
    id: Uuid,
    title: Option<String>,
    updated_at: String,
    doc_id: Option<String>,
}

impl From<Conversation> for ConversationView {
    fn from(conversation: Conversation) -> Self {
        Self {
            doc_id: conversation.document_tag().map(str::to_string),
            id: conversation.id,
            title: conversation.title,
            updated_at: rfc3339(conversation.updated_at),
        }
    }
}

/// Caller's conversations, most recently active first.
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
) -> Result<Json<Value>, ApiError> {
    let conversations: Vec<ConversationView> = state
        .store
        .list_conversations(tenant.id)
        .await?
        .into_iter()
        .map(ConversationView::from)
        .collect();
    Ok(Json(json!({ "conversations": conversations })))
}

/// Request body for `POST /conversations`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    source_pdf_name: Option<String>,
}

/// Create an unbound conversation; the first question binds it to a document.
pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    body: Option<Json<CreateConversationRequest>>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let conversation = state
        .store
        .create_conversation(
            tenant.id,
            NewConversation {
                title: request.title.filter(|title| !title.trim().is_empty()),
                source_pdf_name: request.source_pdf_name,
            },
        )
        .await?;
    tracing::info!(tenant_id = tenant.id, conversation_id = %conversation.id, "Conversation created");
    Ok((
        StatusCode::CREATED,
        Json(json!({ "conversation": ConversationView::from(conversation) })),
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageView {
    id: i64,
    role: &'static str,
    content: String,
    created_at: String,
}

impl From<Message> for MessageView {
    fn from(message: Message) -> Self {
        Self {
            id: message.id,
            role: message.role.as_str(),
            content: message.content,
            created_at: rfc3339(message.created_at),
        }
    }
}

/// Ordered messages of a conversation the caller owns.
pub async fn list_messages(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    conversation_id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<Value>, ApiError> {
    let Path(conversation_id) = conversation_id?;
    let conversation = state
        .store
        .get_conversation(conversation_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Conversation not found".into()))?;
    if conversation.tenant_id != tenant.id {
        return Err(ApiError::Forbidden("Forbidden".into()));
    }
    let messages: Vec<MessageView> = state
        .store
        .list_messages(conversation_id)
        .await?
        .into_iter()
        .map(MessageView::from)
        .collect();
    Ok(Json(json!({ "messages": messages })))
}

/// Request body for `POST /chat`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequestBody {
    #[serde(default)]
    question: Option<String>,
    #[serde(default, alias = "docId")]
    document_id: Option<String>,
    #[serde(default)]
    conversation_id: Option<Uuid>,
}

/// Response body for `POST /chat`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponseBody {
    answer: String,
    conversation_id: Uuid,
}

/// Answer a question about one of the caller's documents.
pub async fn chat(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    body: Result<Json<ChatRequestBody>, JsonRejection>,
) -> Result<Json<ChatResponseBody>, ApiError> {
    let Json(body) = body?;
    let question = body
        .question
        .filter(|question| !question.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing question".into()))?;
    let document_id = body
        .document_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing documentId".into()))?;

    let answer = state
        .engine
        .ask(Question {
            tenant_id: tenant.id,
            text: question,
            document_id,
            conversation_id: body.conversation_id,
        })
        .await?;
    Ok(Json(ChatResponseBody {
        answer: answer.text,
        conversation_id: answer.conversation_id,
    }))
}

/// Chat counters of this server. Ingestion counters are logged by the worker.
pub async fn metrics(State(state): State<AppState>) -> Json<ChatSnapshot> {
    Json(state.metrics.chat_snapshot())
}
