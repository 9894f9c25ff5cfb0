//! In-process [`Store`] with the same semantics as the PostgreSQL schema.

use crate::store::{
    Conversation, DOCUMENT_TAG_KEY, DocumentRecord, Message, NewConversation, NewDocument,
    NewMessage, Store, StoreError, Tenant, TenantId, TenantProfile,
};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct State {
    tenants: Vec<Tenant>,
    documents: Vec<DocumentRecord>,
    conversations: HashMap<Uuid, Conversation>,
    messages: Vec<Message>,
    next_message_id: i64,
}

impl State {
    fn bound_conversation(&self, tenant_id: TenantId, document_id: &str) -> Option<&Conversation> {
        self.conversations.values().find(|conversation| {
            conversation.tenant_id == tenant_id
                && conversation.document_tag() == Some(document_id)
        })
    }
}

/// Store held entirely in memory behind one async mutex.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tenant rows, for assertions.
    pub async fn tenant_count(&self) -> usize {
        self.state.lock().await.tenants.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_tenant(&self, profile: &TenantProfile) -> Result<Tenant, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(tenant) = state
            .tenants
            .iter_mut()
            .find(|tenant| tenant.external_id == profile.external_id)
        {
            tenant.email = profile.email.clone();
            tenant.name = profile.name.clone();
            return Ok(tenant.clone());
        }

        let tenant = Tenant {
            id: state.tenants.len() as TenantId + 1,
            external_id: profile.external_id.clone(),
            email: profile.email.clone(),
            name: profile.name.clone(),
            created_at: OffsetDateTime::now_utc(),
        };
        state.tenants.push(tenant.clone());
        Ok(tenant)
    }

    async fn insert_document(&self, document: NewDocument) -> Result<DocumentRecord, StoreError> {
        let mut state = self.state.lock().await;
        if state
            .documents
            .iter()
            .any(|existing| existing.tenant_id == document.tenant_id && existing.id == document.id)
        {
            return Err(StoreError::Conflict(format!(
                "document {} already exists",
                document.id
            )));
        }
        let record = DocumentRecord {
            id: document.id,
            tenant_id: document.tenant_id,
            original_name: document.original_name,
            stored_as: document.stored_as,
            locator: document.locator,
            mime_type: document.mime_type,
            size: Some(document.size),
            created_at: OffsetDateTime::now_utc(),
        };
        state.documents.push(record.clone());
        Ok(record)
    }

    async fn delete_document(&self, tenant_id: TenantId, id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.documents.len();
        state
            .documents
            .retain(|document| !(document.tenant_id == tenant_id && document.id == id));
        Ok(state.documents.len() != before)
    }

    async fn list_documents(
        &self,
        tenant_id: TenantId,
        limit: i64,
    ) -> Result<Vec<DocumentRecord>, StoreError> {
        let state = self.state.lock().await;
        // Insertion order breaks timestamp ties, newest last.
        Ok(state
            .documents
            .iter()
            .rev()
            .filter(|document| document.tenant_id == tenant_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        Ok(self.state.lock().await.conversations.get(&id).cloned())
    }

    async fn list_conversations(
        &self,
        tenant_id: TenantId,
    ) -> Result<Vec<Conversation>, StoreError> {
        let state = self.state.lock().await;
        let mut conversations: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|conversation| conversation.tenant_id == tenant_id)
            .cloned()
            .collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    async fn create_conversation(
        &self,
        tenant_id: TenantId,
        conversation: NewConversation,
    ) -> Result<Conversation, StoreError> {
        let now = OffsetDateTime::now_utc();
        let created = Conversation {
            id: Uuid::new_v4(),
            tenant_id,
            title: conversation.title,
            source_pdf_name: conversation.source_pdf_name,
            metadata: None,
            created_at: now,
            updated_at: now,
        };
        self.state
            .lock()
            .await
            .conversations
            .insert(created.id, created.clone());
        Ok(created)
    }

    async fn find_or_create_conversation(
        &self,
        tenant_id: TenantId,
        document_id: &str,
        title: &str,
    ) -> Result<Conversation, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.bound_conversation(tenant_id, document_id) {
            return Ok(existing.clone());
        }

        let now = OffsetDateTime::now_utc();
        let mut metadata = Map::new();
        metadata.insert(DOCUMENT_TAG_KEY.into(), Value::String(document_id.into()));
        let created = Conversation {
            id: Uuid::new_v4(),
            tenant_id,
            title: Some(title.to_string()),
            source_pdf_name: None,
            metadata: Some(Value::Object(metadata)),
            created_at: now,
            updated_at: now,
        };
        state.conversations.insert(created.id, created.clone());
        Ok(created)
    }

    async fn bind_conversation(
        &self,
        id: Uuid,
        document_id: &str,
        title: &str,
    ) -> Result<Conversation, StoreError> {
        let mut state = self.state.lock().await;
        let tenant_id = state
            .conversations
            .get(&id)
            .map(|conversation| conversation.tenant_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "conversation",
                id: id.to_string(),
            })?;
        if let Some(other) = state.bound_conversation(tenant_id, document_id)
            && other.id != id
        {
            return Err(StoreError::Conflict(format!(
                "another conversation is already bound to document {document_id}"
            )));
        }

        let conversation = state
            .conversations
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "conversation",
                id: id.to_string(),
            })?;
        let mut metadata = match conversation.metadata.take() {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        metadata.insert(DOCUMENT_TAG_KEY.into(), Value::String(document_id.into()));
        conversation.metadata = Some(Value::Object(metadata));
        conversation.title = Some(title.to_string());
        conversation.updated_at = OffsetDateTime::now_utc();
        Ok(conversation.clone())
    }

    async fn append_exchange(
        &self,
        conversation_id: Uuid,
        question: NewMessage,
        answer: NewMessage,
    ) -> Result<(Message, Message), StoreError> {
        let mut state = self.state.lock().await;
        let now = OffsetDateTime::now_utc();
        let conversation =
            state
                .conversations
                .get_mut(&conversation_id)
                .ok_or_else(|| StoreError::NotFound {
                    entity: "conversation",
                    id: conversation_id.to_string(),
                })?;
        conversation.updated_at = now;

        let mut stored = [question, answer].map(|message| Message {
            id: 0,
            conversation_id,
            role: message.role,
            content: message.content,
            model_name: message.model_name,
            token_count: message.token_count,
            created_at: now,
        });
        for message in &mut stored {
            state.next_message_id += 1;
            message.id = state.next_message_id;
            state.messages.push(message.clone());
        }
        let [question, answer] = stored;
        Ok((question, answer))
    }

    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .messages
            .iter()
            .filter(|message| message.conversation_id == conversation_id)
            .cloned()
            .collect())
    }
}
