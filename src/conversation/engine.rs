use super::{EngineError, NOT_READY_MESSAGE, build_system_prompt, build_title, count_tokens};
use crate::{
    chat::{ChatClient, ChatRequest},
    embedding::EmbeddingClient,
    index::{ChunkScope, VectorIndex},
    metrics::CodeMetrics,
    store::{Conversation, NewMessage, Role, Store, StoreError, TenantId},
};
use std::sync::Arc;
use uuid::Uuid;

/// One question about one document.
#[derive(Debug, Clone)]
pub struct Question {
    /// Asking tenant.
    pub tenant_id: TenantId,
    /// Question text.
    pub text: String,
    /// Document the question is about.
    pub document_id: String,
    /// Conversation to continue, if the caller has one.
    pub conversation_id: Option<Uuid>,
}

/// Reply returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    /// Model reply, or [`NOT_READY_MESSAGE`].
    pub text: String,
    /// Conversation the exchange belongs to.
    pub conversation_id: Uuid,
    /// False when no indexed context was found and nothing was persisted.
    pub grounded: bool,
}

/// Resolves conversations, retrieves scoped context, and calls the chat model.
pub struct ConversationEngine {
    store: Arc<dyn Store>,
    embedder: Arc<dyn EmbeddingClient>,
    index: Arc<dyn VectorIndex>,
    chat: Arc<dyn ChatClient>,
    metrics: Arc<CodeMetrics>,
    top_k: usize,
}

impl ConversationEngine {
    /// Create an engine retrieving `top_k` chunks per question.
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Arc<dyn EmbeddingClient>,
        index: Arc<dyn VectorIndex>,
        chat: Arc<dyn ChatClient>,
        metrics: Arc<CodeMetrics>,
        top_k: usize,
    ) -> Self {
        Self {
            store,
            embedder,
            index,
            chat,
            metrics,
            top_k: top_k.max(1),
        }
    }

    /// Answer `question`, persisting the exchange when context was found.
    pub async fn ask(&self, question: Question) -> Result<Answer, EngineError> {
        let conversation = self.resolve_conversation(&question).await?;
        let conversation_id = conversation.id;

        let vector = self.embedder.embed(&question.text).await?;
        let scope = ChunkScope {
            tenant_id: question.tenant_id,
            document_id: question.document_id.clone(),
        };
        let hits = self.index.query(&vector, &scope, self.top_k).await?;

        if hits.is_empty() {
            tracing::info!(
                tenant_id = question.tenant_id,
                document_id = %question.document_id,
                conversation_id = %conversation_id,
                "No indexed context; answering not ready"
            );
            self.metrics.record_not_ready();
            return Ok(Answer {
                text: NOT_READY_MESSAGE.to_string(),
                conversation_id,
                grounded: false,
            });
        }

        let reply = self
            .chat
            .complete(ChatRequest {
                system: build_system_prompt(&hits),
                user: question.text.clone(),
            })
            .await?;

        let user_message = NewMessage {
            role: Role::User,
            token_count: Some(count_tokens(&question.text)),
            content: question.text,
            model_name: None,
        };
        let assistant_message = NewMessage {
            role: Role::Assistant,
            token_count: Some(count_tokens(&reply.text)),
            content: reply.text.clone(),
            model_name: Some(reply.model),
        };
        self.store
            .append_exchange(conversation_id, user_message, assistant_message)
            .await?;
        self.metrics.record_answer();

        tracing::info!(
            tenant_id = question.tenant_id,
            document_id = %question.document_id,
            conversation_id = %conversation_id,
            chunks = hits.len(),
            "Answered question"
        );
        Ok(Answer {
            text: reply.text,
            conversation_id,
            grounded: true,
        })
    }

    async fn resolve_conversation(&self, question: &Question) -> Result<Conversation, EngineError> {
        let Some(id) = question.conversation_id else {
            let title = build_title(&question.text);
            return Ok(self
                .store
                .find_or_create_conversation(question.tenant_id, &question.document_id, &title)
                .await?);
        };

        let conversation = self
            .store
            .get_conversation(id)
            .await?
            .ok_or(EngineError::NotFound(id))?;
        if conversation.tenant_id != question.tenant_id {
            return Err(EngineError::Forbidden(id));
        }
        if let Some(bound) = conversation.document_tag()
            && bound != question.document_id
        {
            return Err(EngineError::Conflict(
                "Conversation is tied to a different document".to_string(),
            ));
        }
        if conversation.title.is_some() && conversation.document_tag().is_some() {
            return Ok(conversation);
        }

        let title = conversation
            .title
            .clone()
            .unwrap_or_else(|| build_title(&question.text));
        match self
            .store
            .bind_conversation(id, &question.document_id, &title)
            .await
        {
            Ok(bound) => Ok(bound),
            Err(StoreError::Conflict(_)) => Err(EngineError::Conflict(
                "Another conversation is already tied to this document".to_string(),
            )),
            Err(err) => Err(err.into()),
        }
    }
}
