//! PostgreSQL-backed [`Store`].

use crate::config::StorageProviderKind;
use crate::storage::StorageLocator;
use crate::store::{
    Conversation, DocumentRecord, Message, NewConversation, NewDocument, NewMessage, Role, Store,
    StoreError, Tenant, TenantId, TenantProfile,
};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use uuid::Uuid;

const CONVERSATION_COLUMNS: &str =
    "id, user_id, title, source_pdf_name, metadata, created_at, updated_at";
const DOCUMENT_COLUMNS: &str = "id, user_id, original_name, stored_as, storage_provider, storage_key, mime_type, size, created_at";
const MESSAGE_COLUMNS: &str =
    "id, conversation_id, role, content, model_name, token_count, created_at";

/// Store backed by a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect a pool to `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool, shared with the job queue.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    fn parse_tenant(row: &PgRow) -> Result<Tenant, StoreError> {
        Ok(Tenant {
            id: row.try_get("id")?,
            external_id: row.try_get("external_id")?,
            email: row.try_get("email")?,
            name: row.try_get("name")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn parse_document(row: &PgRow) -> Result<DocumentRecord, StoreError> {
        let provider: String = row.try_get("storage_provider")?;
        let provider = provider
            .parse::<StorageProviderKind>()
            .map_err(|()| StoreError::Corrupt(format!("unknown storage provider {provider}")))?;
        Ok(DocumentRecord {
            id: row.try_get("id")?,
            tenant_id: row.try_get("user_id")?,
            original_name: row.try_get("original_name")?,
            stored_as: row.try_get("stored_as")?,
            locator: StorageLocator {
                provider,
                key: row.try_get("storage_key")?,
            },
            mime_type: row.try_get("mime_type")?,
            size: row.try_get("size")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn parse_conversation(row: &PgRow) -> Result<Conversation, StoreError> {
        Ok(Conversation {
            id: row.try_get("id")?,
            tenant_id: row.try_get("user_id")?,
            title: row.try_get("title")?,
            source_pdf_name: row.try_get("source_pdf_name")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn parse_message(row: &PgRow) -> Result<Message, StoreError> {
        let role: String = row.try_get("role")?;
        Ok(Message {
            id: row.try_get("id")?,
            conversation_id: row.try_get("conversation_id")?,
            role: Role::parse(&role)?,
            content: row.try_get("content")?,
            model_name: row.try_get("model_name")?,
            token_count: row.try_get("token_count")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_tenant(&self, profile: &TenantProfile) -> Result<Tenant, StoreError> {
        let row = sqlx::query(
            "INSERT INTO app_user (external_id, email, name)
             VALUES ($1, $2, $3)
             ON CONFLICT (external_id)
             DO UPDATE SET email = EXCLUDED.email, name = EXCLUDED.name
             RETURNING id, external_id, email, name, created_at",
        )
        .bind(&profile.external_id)
        .bind(&profile.email)
        .bind(&profile.name)
        .fetch_one(&self.pool)
        .await?;
        Self::parse_tenant(&row)
    }

    async fn insert_document(&self, document: NewDocument) -> Result<DocumentRecord, StoreError> {
        let query = format!(
            "INSERT INTO document_upload
                 (id, user_id, original_name, stored_as, storage_provider, storage_key, mime_type, size)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING {DOCUMENT_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(&document.id)
            .bind(document.tenant_id)
            .bind(&document.original_name)
            .bind(&document.stored_as)
            .bind(document.locator.provider.as_str())
            .bind(&document.locator.key)
            .bind(&document.mime_type)
            .bind(document.size)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    StoreError::Conflict(format!("document {} already exists", document.id))
                } else {
                    err.into()
                }
            })?;
        Self::parse_document(&row)
    }

    async fn delete_document(&self, tenant_id: TenantId, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM document_upload WHERE user_id = $1 AND id = $2")
            .bind(tenant_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_documents(
        &self,
        tenant_id: TenantId,
        limit: i64,
    ) -> Result<Vec<DocumentRecord>, StoreError> {
        let query = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM document_upload
             WHERE user_id = $1
             ORDER BY created_at DESC
             LIMIT $2"
        );
        let rows = sqlx::query(&query)
            .bind(tenant_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::parse_document).collect()
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        let query = format!("SELECT {CONVERSATION_COLUMNS} FROM conversation WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::parse_conversation).transpose()
    }

    async fn list_conversations(
        &self,
        tenant_id: TenantId,
    ) -> Result<Vec<Conversation>, StoreError> {
        let query = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversation
             WHERE user_id = $1
             ORDER BY updated_at DESC"
        );
        let rows = sqlx::query(&query)
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::parse_conversation).collect()
    }

    async fn create_conversation(
        &self,
        tenant_id: TenantId,
        conversation: NewConversation,
    ) -> Result<Conversation, StoreError> {
        let query = format!(
            "INSERT INTO conversation (id, user_id, title, source_pdf_name)
             VALUES ($1, $2, $3, $4)
             RETURNING {CONVERSATION_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(Uuid::new_v4())
            .bind(tenant_id)
            .bind(&conversation.title)
            .bind(&conversation.source_pdf_name)
            .fetch_one(&self.pool)
            .await?;
        Self::parse_conversation(&row)
    }

    async fn find_or_create_conversation(
        &self,
        tenant_id: TenantId,
        document_id: &str,
        title: &str,
    ) -> Result<Conversation, StoreError> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        let query = format!(
            "INSERT INTO conversation (id, user_id, title, metadata)
             VALUES ($1, $2, $3, jsonb_build_object('docId', $4::text))
             ON CONFLICT (user_id, document_tag) WHERE document_tag IS NOT NULL
             DO UPDATE SET user_id = EXCLUDED.user_id
             RETURNING {CONVERSATION_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(Uuid::new_v4())
            .bind(tenant_id)
            .bind(title)
            .bind(document_id)
            .fetch_one(&self.pool)
            .await?;
        Self::parse_conversation(&row)
    }

    async fn bind_conversation(
        &self,
        id: Uuid,
        document_id: &str,
        title: &str,
    ) -> Result<Conversation, StoreError> {
        let query = format!(
            "UPDATE conversation
             SET title = $2,
                 updated_at = now(),
                 metadata = jsonb_set(coalesce(metadata, '{{}}'::jsonb), '{{docId}}', to_jsonb($3::text), true)
             WHERE id = $1
             RETURNING {CONVERSATION_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(title)
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    StoreError::Conflict(format!(
                        "another conversation is already bound to document {document_id}"
                    ))
                } else {
                    err.into()
                }
            })?;
        match row {
            Some(row) => Self::parse_conversation(&row),
            None => Err(StoreError::NotFound {
                entity: "conversation",
                id: id.to_string(),
            }),
        }
    }

    async fn append_exchange(
        &self,
        conversation_id: Uuid,
        question: NewMessage,
        answer: NewMessage,
    ) -> Result<(Message, Message), StoreError> {
        let mut tx = self.pool.begin().await?;

        let touched = sqlx::query("UPDATE conversation SET updated_at = now() WHERE id = $1")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        if touched.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "conversation",
                id: conversation_id.to_string(),
            });
        }

        let insert = format!(
            "INSERT INTO message (conversation_id, role, content, model_name, token_count)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {MESSAGE_COLUMNS}"
        );
        let mut stored = Vec::with_capacity(2);
        for message in [question, answer] {
            let row = sqlx::query(&insert)
                .bind(conversation_id)
                .bind(message.role.as_str())
                .bind(&message.content)
                .bind(&message.model_name)
                .bind(message.token_count)
                .fetch_one(&mut *tx)
                .await?;
            stored.push(Self::parse_message(&row)?);
        }

        tx.commit().await?;

        let answer = stored.pop();
        let question = stored.pop();
        match (question, answer) {
            (Some(question), Some(answer)) => Ok((question, answer)),
            _ => Err(StoreError::Corrupt("exchange insert returned no rows".into())),
        }
    }

    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, StoreError> {
        let query = format!(
            "SELECT {MESSAGE_COLUMNS} FROM message
             WHERE conversation_id = $1
             ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query(&query)
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::parse_message).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn live_store() -> PgStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL for live tests");
        let store = PgStore::connect(&url).await.expect("connect");
        store.migrate().await.expect("migrate");
        store
    }

    fn profile(external_id: &str, email: &str) -> TenantProfile {
        TenantProfile {
            external_id: external_id.into(),
            email: Some(email.into()),
            name: None,
        }
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL via DATABASE_URL"]
    async fn upsert_keeps_one_row_with_latest_email() {
        let store = live_store().await;
        let subject = format!("user_{}", Uuid::new_v4());

        let first = store
            .upsert_tenant(&profile(&subject, "old@example.test"))
            .await
            .expect("insert");
        let second = store
            .upsert_tenant(&profile(&subject, "new@example.test"))
            .await
            .expect("update");

        assert_eq!(first.id, second.id);
        assert_eq!(second.email.as_deref(), Some("new@example.test"));
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL via DATABASE_URL"]
    async fn concurrent_find_or_create_returns_one_conversation() {
        let store = live_store().await;
        let tenant = store
            .upsert_tenant(&profile(&format!("user_{}", Uuid::new_v4()), "a@example.test"))
            .await
            .expect("tenant");

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.spawn(async move {
                store
                    .find_or_create_conversation(tenant.id, "doc-race.pdf", "Race")
                    .await
                    .expect("conversation")
                    .id
            });
        }
        let mut ids = Vec::new();
        while let Some(id) = tasks.join_next().await {
            ids.push(id.expect("task"));
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 1);
    }
}
