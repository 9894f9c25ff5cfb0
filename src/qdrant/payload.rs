//! The flat payload schema written with every point and read back on retrieval.

use crate::index::{ChunkHit, ChunkTags, IndexedChunk};
use serde_json::{Map, Value, json};
use time::OffsetDateTime;

pub(crate) const TEXT_KEY: &str = "text";
pub(crate) const TENANT_ID_KEY: &str = "tenant_id";
pub(crate) const DOCUMENT_ID_KEY: &str = "document_id";

/// Payload fields that get keyword indexes.
pub(crate) const KEYWORD_FIELDS: [&str; 2] = [TENANT_ID_KEY, DOCUMENT_ID_KEY];

/// Build the payload object stored alongside each indexed chunk.
pub(crate) fn build_payload(chunk: &IndexedChunk, indexed_at: &str) -> Value {
    json!({
        TEXT_KEY: chunk.text,
        TENANT_ID_KEY: chunk.tags.tenant_id.to_string(),
        DOCUMENT_ID_KEY: chunk.tags.document_id,
        "original_name": chunk.tags.original_name,
        "size": chunk.tags.size,
        "page": chunk.tags.page,
        "chunk_index": chunk.tags.chunk_index,
        "indexed_at": indexed_at,
    })
}

/// Read a retrieved payload back into a hit. Points missing identity tags are dropped.
pub(crate) fn parse_hit(payload: &Map<String, Value>, score: f32) -> Option<ChunkHit> {
    let text = payload.get(TEXT_KEY)?.as_str()?.to_string();
    let tenant_id = payload.get(TENANT_ID_KEY)?.as_str()?.parse().ok()?;
    let document_id = payload.get(DOCUMENT_ID_KEY)?.as_str()?.to_string();
    let number = |key: &str| payload.get(key).and_then(Value::as_u64).unwrap_or(0) as u32;

    Some(ChunkHit {
        text,
        score,
        tags: ChunkTags {
            tenant_id,
            document_id,
            original_name: payload
                .get("original_name")
                .and_then(Value::as_str)
                .map(str::to_string),
            size: payload.get("size").and_then(Value::as_i64),
            page: number("page"),
            chunk_index: number("chunk_index"),
        },
    })
}

/// Current timestamp formatted for payload storage.
pub(crate) fn current_timestamp_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
