//! Filter helpers for scoped Qdrant queries.

use crate::index::ChunkScope;
use serde_json::{Value, json};

use super::payload::{DOCUMENT_ID_KEY, TENANT_ID_KEY};

/// Filter requiring both the tenant and the document tag to match.
///
/// The tenant id is matched as a string, the same representation the payload stores.
pub fn scope_filter(scope: &ChunkScope) -> Value {
    json!({
        "must": [
            {
                "key": TENANT_ID_KEY,
                "match": { "value": scope.tenant_id.to_string() }
            },
            {
                "key": DOCUMENT_ID_KEY,
                "match": { "value": scope.document_id }
            }
        ]
    })
}
