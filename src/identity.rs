//! Maps verified identities onto internal tenants.

use crate::auth::AuthenticatedIdentity;
use crate::store::{Store, StoreError, Tenant, TenantProfile};
use std::sync::Arc;

/// Resolves an authenticated identity to its tenant, creating or refreshing the row.
///
/// Token claims are the source of truth: email and name are overwritten on every call. The write
/// is a single conflict-resolving upsert, so concurrent first requests for a subject converge on
/// one row.
#[derive(Clone)]
pub struct IdentityResolver {
    store: Arc<dyn Store>,
}

impl IdentityResolver {
    /// Create a resolver over the given store.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Return the tenant for `identity`.
    pub async fn resolve(&self, identity: &AuthenticatedIdentity) -> Result<Tenant, StoreError> {
        let profile = TenantProfile {
            external_id: identity.subject.clone(),
            email: identity.email.clone(),
            name: identity.name.clone(),
        };
        let tenant = self.store.upsert_tenant(&profile).await?;
        tracing::debug!(tenant_id = tenant.id, subject = %identity.subject, "Resolved tenant");
        Ok(tenant)
    }
}
