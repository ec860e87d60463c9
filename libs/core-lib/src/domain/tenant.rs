use super::TenantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::StoreError;

// --- Tenant ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

// --- Tenant Context ---

/// The tenant a transaction acts for.
///
/// A context is bound to exactly one scope when it begins; every row read or
/// written through the protected tables in that scope is checked against it.
/// There is no ambient "current tenant": callers pass the context to
/// [`crate::TenantStore::begin`] or [`crate::with_tenant_context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantContext {
    tenant_id: TenantId,
}

impl TenantContext {
    pub fn new(tenant_id: TenantId) -> Self {
        Self { tenant_id }
    }

    /// Builds a context from the textual session value (`app.current_tenant_id`).
    pub fn parse(value: &str) -> Result<Self, StoreError> {
        TenantId::from_str(value).map(Self::new)
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    /// Value written to the session setting for this context.
    pub fn session_value(&self) -> String {
        self.tenant_id.to_string()
    }
}

impl From<TenantId> for TenantContext {
    fn from(tenant_id: TenantId) -> Self {
        Self::new(tenant_id)
    }
}

/// Row policy shared by every protected table: a row is visible only when a
/// tenant is bound and it matches the row's `tenant_id`. An unbound scope sees
/// nothing.
pub fn policy_admits(context: Option<&TenantContext>, row_tenant: TenantId) -> bool {
    context.is_some_and(|ctx| ctx.tenant_id == row_tenant)
}
