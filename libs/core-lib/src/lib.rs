use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::error::Error as StdError;
use tracing::{debug, warn};

// Declare modules
pub mod adapters;
pub mod config;
pub mod domain;
pub mod ingest;
pub mod schema;
pub mod telemetry;

use domain::{
    Contact, ContactId, ContactIdentifier, IdentifierType, Integration, IntegrationId,
    IntegrationStatus, NewContact, NewContactIdentifier, NewIntegration, NewUser, Tenant,
    TenantContext, TenantId, User, UserId,
};

// Common error type for the store. Isolation never produces an error of its own:
// rows of other tenants are simply absent.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },
    #[error("Foreign key violated: {0}")]
    ForeignKeyViolation(String),
    #[error("Required field missing: {0}")]
    NotNullViolation(String),
    #[error("Tenant context required to write to {0}")]
    TenantContextRequired(&'static str),
    #[error("Invalid tenant id: {0}")]
    InvalidTenantId(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Infrastructure error: {0}")]
    Infrastructure(#[from] Box<dyn StdError + Send + Sync>),
}

impl StoreError {
    pub fn unique(constraint: &str) -> Self {
        StoreError::UniqueViolation {
            constraint: constraint.to_string(),
        }
    }

    /// True for the integrity failures a caller can act on (as opposed to
    /// connectivity or configuration problems).
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            StoreError::UniqueViolation { .. }
                | StoreError::ForeignKeyViolation(_)
                | StoreError::NotNullViolation(_)
        )
    }
}

// Port for the tables that are not tenant-protected, and the entry point for
// tenant-scoped transactions.
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn create_tenant(&self, name: &str) -> Result<Tenant, StoreError>;

    async fn get_tenant(&self, id: TenantId) -> Result<Option<Tenant>, StoreError>;

    async fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError>;

    /// Delete a tenant and, by cascade, every row it owns.
    async fn delete_tenant(&self, id: TenantId) -> Result<bool, StoreError>;

    /// Open a transaction bound to `context`. With `None` the binding is
    /// explicitly cleared, so the scope sees no protected rows at all.
    async fn begin(
        &self,
        context: Option<TenantContext>,
    ) -> Result<Box<dyn TenantScope>, StoreError>;
}

// Port for one transaction over the protected tables.
//
// Reads only return rows of the bound tenant. Inserts stamp the bound tenant
// (children take it from their parent), updates and deletes silently skip rows
// that are not visible. Dropping a scope without `commit` discards its writes.
#[async_trait]
pub trait TenantScope: Send {
    fn context(&self) -> Option<&TenantContext>;

    // Users
    async fn insert_user(&mut self, user: NewUser) -> Result<User, StoreError>;
    async fn get_user(&mut self, id: UserId) -> Result<Option<User>, StoreError>;
    async fn find_user_by_email(&mut self, email: &str) -> Result<Option<User>, StoreError>;
    async fn list_users(&mut self) -> Result<Vec<User>, StoreError>;
    /// Delete a user and its integrations.
    async fn delete_user(&mut self, id: UserId) -> Result<bool, StoreError>;

    // Integrations
    async fn insert_integration(
        &mut self,
        integration: NewIntegration,
    ) -> Result<Integration, StoreError>;
    async fn get_integration(
        &mut self,
        id: IntegrationId,
    ) -> Result<Option<Integration>, StoreError>;
    async fn list_integrations(&mut self) -> Result<Vec<Integration>, StoreError>;
    async fn list_integrations_for_user(
        &mut self,
        user_id: UserId,
    ) -> Result<Vec<Integration>, StoreError>;
    async fn update_integration_status(
        &mut self,
        id: IntegrationId,
        status: IntegrationStatus,
    ) -> Result<Option<Integration>, StoreError>;
    async fn update_contacts_sync_token(
        &mut self,
        id: IntegrationId,
        sync_token: Option<String>,
    ) -> Result<Option<Integration>, StoreError>;

    // Contacts
    async fn insert_contact(&mut self, contact: NewContact) -> Result<Contact, StoreError>;
    async fn get_contact(&mut self, id: ContactId) -> Result<Option<Contact>, StoreError>;
    async fn list_contacts(&mut self) -> Result<Vec<Contact>, StoreError>;
    /// Delete a contact and its identifiers.
    async fn delete_contact(&mut self, id: ContactId) -> Result<bool, StoreError>;

    // Contact identifiers
    async fn insert_contact_identifier(
        &mut self,
        identifier: NewContactIdentifier,
    ) -> Result<ContactIdentifier, StoreError>;
    async fn list_contact_identifiers(
        &mut self,
        contact_id: ContactId,
    ) -> Result<Vec<ContactIdentifier>, StoreError>;
    async fn find_contact_by_identifier(
        &mut self,
        identifier_type: &IdentifierType,
        identifier_value: &str,
    ) -> Result<Option<Contact>, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Run `body` in a transaction bound to `context`.
///
/// The scope is committed when `body` returns `Ok` and rolled back when it
/// returns `Err`. The tenant binding lives only as long as the transaction, so
/// it cannot leak into later work on the same connection even if the future is
/// dropped half way.
///
/// ```ignore
/// let contact = with_tenant_context(&store, ctx, |scope| {
///     Box::pin(async move { scope.insert_contact(NewContact::named("Ada")).await })
/// })
/// .await?;
/// ```
pub async fn with_tenant_context<S, T, F>(
    store: &S,
    context: TenantContext,
    body: F,
) -> Result<T, StoreError>
where
    S: TenantStore + ?Sized,
    T: Send,
    F: for<'s> FnOnce(&'s mut dyn TenantScope) -> BoxFuture<'s, Result<T, StoreError>> + Send,
{
    let mut scope = store.begin(Some(context)).await?;
    match body(&mut *scope).await {
        Ok(value) => {
            scope.commit().await?;
            debug!(tenant_id = %context.tenant_id(), "tenant scope committed");
            Ok(value)
        }
        Err(err) => {
            if err.is_constraint_violation() {
                debug!(tenant_id = %context.tenant_id(), "tenant scope rejected: {}", err);
            } else {
                warn!(tenant_id = %context.tenant_id(), "tenant scope failed: {}", err);
            }
            if let Err(rollback_err) = scope.rollback().await {
                warn!(
                    tenant_id = %context.tenant_id(),
                    "rollback after failed tenant scope also failed: {}", rollback_err
                );
            }
            Err(err)
        }
    }
}
