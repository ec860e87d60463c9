use crate::config::StoreConfig;
use crate::domain::{
    Contact, ContactId, ContactIdentifier, IdentifierType, Integration, IntegrationId,
    IntegrationStatus, NewContact, NewContactIdentifier, NewIntegration, NewUser, Tenant,
    TenantContext, TenantId, User, UserId, optional, required,
};
use crate::{StoreError, TenantScope, TenantStore, schema};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgDatabaseError, PgPoolOptions};
use sqlx::{Acquire, PgPool, Postgres, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const USER_COLUMNS: &str = "id, tenant_id, email, full_name, created_at";
const INTEGRATION_COLUMNS: &str = "id, user_id, tenant_id, provider, encrypted_refresh_token, \
     contacts_sync_token, status, created_at, updated_at";
const CONTACT_COLUMNS: &str = "id, tenant_id, canonical_name, created_at";
const IDENTIFIER_COLUMNS: &str =
    "id, contact_id, tenant_id, identifier_type, identifier_value, created_at";

/// Translate driver errors, keeping integrity failures distinguishable from
/// connectivity problems.
fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        let constraint = db_err.constraint().unwrap_or_default().to_string();
        match db_err.code().as_deref() {
            Some("23505") => return StoreError::UniqueViolation { constraint },
            Some("23503") => return StoreError::ForeignKeyViolation(constraint),
            Some("23502") => {
                let column = db_err
                    .try_downcast_ref::<PgDatabaseError>()
                    .map(|pg| match (pg.table(), pg.column()) {
                        (Some(table), Some(column)) => format!("{table}.{column}"),
                        _ => pg.message().to_string(),
                    })
                    .unwrap_or_else(|| db_err.message().to_string());
                return StoreError::NotNullViolation(column);
            }
            _ => {}
        }
    }
    StoreError::Infrastructure(Box::new(err))
}

// --- Row mappings ---

#[derive(sqlx::FromRow, Debug)]
struct TenantRow {
    id: Uuid,
    name: String,
    created_at: DateTime<Utc>,
}

impl From<TenantRow> for Tenant {
    fn from(row: TenantRow) -> Self {
        Tenant {
            id: row.id.into(),
            name: row.name,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow, Debug)]
struct UserRow {
    id: Uuid,
    tenant_id: Uuid,
    email: String,
    full_name: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id.into(),
            tenant_id: row.tenant_id.into(),
            email: row.email,
            full_name: row.full_name,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow, Debug)]
struct IntegrationRow {
    id: Uuid,
    user_id: Uuid,
    tenant_id: Uuid,
    provider: String,
    encrypted_refresh_token: Option<Vec<u8>>,
    contacts_sync_token: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<IntegrationRow> for Integration {
    fn from(row: IntegrationRow) -> Self {
        Integration {
            id: row.id.into(),
            user_id: row.user_id.into(),
            tenant_id: row.tenant_id.into(),
            provider: row.provider.into(),
            encrypted_refresh_token: row.encrypted_refresh_token,
            contacts_sync_token: row.contacts_sync_token,
            status: row.status.into(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow, Debug)]
struct ContactRow {
    id: Uuid,
    tenant_id: Uuid,
    canonical_name: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<ContactRow> for Contact {
    fn from(row: ContactRow) -> Self {
        Contact {
            id: row.id.into(),
            tenant_id: row.tenant_id.into(),
            canonical_name: row.canonical_name,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow, Debug)]
struct IdentifierRow {
    id: Uuid,
    contact_id: Uuid,
    tenant_id: Uuid,
    identifier_type: String,
    identifier_value: String,
    created_at: DateTime<Utc>,
}

impl From<IdentifierRow> for ContactIdentifier {
    fn from(row: IdentifierRow) -> Self {
        ContactIdentifier {
            id: row.id.into(),
            contact_id: row.contact_id.into(),
            tenant_id: row.tenant_id.into(),
            identifier_type: row.identifier_type.into(),
            identifier_value: row.identifier_value,
            created_at: row.created_at,
        }
    }
}

// --- Store ---

/// PostgreSQL implementation of the TenantStore port.
///
/// Isolation is enforced by the database through row-level security. The pool
/// must therefore log in as a role that is neither a superuser nor holds
/// BYPASSRLS; [`PostgresTenantStore::verify_schema`] warns when it does.
#[derive(Debug, Clone)]
pub struct PostgresTenantStore {
    pool: PgPool,
}

impl PostgresTenantStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(map_sqlx_error)?;
        info!(
            max_connections = config.max_connections,
            "Connected to PostgreSQL tenant store"
        );
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded migrations. Needs a role allowed to create tables
    /// and policies, usually not the one the application queries with.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        info!("Applying database migrations...");
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Infrastructure(Box::new(e)))?;
        info!("Migrations applied successfully.");
        Ok(())
    }

    /// Check that every protected table exists with forced row-level
    /// security, and warn when the connected role would bypass it.
    pub async fn verify_schema(&self) -> Result<(), StoreError> {
        let tables: Vec<(String, bool, bool)> = sqlx::query_as(
            "SELECT relname::text, relrowsecurity, relforcerowsecurity FROM pg_class \
             WHERE relkind = 'r' AND relnamespace = 'public'::regnamespace AND relname = ANY($1)",
        )
        .bind(&schema::PROTECTED_TABLES[..])
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        for table in schema::PROTECTED_TABLES {
            match tables.iter().find(|(name, _, _)| name == table) {
                None => {
                    return Err(StoreError::Configuration(format!(
                        "protected table {table} is missing"
                    )));
                }
                Some((_, enabled, forced)) if !(*enabled && *forced) => {
                    return Err(StoreError::Configuration(format!(
                        "row-level security is not enabled and forced on {table}"
                    )));
                }
                Some(_) => {}
            }
        }

        let (is_superuser, bypasses_rls): (bool, bool) = sqlx::query_as(
            "SELECT rolsuper, rolbypassrls FROM pg_roles WHERE rolname = current_user",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        if is_superuser || bypasses_rls {
            warn!(
                is_superuser,
                bypasses_rls, "Connected role bypasses row-level security; tenant isolation is NOT enforced"
            );
        } else {
            info!("Schema verification successful - row-level security active on all protected tables");
        }
        Ok(())
    }
}

#[async_trait]
impl TenantStore for PostgresTenantStore {
    async fn create_tenant(&self, name: &str) -> Result<Tenant, StoreError> {
        let name = required("tenants.name", name)?;
        let row: TenantRow = sqlx::query_as(
            "INSERT INTO tenants (name) VALUES ($1) RETURNING id, name, created_at",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        info!(tenant_id = %row.id, "tenant created");
        Ok(row.into())
    }

    async fn get_tenant(&self, id: TenantId) -> Result<Option<Tenant>, StoreError> {
        let row: Option<TenantRow> =
            sqlx::query_as("SELECT id, name, created_at FROM tenants WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        Ok(row.map(Into::into))
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        let rows: Vec<TenantRow> =
            sqlx::query_as("SELECT id, name, created_at FROM tenants ORDER BY created_at, id")
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete_tenant(&self, id: TenantId) -> Result<bool, StoreError> {
        // Referential cascades run outside row-level security, so every owned row goes.
        let result = sqlx::query("DELETE FROM tenants WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        let deleted = result.rows_affected() > 0;
        if deleted {
            info!(tenant_id = %id, "tenant deleted with all owned rows");
        }
        Ok(deleted)
    }

    async fn begin(
        &self,
        context: Option<TenantContext>,
    ) -> Result<Box<dyn TenantScope>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        // Always written, so a pooled connection never carries a previous binding.
        let value = context.map(|ctx| ctx.session_value()).unwrap_or_default();
        sqlx::query("SELECT set_config($1, $2, true)")
            .bind(schema::TENANT_SETTING)
            .bind(&value)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        debug!(tenant_id = %value, "tenant scope opened");
        Ok(Box::new(PostgresTenantScope { tx, context }))
    }
}

/// A transaction whose `app.current_tenant_id` is bound for its lifetime.
/// Dropping it without `commit` rolls back.
pub struct PostgresTenantScope {
    tx: Transaction<'static, Postgres>,
    context: Option<TenantContext>,
}

impl PostgresTenantScope {
    /// Open a savepoint for one write. A rejected statement then rolls back
    /// alone and the surrounding transaction stays usable.
    async fn statement(&mut self) -> Result<Transaction<'_, Postgres>, StoreError> {
        self.tx.begin().await.map_err(map_sqlx_error)
    }

    fn bound_tenant(&self, table: &'static str) -> Result<Uuid, StoreError> {
        self.context
            .map(|ctx| ctx.tenant_id().as_uuid())
            .ok_or(StoreError::TenantContextRequired(table))
    }
}

#[async_trait]
impl TenantScope for PostgresTenantScope {
    fn context(&self) -> Option<&TenantContext> {
        self.context.as_ref()
    }

    // --- Users ---

    async fn insert_user(&mut self, user: NewUser) -> Result<User, StoreError> {
        let tenant_id = self.bound_tenant(schema::USERS)?;
        let email = required("users.email", &user.email)?;
        let query = format!(
            "INSERT INTO users (tenant_id, email, full_name) VALUES ($1, $2, $3) RETURNING {USER_COLUMNS}"
        );
        let mut stmt = self.statement().await?;
        let row: UserRow = sqlx::query_as(&query)
            .bind(tenant_id)
            .bind(email)
            .bind(optional(user.full_name.as_deref()))
            .fetch_one(&mut *stmt)
            .await
            .map_err(map_sqlx_error)?;
        stmt.commit().await.map_err(map_sqlx_error)?;
        Ok(row.into())
    }

    async fn get_user(&mut self, id: UserId) -> Result<Option<User>, StoreError> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let row: Option<UserRow> = sqlx::query_as(&query)
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.map(Into::into))
    }

    async fn find_user_by_email(&mut self, email: &str) -> Result<Option<User>, StoreError> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1");
        let row: Option<UserRow> = sqlx::query_as(&query)
            .bind(email.trim())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.map(Into::into))
    }

    async fn list_users(&mut self) -> Result<Vec<User>, StoreError> {
        let query = format!("SELECT {USER_COLUMNS} FROM users ORDER BY created_at, id");
        let rows: Vec<UserRow> = sqlx::query_as(&query)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete_user(&mut self, id: UserId) -> Result<bool, StoreError> {
        let mut stmt = self.statement().await?;
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *stmt)
            .await
            .map_err(map_sqlx_error)?;
        stmt.commit().await.map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    // --- Integrations ---

    async fn insert_integration(
        &mut self,
        integration: NewIntegration,
    ) -> Result<Integration, StoreError> {
        self.bound_tenant(schema::INTEGRATIONS)?;
        let provider = required("integrations.provider", integration.provider.as_str())?;
        let status = required("integrations.status", integration.status.as_str())?;
        // tenant_id is copied from the owning user as seen through the policy;
        // an invisible user yields no row.
        let query = format!(
            "INSERT INTO integrations \
                (user_id, tenant_id, provider, encrypted_refresh_token, contacts_sync_token, status) \
             SELECT u.id, u.tenant_id, $2, $3, $4, $5 FROM users u WHERE u.id = $1 \
             RETURNING {INTEGRATION_COLUMNS}"
        );
        let mut stmt = self.statement().await?;
        let row: Option<IntegrationRow> = sqlx::query_as(&query)
            .bind(integration.user_id.as_uuid())
            .bind(provider)
            .bind(integration.encrypted_refresh_token)
            .bind(integration.contacts_sync_token)
            .bind(status)
            .fetch_optional(&mut *stmt)
            .await
            .map_err(map_sqlx_error)?;
        stmt.commit().await.map_err(map_sqlx_error)?;
        row.map(Into::into)
            .ok_or_else(|| StoreError::ForeignKeyViolation("integrations.user_id".into()))
    }

    async fn get_integration(
        &mut self,
        id: IntegrationId,
    ) -> Result<Option<Integration>, StoreError> {
        let query = format!("SELECT {INTEGRATION_COLUMNS} FROM integrations WHERE id = $1");
        let row: Option<IntegrationRow> = sqlx::query_as(&query)
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.map(Into::into))
    }

    async fn list_integrations(&mut self) -> Result<Vec<Integration>, StoreError> {
        let query =
            format!("SELECT {INTEGRATION_COLUMNS} FROM integrations ORDER BY created_at, id");
        let rows: Vec<IntegrationRow> = sqlx::query_as(&query)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_integrations_for_user(
        &mut self,
        user_id: UserId,
    ) -> Result<Vec<Integration>, StoreError> {
        let query = format!(
            "SELECT {INTEGRATION_COLUMNS} FROM integrations WHERE user_id = $1 ORDER BY created_at, id"
        );
        let rows: Vec<IntegrationRow> = sqlx::query_as(&query)
            .bind(user_id.as_uuid())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn update_integration_status(
        &mut self,
        id: IntegrationId,
        status: IntegrationStatus,
    ) -> Result<Option<Integration>, StoreError> {
        let status = required("integrations.status", status.as_str())?;
        // clock_timestamp(), not now(): now() is frozen at transaction start.
        let query = format!(
            "UPDATE integrations SET status = $2, updated_at = clock_timestamp() \
             WHERE id = $1 RETURNING {INTEGRATION_COLUMNS}"
        );
        let mut stmt = self.statement().await?;
        let row: Option<IntegrationRow> = sqlx::query_as(&query)
            .bind(id.as_uuid())
            .bind(status)
            .fetch_optional(&mut *stmt)
            .await
            .map_err(map_sqlx_error)?;
        stmt.commit().await.map_err(map_sqlx_error)?;
        Ok(row.map(Into::into))
    }

    async fn update_contacts_sync_token(
        &mut self,
        id: IntegrationId,
        sync_token: Option<String>,
    ) -> Result<Option<Integration>, StoreError> {
        let query = format!(
            "UPDATE integrations SET contacts_sync_token = $2, updated_at = clock_timestamp() \
             WHERE id = $1 RETURNING {INTEGRATION_COLUMNS}"
        );
        let mut stmt = self.statement().await?;
        let row: Option<IntegrationRow> = sqlx::query_as(&query)
            .bind(id.as_uuid())
            .bind(sync_token)
            .fetch_optional(&mut *stmt)
            .await
            .map_err(map_sqlx_error)?;
        stmt.commit().await.map_err(map_sqlx_error)?;
        Ok(row.map(Into::into))
    }

    // --- Contacts ---

    async fn insert_contact(&mut self, contact: NewContact) -> Result<Contact, StoreError> {
        let tenant_id = self.bound_tenant(schema::CONTACTS)?;
        let query = format!(
            "INSERT INTO contacts (tenant_id, canonical_name) VALUES ($1, $2) RETURNING {CONTACT_COLUMNS}"
        );
        let mut stmt = self.statement().await?;
        let row: ContactRow = sqlx::query_as(&query)
            .bind(tenant_id)
            .bind(optional(contact.canonical_name.as_deref()))
            .fetch_one(&mut *stmt)
            .await
            .map_err(map_sqlx_error)?;
        stmt.commit().await.map_err(map_sqlx_error)?;
        Ok(row.into())
    }

    async fn get_contact(&mut self, id: ContactId) -> Result<Option<Contact>, StoreError> {
        let query = format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = $1");
        let row: Option<ContactRow> = sqlx::query_as(&query)
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.map(Into::into))
    }

    async fn list_contacts(&mut self) -> Result<Vec<Contact>, StoreError> {
        let query = format!("SELECT {CONTACT_COLUMNS} FROM contacts ORDER BY created_at, id");
        let rows: Vec<ContactRow> = sqlx::query_as(&query)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete_contact(&mut self, id: ContactId) -> Result<bool, StoreError> {
        let mut stmt = self.statement().await?;
        let result = sqlx::query("DELETE FROM contacts WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *stmt)
            .await
            .map_err(map_sqlx_error)?;
        stmt.commit().await.map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    // --- Contact identifiers ---

    async fn insert_contact_identifier(
        &mut self,
        identifier: NewContactIdentifier,
    ) -> Result<ContactIdentifier, StoreError> {
        self.bound_tenant(schema::CONTACT_IDENTIFIERS)?;
        let identifier_type = required(
            "contact_identifiers.identifier_type",
            identifier.identifier_type.as_str(),
        )?;
        let identifier_value = required(
            "contact_identifiers.identifier_value",
            &identifier.identifier_value,
        )?;
        let query = format!(
            "INSERT INTO contact_identifiers (contact_id, tenant_id, identifier_type, identifier_value) \
             SELECT c.id, c.tenant_id, $2, $3 FROM contacts c WHERE c.id = $1 \
             RETURNING {IDENTIFIER_COLUMNS}"
        );
        let mut stmt = self.statement().await?;
        let row: Option<IdentifierRow> = sqlx::query_as(&query)
            .bind(identifier.contact_id.as_uuid())
            .bind(identifier_type)
            .bind(identifier_value)
            .fetch_optional(&mut *stmt)
            .await
            .map_err(map_sqlx_error)?;
        stmt.commit().await.map_err(map_sqlx_error)?;
        row.map(Into::into).ok_or_else(|| {
            StoreError::ForeignKeyViolation("contact_identifiers.contact_id".into())
        })
    }

    async fn list_contact_identifiers(
        &mut self,
        contact_id: ContactId,
    ) -> Result<Vec<ContactIdentifier>, StoreError> {
        let query = format!(
            "SELECT {IDENTIFIER_COLUMNS} FROM contact_identifiers \
             WHERE contact_id = $1 ORDER BY created_at, id"
        );
        let rows: Vec<IdentifierRow> = sqlx::query_as(&query)
            .bind(contact_id.as_uuid())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn find_contact_by_identifier(
        &mut self,
        identifier_type: &IdentifierType,
        identifier_value: &str,
    ) -> Result<Option<Contact>, StoreError> {
        let row: Option<ContactRow> = sqlx::query_as(
            "SELECT c.id, c.tenant_id, c.canonical_name, c.created_at \
             FROM contact_identifiers ci JOIN contacts c ON c.id = ci.contact_id \
             WHERE ci.identifier_type = $1 AND ci.identifier_value = $2 \
             LIMIT 1",
        )
        .bind(identifier_type.as_str())
        .bind(identifier_value.trim())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(row.map(Into::into))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(map_sqlx_error)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(map_sqlx_error)
    }
}
