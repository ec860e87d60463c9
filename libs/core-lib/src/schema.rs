//! Names that make up the persisted schema. Table, column and constraint names
//! must match `migrations/0001_tenant_store.sql` exactly; both engines report
//! violations using these names.

/// Transaction-local setting read by every row-level security policy.
pub const TENANT_SETTING: &str = "app.current_tenant_id";

/// Name shared by the isolation policy on each protected table.
pub const TENANT_POLICY: &str = "tenant_isolation_policy";

pub const TENANTS: &str = "tenants";
pub const USERS: &str = "users";
pub const INTEGRATIONS: &str = "integrations";
pub const CONTACTS: &str = "contacts";
pub const CONTACT_IDENTIFIERS: &str = "contact_identifiers";

/// Tables guarded by the tenant isolation policy.
pub const PROTECTED_TABLES: [&str; 4] = [USERS, INTEGRATIONS, CONTACTS, CONTACT_IDENTIFIERS];

pub const UQ_USERS_EMAIL: &str = "uq_users_email";
pub const UQ_INTEGRATIONS_USER_PROVIDER: &str = "uq_integrations_user_provider";
pub const UQ_CONTACT_IDENTIFIERS_TENANT_TYPE_VALUE: &str =
    "uq_contact_identifiers_tenant_type_value";

/// Source of the initial migration, kept for inspection and schema tests.
pub const INITIAL_MIGRATION: &str = include_str!("../migrations/0001_tenant_store.sql");
