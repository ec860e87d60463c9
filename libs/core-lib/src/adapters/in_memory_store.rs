use crate::domain::{
    Contact, ContactId, ContactIdentifier, ContactIdentifierId, IdentifierType, Integration,
    IntegrationId, IntegrationStatus, NewContact, NewContactIdentifier, NewIntegration, NewUser,
    Tenant, TenantContext, TenantId, User, UserId, optional, policy_admits, required,
};
use crate::{StoreError, TenantScope, TenantStore, schema};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
struct Tables {
    tenants: HashMap<TenantId, Tenant>,
    users: HashMap<UserId, User>,
    integrations: HashMap<IntegrationId, Integration>,
    contacts: HashMap<ContactId, Contact>,
    contact_identifiers: HashMap<ContactIdentifierId, ContactIdentifier>,
}

impl Tables {
    fn cascade_delete_tenant(&mut self, tenant_id: TenantId) {
        // Denormalised tenant_id always matches the parent, so one pass per table is complete.
        self.users.retain(|_, u| u.tenant_id != tenant_id);
        self.integrations.retain(|_, i| i.tenant_id != tenant_id);
        self.contacts.retain(|_, c| c.tenant_id != tenant_id);
        self.contact_identifiers.retain(|_, ci| ci.tenant_id != tenant_id);
    }

    // --- Constraints ---
    // Checked per statement against the scope's copy, and again at commit
    // against the rows other scopes published in the meantime.

    fn check_user(&self, row: &User) -> Result<(), StoreError> {
        if !self.tenants.contains_key(&row.tenant_id) {
            return Err(StoreError::ForeignKeyViolation("users.tenant_id".into()));
        }
        // Email is unique across the whole store, not only the visible rows.
        if self
            .users
            .values()
            .any(|u| u.id != row.id && u.email == row.email)
        {
            return Err(StoreError::unique(schema::UQ_USERS_EMAIL));
        }
        Ok(())
    }

    fn check_integration(&self, row: &Integration) -> Result<(), StoreError> {
        let owner_matches = self
            .users
            .get(&row.user_id)
            .is_some_and(|u| u.tenant_id == row.tenant_id);
        if !owner_matches {
            return Err(StoreError::ForeignKeyViolation("integrations.user_id".into()));
        }
        if self
            .integrations
            .values()
            .any(|i| i.id != row.id && i.user_id == row.user_id && i.provider == row.provider)
        {
            return Err(StoreError::unique(schema::UQ_INTEGRATIONS_USER_PROVIDER));
        }
        Ok(())
    }

    fn check_contact(&self, row: &Contact) -> Result<(), StoreError> {
        if !self.tenants.contains_key(&row.tenant_id) {
            return Err(StoreError::ForeignKeyViolation("contacts.tenant_id".into()));
        }
        Ok(())
    }

    fn check_contact_identifier(&self, row: &ContactIdentifier) -> Result<(), StoreError> {
        let owner_matches = self
            .contacts
            .get(&row.contact_id)
            .is_some_and(|c| c.tenant_id == row.tenant_id);
        if !owner_matches {
            return Err(StoreError::ForeignKeyViolation(
                "contact_identifiers.contact_id".into(),
            ));
        }
        if self.contact_identifiers.values().any(|ci| {
            ci.id != row.id
                && ci.tenant_id == row.tenant_id
                && ci.identifier_type == row.identifier_type
                && ci.identifier_value == row.identifier_value
        }) {
            return Err(StoreError::unique(
                schema::UQ_CONTACT_IDENTIFIERS_TENANT_TYPE_VALUE,
            ));
        }
        Ok(())
    }

    /// Replay the changes a scope made between `base` and `working` onto the
    /// current tables. Nothing is published when a re-check fails.
    fn merge(&self, base: &Tables, working: &Tables) -> Result<Tables, StoreError> {
        let mut merged = self.clone();
        let users = merge_rows(&mut merged.users, &base.users, &working.users);
        let integrations = merge_rows(
            &mut merged.integrations,
            &base.integrations,
            &working.integrations,
        );
        let contacts = merge_rows(&mut merged.contacts, &base.contacts, &working.contacts);
        let identifiers = merge_rows(
            &mut merged.contact_identifiers,
            &base.contact_identifiers,
            &working.contact_identifiers,
        );

        // Cascades also reach children other scopes attached after `base`.
        for id in &users.deleted {
            merged.integrations.retain(|_, i| i.user_id != *id);
        }
        for id in &contacts.deleted {
            merged.contact_identifiers.retain(|_, ci| ci.contact_id != *id);
        }

        for id in &users.inserted {
            if let Some(row) = merged.users.get(id) {
                merged.check_user(row)?;
            }
        }
        for id in &integrations.inserted {
            if let Some(row) = merged.integrations.get(id) {
                merged.check_integration(row)?;
            }
        }
        for id in &contacts.inserted {
            if let Some(row) = merged.contacts.get(id) {
                merged.check_contact(row)?;
            }
        }
        for id in &identifiers.inserted {
            if let Some(row) = merged.contact_identifiers.get(id) {
                merged.check_contact_identifier(row)?;
            }
        }
        Ok(merged)
    }
}

struct RowChanges<K> {
    inserted: Vec<K>,
    deleted: Vec<K>,
}

/// Apply one table's inserts, updates and deletes. An update to a row another
/// scope removed meanwhile is dropped, like an UPDATE matching no rows.
fn merge_rows<K, V>(
    target: &mut HashMap<K, V>,
    base: &HashMap<K, V>,
    working: &HashMap<K, V>,
) -> RowChanges<K>
where
    K: Copy + Eq + Hash,
    V: Clone + PartialEq,
{
    let mut changes = RowChanges {
        inserted: Vec::new(),
        deleted: Vec::new(),
    };
    for (id, row) in working {
        match base.get(id) {
            None => {
                target.insert(*id, row.clone());
                changes.inserted.push(*id);
            }
            Some(before) if before != row => {
                if let Some(current) = target.get_mut(id) {
                    *current = row.clone();
                }
            }
            Some(_) => {}
        }
    }
    for id in base.keys() {
        if !working.contains_key(id) {
            target.remove(id);
            changes.deleted.push(*id);
        }
    }
    changes
}

/// In-memory implementation of the TenantStore port for tests and single-process use.
///
/// A scope works on a snapshot taken at `begin`; the store lock is only held
/// while the snapshot is copied and while `commit` merges the scope's changes
/// back. Constraints are re-checked during the merge, so a commit can fail
/// with a violation caused by a scope that committed first. Dropping or
/// rolling back a scope discards its snapshot.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTenantStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Rows come back in insertion order, as with `ORDER BY created_at, id`.
fn sorted<T: Clone, K: Ord>(rows: impl Iterator<Item = T>, key: impl Fn(&T) -> K) -> Vec<T> {
    let mut rows: Vec<T> = rows.collect();
    rows.sort_by_key(|row| key(row));
    rows
}

/// Strictly increasing timestamps keep the ordering stable when two rows are
/// written within the same clock tick.
fn next_timestamp(last: &mut DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    let ts = if now > *last {
        now
    } else {
        *last + chrono::Duration::microseconds(1)
    };
    *last = ts;
    ts
}

#[async_trait]
impl TenantStore for InMemoryTenantStore {
    async fn create_tenant(&self, name: &str) -> Result<Tenant, StoreError> {
        let name = required("tenants.name", name)?;
        let mut tables = self.tables.lock().await;
        let tenant = Tenant {
            id: TenantId::new_v4(),
            name,
            created_at: Utc::now(),
        };
        tables.tenants.insert(tenant.id, tenant.clone());
        info!(tenant_id = %tenant.id, "tenant created");
        Ok(tenant)
    }

    async fn get_tenant(&self, id: TenantId) -> Result<Option<Tenant>, StoreError> {
        Ok(self.tables.lock().await.tenants.get(&id).cloned())
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(sorted(tables.tenants.values().cloned(), |t| (t.created_at, t.id)))
    }

    async fn delete_tenant(&self, id: TenantId) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.tenants.remove(&id).is_none() {
            return Ok(false);
        }
        tables.cascade_delete_tenant(id);
        info!(tenant_id = %id, "tenant deleted with all owned rows");
        Ok(true)
    }

    async fn begin(
        &self,
        context: Option<TenantContext>,
    ) -> Result<Box<dyn TenantScope>, StoreError> {
        let base = self.tables.lock().await.clone();
        debug!(tenant_id = ?context.map(|c| c.tenant_id()), "in-memory scope opened");
        Ok(Box::new(InMemoryScope {
            context,
            shared: Arc::clone(&self.tables),
            working: base.clone(),
            base,
            clock: Utc::now(),
        }))
    }
}

/// One transaction over a snapshot of the in-memory tables.
pub struct InMemoryScope {
    context: Option<TenantContext>,
    shared: Arc<Mutex<Tables>>,
    base: Tables,
    working: Tables,
    clock: DateTime<Utc>,
}

impl InMemoryScope {
    fn admits(&self, row_tenant: TenantId) -> bool {
        policy_admits(self.context.as_ref(), row_tenant)
    }

    fn bound_tenant(&self, table: &'static str) -> Result<TenantId, StoreError> {
        self.context
            .map(|ctx| ctx.tenant_id())
            .ok_or(StoreError::TenantContextRequired(table))
    }
}

#[async_trait]
impl TenantScope for InMemoryScope {
    fn context(&self) -> Option<&TenantContext> {
        self.context.as_ref()
    }

    async fn insert_user(&mut self, user: NewUser) -> Result<User, StoreError> {
        let tenant_id = self.bound_tenant(schema::USERS)?;
        let email = required("users.email", &user.email)?;
        let row = User {
            id: UserId::new_v4(),
            tenant_id,
            email,
            full_name: optional(user.full_name.as_deref()),
            created_at: next_timestamp(&mut self.clock),
        };
        self.working.check_user(&row)?;
        self.working.users.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_user(&mut self, id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self
            .working
            .users
            .get(&id)
            .filter(|u| self.admits(u.tenant_id))
            .cloned())
    }

    async fn find_user_by_email(&mut self, email: &str) -> Result<Option<User>, StoreError> {
        let email = email.trim();
        Ok(self
            .working
            .users
            .values()
            .find(|u| self.admits(u.tenant_id) && u.email == email)
            .cloned())
    }

    async fn list_users(&mut self) -> Result<Vec<User>, StoreError> {
        Ok(sorted(
            self.working
                .users
                .values()
                .filter(|u| self.admits(u.tenant_id))
                .cloned(),
            |u| (u.created_at, u.id),
        ))
    }

    async fn delete_user(&mut self, id: UserId) -> Result<bool, StoreError> {
        let visible = self
            .working
            .users
            .get(&id)
            .is_some_and(|u| self.admits(u.tenant_id));
        if !visible {
            return Ok(false);
        }
        self.working.users.remove(&id);
        self.working.integrations.retain(|_, i| i.user_id != id);
        Ok(true)
    }

    async fn insert_integration(
        &mut self,
        integration: NewIntegration,
    ) -> Result<Integration, StoreError> {
        self.bound_tenant(schema::INTEGRATIONS)?;
        let provider = required("integrations.provider", integration.provider.as_str())?;
        let status = required("integrations.status", integration.status.as_str())?;
        // The owning user must be visible here; its tenant becomes the row's tenant.
        let tenant_id = match self.working.users.get(&integration.user_id) {
            Some(user) if self.admits(user.tenant_id) => user.tenant_id,
            _ => return Err(StoreError::ForeignKeyViolation("integrations.user_id".into())),
        };
        let now = next_timestamp(&mut self.clock);
        let row = Integration {
            id: IntegrationId::new_v4(),
            user_id: integration.user_id,
            tenant_id,
            provider: provider.into(),
            encrypted_refresh_token: integration.encrypted_refresh_token,
            contacts_sync_token: integration.contacts_sync_token,
            status: status.into(),
            created_at: now,
            updated_at: now,
        };
        self.working.check_integration(&row)?;
        self.working.integrations.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_integration(
        &mut self,
        id: IntegrationId,
    ) -> Result<Option<Integration>, StoreError> {
        Ok(self
            .working
            .integrations
            .get(&id)
            .filter(|i| self.admits(i.tenant_id))
            .cloned())
    }

    async fn list_integrations(&mut self) -> Result<Vec<Integration>, StoreError> {
        Ok(sorted(
            self.working
                .integrations
                .values()
                .filter(|i| self.admits(i.tenant_id))
                .cloned(),
            |i| (i.created_at, i.id),
        ))
    }

    async fn list_integrations_for_user(
        &mut self,
        user_id: UserId,
    ) -> Result<Vec<Integration>, StoreError> {
        Ok(sorted(
            self.working
                .integrations
                .values()
                .filter(|i| self.admits(i.tenant_id) && i.user_id == user_id)
                .cloned(),
            |i| (i.created_at, i.id),
        ))
    }

    async fn update_integration_status(
        &mut self,
        id: IntegrationId,
        status: IntegrationStatus,
    ) -> Result<Option<Integration>, StoreError> {
        let status = required("integrations.status", status.as_str())?;
        let now = next_timestamp(&mut self.clock);
        let context = self.context;
        Ok(self
            .working
            .integrations
            .get_mut(&id)
            .filter(|i| policy_admits(context.as_ref(), i.tenant_id))
            .map(|i| {
                i.status = status.into();
                i.updated_at = now;
                i.clone()
            }))
    }

    async fn update_contacts_sync_token(
        &mut self,
        id: IntegrationId,
        sync_token: Option<String>,
    ) -> Result<Option<Integration>, StoreError> {
        let now = next_timestamp(&mut self.clock);
        let context = self.context;
        Ok(self
            .working
            .integrations
            .get_mut(&id)
            .filter(|i| policy_admits(context.as_ref(), i.tenant_id))
            .map(|i| {
                i.contacts_sync_token = sync_token;
                i.updated_at = now;
                i.clone()
            }))
    }

    async fn insert_contact(&mut self, contact: NewContact) -> Result<Contact, StoreError> {
        let tenant_id = self.bound_tenant(schema::CONTACTS)?;
        let row = Contact {
            id: ContactId::new_v4(),
            tenant_id,
            canonical_name: optional(contact.canonical_name.as_deref()),
            created_at: next_timestamp(&mut self.clock),
        };
        self.working.check_contact(&row)?;
        self.working.contacts.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_contact(&mut self, id: ContactId) -> Result<Option<Contact>, StoreError> {
        Ok(self
            .working
            .contacts
            .get(&id)
            .filter(|c| self.admits(c.tenant_id))
            .cloned())
    }

    async fn list_contacts(&mut self) -> Result<Vec<Contact>, StoreError> {
        Ok(sorted(
            self.working
                .contacts
                .values()
                .filter(|c| self.admits(c.tenant_id))
                .cloned(),
            |c| (c.created_at, c.id),
        ))
    }

    async fn delete_contact(&mut self, id: ContactId) -> Result<bool, StoreError> {
        let visible = self
            .working
            .contacts
            .get(&id)
            .is_some_and(|c| self.admits(c.tenant_id));
        if !visible {
            return Ok(false);
        }
        self.working.contacts.remove(&id);
        self.working
            .contact_identifiers
            .retain(|_, ci| ci.contact_id != id);
        Ok(true)
    }

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
        let tenant_id = match self.working.contacts.get(&identifier.contact_id) {
            Some(contact) if self.admits(contact.tenant_id) => contact.tenant_id,
            _ => {
                return Err(StoreError::ForeignKeyViolation(
                    "contact_identifiers.contact_id".into(),
                ));
            }
        };
        let row = ContactIdentifier {
            id: ContactIdentifierId::new_v4(),
            contact_id: identifier.contact_id,
            tenant_id,
            identifier_type: identifier_type.into(),
            identifier_value,
            created_at: next_timestamp(&mut self.clock),
        };
        self.working.check_contact_identifier(&row)?;
        self.working.contact_identifiers.insert(row.id, row.clone());
        Ok(row)
    }

    async fn list_contact_identifiers(
        &mut self,
        contact_id: ContactId,
    ) -> Result<Vec<ContactIdentifier>, StoreError> {
        Ok(sorted(
            self.working
                .contact_identifiers
                .values()
                .filter(|ci| self.admits(ci.tenant_id) && ci.contact_id == contact_id)
                .cloned(),
            |ci| (ci.created_at, ci.id),
        ))
    }

    async fn find_contact_by_identifier(
        &mut self,
        identifier_type: &IdentifierType,
        identifier_value: &str,
    ) -> Result<Option<Contact>, StoreError> {
        let identifier_value = identifier_value.trim();
        let contact_id = self
            .working
            .contact_identifiers
            .values()
            .find(|ci| {
                self.admits(ci.tenant_id)
                    && ci.identifier_type == *identifier_type
                    && ci.identifier_value == identifier_value
            })
            .map(|ci| ci.contact_id);
        Ok(contact_id.and_then(|id| {
            self.working
                .contacts
                .get(&id)
                .filter(|c| self.admits(c.tenant_id))
                .cloned()
        }))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut shared = self.shared.lock().await;
        let merged = shared.merge(&self.base, &self.working)?;
        *shared = merged;
        debug!(tenant_id = ?self.context.map(|c| c.tenant_id()), "in-memory scope committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
