use super::{ContactId, ContactIdentifierId, TenantId, open_str_enum};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

open_str_enum!(
    /// Kind of handle used to resolve a contact.
    IdentifierType {
        Email => "email",
        Phone => "phone",
    }
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub tenant_id: TenantId,
    pub canonical_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewContact {
    pub canonical_name: Option<String>,
}

impl NewContact {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            canonical_name: Some(name.into()),
        }
    }
}

/// A typed handle that is unique within its tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactIdentifier {
    pub id: ContactIdentifierId,
    pub contact_id: ContactId,
    /// Always equal to the owning contact's tenant.
    pub tenant_id: TenantId,
    pub identifier_type: IdentifierType,
    pub identifier_value: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewContactIdentifier {
    pub contact_id: ContactId,
    pub identifier_type: IdentifierType,
    pub identifier_value: String,
}

impl NewContactIdentifier {
    pub fn new(
        contact_id: ContactId,
        identifier_type: IdentifierType,
        identifier_value: impl Into<String>,
    ) -> Self {
        Self {
            contact_id,
            identifier_type,
            identifier_value: identifier_value.into(),
        }
    }
}
