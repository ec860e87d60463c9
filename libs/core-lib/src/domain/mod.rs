use crate::StoreError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(uuid::Uuid);

        impl $name {
            pub fn new_v4() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> uuid::Uuid {
                self.0
            }
        }

        impl From<uuid::Uuid> for $name {
            fn from(id: uuid::Uuid) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

// Text column holding an open set of values: known values get a variant,
// anything else round-trips through `Other` unchanged.
macro_rules! open_str_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $($variant,)+
            Other(String),
        }

        impl $name {
            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $text,)+
                    Self::Other(value) => value.as_str(),
                }
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                match value.trim() {
                    $($text => Self::$variant,)+
                    other => Self::Other(other.to_string()),
                }
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::from(value.as_str())
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.as_str().to_string()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

pub(crate) use open_str_enum;

uuid_id!(
    /// Identifier of a tenant, the top-level isolation boundary.
    TenantId
);
uuid_id!(UserId);
uuid_id!(IntegrationId);
uuid_id!(ContactId);
uuid_id!(ContactIdentifierId);

// Entities of the tenant store, one module per table family.
pub mod contact;
pub mod integration;
pub mod tenant;
pub mod user;

pub use contact::{Contact, ContactIdentifier, IdentifierType, NewContact, NewContactIdentifier};
pub use integration::{Integration, IntegrationStatus, NewIntegration, Provider};
pub use tenant::{Tenant, TenantContext, policy_admits};
pub use user::{NewUser, User};

impl std::str::FromStr for TenantId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| StoreError::InvalidTenantId(format!("{s:?}: {e}")))
    }
}

/// Trims a required text column, rejecting blank values the same way the
/// database rejects a missing one.
pub(crate) fn required(column: &'static str, value: &str) -> Result<String, StoreError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(StoreError::NotNullViolation(column.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Blank optional text is stored as NULL.
pub(crate) fn optional(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_id_parses_session_value() {
        let id = TenantId::new_v4();
        let parsed: TenantId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);

        let padded: TenantId = format!("  {id} ").parse().unwrap();
        assert_eq!(padded, id);
    }

    #[test]
    fn test_tenant_id_rejects_garbage() {
        match "not-a-uuid".parse::<TenantId>() {
            Err(StoreError::InvalidTenantId(msg)) => assert!(msg.contains("not-a-uuid")),
            other => panic!("Expected InvalidTenantId, got {:?}", other),
        }
        assert!("".parse::<TenantId>().is_err());
    }

    #[test]
    fn test_required_and_optional_text() {
        assert_eq!(required("users.email", " a@x.com ").unwrap(), "a@x.com");
        match required("users.email", "   ") {
            Err(StoreError::NotNullViolation(col)) => assert_eq!(col, "users.email"),
            other => panic!("Expected NotNullViolation, got {:?}", other),
        }
        assert_eq!(optional(Some("  ")), None);
        assert_eq!(optional(Some(" Ada ")), Some("Ada".to_string()));
        assert_eq!(optional(None), None);
    }
}
