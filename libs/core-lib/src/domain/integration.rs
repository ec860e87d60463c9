use super::{IntegrationId, TenantId, UserId, open_str_enum};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

open_str_enum!(
    /// Third-party account a user has connected.
    Provider {
        GoogleWorkspace => "google_workspace",
        Microsoft365 => "microsoft_365",
    }
);

open_str_enum!(
    IntegrationStatus {
        Active => "active",
        Revoked => "revoked",
        Error => "error",
    }
);

impl Default for IntegrationStatus {
    fn default() -> Self {
        Self::Active
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Integration {
    pub id: IntegrationId,
    pub user_id: UserId,
    /// Always equal to the owning user's tenant.
    pub tenant_id: TenantId,
    pub provider: Provider,
    /// Ciphertext; the store never interprets it.
    pub encrypted_refresh_token: Option<Vec<u8>>,
    /// Provider cursor for incremental contact sync.
    pub contacts_sync_token: Option<String>,
    pub status: IntegrationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewIntegration {
    pub user_id: UserId,
    pub provider: Provider,
    pub encrypted_refresh_token: Option<Vec<u8>>,
    pub contacts_sync_token: Option<String>,
    pub status: IntegrationStatus,
}

impl NewIntegration {
    pub fn new(user_id: UserId, provider: Provider) -> Self {
        Self {
            user_id,
            provider,
            encrypted_refresh_token: None,
            contacts_sync_token: None,
            status: IntegrationStatus::Active,
        }
    }

    pub fn with_refresh_token(mut self, ciphertext: Vec<u8>) -> Self {
        self.encrypted_refresh_token = Some(ciphertext);
        self
    }
}
