//! Normalising provider contact payloads and writing them into a tenant scope.
//!
//! Fetching from the providers happens elsewhere; this module takes the JSON
//! documents they return (Google People connections, Microsoft Graph contacts)
//! and merges them into the contact tables of the bound tenant.

use crate::domain::{
    Contact, IdentifierType, Integration, IntegrationId, NewContact, NewContactIdentifier,
    Provider,
};
use crate::{StoreError, TenantScope};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    #[error("Contact import is not supported for provider {0}")]
    UnsupportedProvider(Provider),
    #[error("Integration not found: {0}")]
    IntegrationNotFound(IntegrationId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentifierHandle {
    pub identifier_type: IdentifierType,
    pub value: String,
}

impl IdentifierHandle {
    pub fn email(value: impl Into<String>) -> Self {
        Self {
            identifier_type: IdentifierType::Email,
            value: value.into(),
        }
    }

    pub fn phone(value: impl Into<String>) -> Self {
        Self {
            identifier_type: IdentifierType::Phone,
            value: value.into(),
        }
    }
}

/// A contact as reported by a provider, before it is matched against the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderContact {
    pub external_id: Option<String>,
    pub display_name: Option<String>,
    pub identifiers: Vec<IdentifierHandle>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub contacts_created: usize,
    pub contacts_matched: usize,
    pub identifiers_added: usize,
}

fn text(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn array<'a>(value: &'a Value, key: &str) -> impl Iterator<Item = &'a Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn finish(
    external_id: Option<String>,
    display_name: Option<String>,
    identifiers: Vec<IdentifierHandle>,
) -> Option<ProviderContact> {
    if identifiers.is_empty() {
        return None;
    }
    Some(ProviderContact {
        external_id,
        display_name,
        identifiers,
    })
}

/// Parse one entry of a Google People `connections` list.
pub fn parse_google_connection(connection: &Value) -> Option<ProviderContact> {
    let display_name = connection
        .get("names")
        .and_then(|names| names.get(0))
        .and_then(|name| text(name.get("displayName")));

    let emails = array(connection, "emailAddresses")
        .filter_map(|e| text(e.get("value")))
        .map(IdentifierHandle::email);
    let phones = array(connection, "phoneNumbers")
        .filter_map(|p| text(p.get("value")))
        .map(IdentifierHandle::phone);

    finish(
        text(connection.get("resourceName")),
        display_name,
        emails.chain(phones).collect(),
    )
}

/// Parse one entry of a Microsoft Graph `contacts` list.
pub fn parse_microsoft_contact(contact: &Value) -> Option<ProviderContact> {
    let emails = array(contact, "emailAddresses")
        .filter_map(|e| text(e.get("address")))
        .map(IdentifierHandle::email);
    let phones = array(contact, "businessPhones")
        .chain(array(contact, "homePhones"))
        .filter_map(|p| text(Some(p)))
        .chain(text(contact.get("mobilePhone")))
        .map(IdentifierHandle::phone);

    finish(
        text(contact.get("id")),
        text(contact.get("displayName")),
        emails.chain(phones).collect(),
    )
}

/// Parse a page of provider payloads, dropping entries without identifiers.
pub fn parse_contacts(
    provider: &Provider,
    payloads: &[Value],
) -> Result<Vec<ProviderContact>, IngestError> {
    let parse: fn(&Value) -> Option<ProviderContact> = match provider {
        Provider::GoogleWorkspace => parse_google_connection,
        Provider::Microsoft365 => parse_microsoft_contact,
        other => return Err(IngestError::UnsupportedProvider(other.clone())),
    };
    let contacts: Vec<ProviderContact> = payloads.iter().filter_map(parse).collect();
    debug!(
        provider = %provider,
        received = payloads.len(),
        parsed = contacts.len(),
        "provider contacts parsed"
    );
    Ok(contacts)
}

async fn find_by_any(
    scope: &mut dyn TenantScope,
    handles: &[IdentifierHandle],
) -> Result<Option<Contact>, StoreError> {
    for handle in handles {
        if let Some(contact) = scope
            .find_contact_by_identifier(&handle.identifier_type, &handle.value)
            .await?
        {
            return Ok(Some(contact));
        }
    }
    Ok(None)
}

/// Merge provider contacts into the scope's tenant.
///
/// A provider contact whose identifiers already resolve to a stored contact is
/// matched to it and gains the identifiers it lacks. Identifiers owned by a
/// different stored contact are left where they are. Otherwise a new contact
/// is created carrying all of them.
pub async fn import_contacts(
    scope: &mut dyn TenantScope,
    contacts: &[ProviderContact],
) -> Result<ImportSummary, IngestError> {
    let mut summary = ImportSummary::default();

    for incoming in contacts {
        let mut handles: Vec<IdentifierHandle> = Vec::with_capacity(incoming.identifiers.len());
        for handle in &incoming.identifiers {
            if !handles.contains(handle) {
                handles.push(handle.clone());
            }
        }

        let target = match find_by_any(scope, &handles).await? {
            Some(existing) => {
                summary.contacts_matched += 1;
                existing
            }
            None => {
                summary.contacts_created += 1;
                scope
                    .insert_contact(NewContact {
                        canonical_name: incoming.display_name.clone(),
                    })
                    .await?
            }
        };

        for handle in handles {
            let known = scope
                .find_contact_by_identifier(&handle.identifier_type, &handle.value)
                .await?;
            if known.is_none() {
                scope
                    .insert_contact_identifier(NewContactIdentifier::new(
                        target.id,
                        handle.identifier_type,
                        handle.value,
                    ))
                    .await?;
                summary.identifiers_added += 1;
            }
        }
    }

    info!(
        created = summary.contacts_created,
        matched = summary.contacts_matched,
        identifiers = summary.identifiers_added,
        "contacts imported"
    );
    Ok(summary)
}

/// Contact list carried by one response page: `connections` for Google People,
/// `value` for Microsoft Graph.
pub fn parse_page(provider: &Provider, page: &Value) -> Result<Vec<ProviderContact>, IngestError> {
    let key = match provider {
        Provider::GoogleWorkspace => "connections",
        Provider::Microsoft365 => "value",
        other => return Err(IngestError::UnsupportedProvider(other.clone())),
    };
    let entries: Vec<Value> = array(page, key).cloned().collect();
    parse_contacts(provider, &entries)
}

/// Pull `$deltatoken` out of a Microsoft Graph `@odata.deltaLink`.
pub fn delta_token_from_link(delta_link: &str) -> Option<String> {
    let link = Url::parse(delta_link.trim()).ok()?;
    link.query_pairs()
        .find(|(key, _)| key == "$deltatoken")
        .map(|(_, value)| value.trim().to_string())
        .filter(|token| !token.is_empty())
}

/// Cursor to keep after a response page. `None` while more pages follow or
/// when the provider returned no cursor.
pub fn sync_cursor_from_page(
    provider: &Provider,
    page: &Value,
) -> Result<Option<String>, IngestError> {
    match provider {
        Provider::GoogleWorkspace => {
            if text(page.get("nextPageToken")).is_some() {
                return Ok(None);
            }
            Ok(text(page.get("nextSyncToken")))
        }
        Provider::Microsoft365 => {
            if text(page.get("@odata.nextLink")).is_some() {
                return Ok(None);
            }
            Ok(text(page.get("@odata.deltaLink")).and_then(|link| delta_token_from_link(&link)))
        }
        other => Err(IngestError::UnsupportedProvider(other.clone())),
    }
}

/// Where the next contact sync of an integration starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMode {
    Full,
    Incremental(String),
}

impl SyncMode {
    pub fn for_integration(integration: &Integration) -> Self {
        match integration.contacts_sync_token.as_deref().map(str::trim) {
            Some(token) if !token.is_empty() => SyncMode::Incremental(token.to_string()),
            _ => SyncMode::Full,
        }
    }
}

/// Store the cursor returned with the last page so the next sync is incremental.
pub async fn record_sync(
    scope: &mut dyn TenantScope,
    integration_id: IntegrationId,
    next_sync_token: Option<String>,
) -> Result<Integration, IngestError> {
    scope
        .update_contacts_sync_token(integration_id, next_sync_token)
        .await?
        .ok_or(IngestError::IntegrationNotFound(integration_id))
}

/// Drop a cursor the provider rejected as expired; the next sync is a full one.
pub async fn restart_full_sync(
    scope: &mut dyn TenantScope,
    integration_id: IntegrationId,
) -> Result<Integration, IngestError> {
    warn!(integration_id = %integration_id, "Sync token expired, performing full sync");
    record_sync(scope, integration_id, None).await
}
