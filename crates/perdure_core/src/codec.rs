//! JSON record codec.
//!
//! Defines the persisted record shape:
//!
//! ```json
//! {
//!   "id": "<uuid>",
//!   "schemaVersion": 1,
//!   "created": "<timestamp>",
//!   "saved": "<timestamp, present only once persisted>",
//!   "item": { ... },
//!   "persistenceState": "persistent",
//!   "version": 3
//! }
//! ```
//!
//! Field order is insignificant; `saved` is omitted until the entity has
//! been persisted at least once.

use crate::entity::{Entity, EntityId, EntityItem, PersistenceState};
use crate::error::CoreResult;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Borrowed view of an entity used to build a storage statement.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RecordRef<'a, T: Serialize> {
    pub id: EntityId,
    pub schema_version: i64,
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved: Option<DateTime<Utc>>,
    pub item: &'a T,
    pub persistence_state: PersistenceState,
    pub version: u64,
}

/// Owned record as decoded from the store.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RecordOwned<T> {
    pub id: EntityId,
    pub schema_version: i64,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub saved: Option<DateTime<Utc>>,
    pub item: T,
    pub persistence_state: PersistenceState,
    pub version: u64,
}

pub(crate) fn encode_record<T: Serialize>(record: &RecordRef<'_, T>) -> CoreResult<Vec<u8>> {
    Ok(serde_json::to_vec(record)?)
}

pub(crate) fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> CoreResult<RecordOwned<T>> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Decodes a persisted record into an entity.
///
/// The resulting entity is *not* bound to any collection; bind it through
/// [`crate::Collection::initialize`] before mutating or committing it.
pub fn decode_entity<T: EntityItem>(bytes: &[u8]) -> CoreResult<Entity<T>> {
    Ok(Entity::from_record(decode_record(bytes)?))
}
