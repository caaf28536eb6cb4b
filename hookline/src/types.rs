//! Common identifier types shared across the engine.
//!
//! - [`OwnerId`]: the tenant that owns endpoints
//! - [`EndpointId`]: a registered webhook endpoint
//! - [`ScopeId`]: a messaging session an endpoint can be narrowed to
//! - [`abbrev_uuid`]: Abbreviate UUIDs to first 8 chars for logging

use uuid::Uuid;

pub type OwnerId = Uuid;
pub type EndpointId = Uuid;
pub type DeliveryId = Uuid;

/// Session identifiers are chosen by tenants, so they stay plain strings.
pub type ScopeId = String;

/// Abbreviate a UUID to its first 8 characters for more readable logs
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}
