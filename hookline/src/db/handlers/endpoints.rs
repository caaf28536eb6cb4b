//! Store for webhook endpoint configuration and delivery counters.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::instrument;
use uuid::Uuid;

use crate::db::errors::Result;
use crate::db::models::endpoints::{Endpoint, EndpointCreateDBRequest, EndpointUpdateDBRequest};
use crate::types::{EndpointId, OwnerId, abbrev_uuid};

/// Data access for endpoints.
///
/// Every mutation is atomic per record: registry edits and the worker's counter updates for the
/// same endpoint never lose each other's writes. Mutations return `Ok(None)` when the endpoint no
/// longer exists, which callers treat as "deleted concurrently" rather than as an error.
#[async_trait::async_trait]
pub trait EndpointStore: Send + Sync {
    /// Create a new endpoint
    async fn create(&self, request: &EndpointCreateDBRequest) -> Result<Endpoint>;

    /// Get an endpoint by ID, regardless of owner
    async fn get_by_id(&self, id: EndpointId) -> Result<Option<Endpoint>>;

    /// List an owner's endpoints, newest first
    async fn list_by_owner(&self, owner_id: OwnerId) -> Result<Vec<Endpoint>>;

    /// Number of the owner's endpoints with `active = true`
    async fn count_active_by_owner(&self, owner_id: OwnerId) -> Result<usize>;

    /// Apply a partial update
    async fn update(&self, id: EndpointId, request: &EndpointUpdateDBRequest) -> Result<Option<Endpoint>>;

    /// Delete an endpoint, returning whether it existed
    async fn delete(&self, id: EndpointId) -> Result<bool>;

    /// Replace an endpoint's signing secret
    async fn rotate_secret(&self, id: EndpointId, new_secret: String) -> Result<Option<Endpoint>>;

    /// Atomically bump `success_count` and stamp `last_triggered_at`
    async fn record_success(&self, id: EndpointId, at: DateTime<Utc>) -> Result<Option<Endpoint>>;

    /// Atomically bump `failure_count`
    async fn record_failure(&self, id: EndpointId) -> Result<Option<Endpoint>>;

    /// Flip the active flag without touching anything else
    async fn set_active(&self, id: EndpointId, active: bool) -> Result<Option<Endpoint>>;
}

/// DashMap-backed store. Each record sits behind its own shard lock, which gives the per-record
/// atomicity the trait requires.
#[derive(Debug, Default)]
pub struct InMemoryEndpoints {
    endpoints: DashMap<EndpointId, Endpoint>,
}

impl InMemoryEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    fn modify<F>(&self, id: EndpointId, f: F) -> Option<Endpoint>
    where
        F: FnOnce(&mut Endpoint),
    {
        let mut entry = self.endpoints.get_mut(&id)?;
        f(entry.value_mut());
        Some(entry.value().clone())
    }
}

#[async_trait::async_trait]
impl EndpointStore for InMemoryEndpoints {
    #[instrument(skip(self, request), fields(owner_id = %abbrev_uuid(&request.owner_id)), err)]
    async fn create(&self, request: &EndpointCreateDBRequest) -> Result<Endpoint> {
        let now = Utc::now();
        let endpoint = Endpoint {
            id: Uuid::new_v4(),
            owner_id: request.owner_id,
            scope_id: request.scope_id.clone(),
            url: request.url.clone(),
            secret: request.secret.clone(),
            subscribed_events: request.subscribed_events.clone(),
            headers: request.headers.clone(),
            timeout_ms: request.timeout_ms,
            retry_policy: request.retry_policy,
            active: true,
            description: request.description.clone(),
            success_count: 0,
            failure_count: 0,
            last_triggered_at: None,
            created_at: now,
            updated_at: now,
        };

        self.endpoints.insert(endpoint.id, endpoint.clone());
        Ok(endpoint)
    }

    async fn get_by_id(&self, id: EndpointId) -> Result<Option<Endpoint>> {
        Ok(self.endpoints.get(&id).map(|entry| entry.value().clone()))
    }

    async fn list_by_owner(&self, owner_id: OwnerId) -> Result<Vec<Endpoint>> {
        let mut endpoints: Vec<Endpoint> = self
            .endpoints
            .iter()
            .filter(|entry| entry.owner_id == owner_id)
            .map(|entry| entry.value().clone())
            .collect();
        endpoints.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(endpoints)
    }

    async fn count_active_by_owner(&self, owner_id: OwnerId) -> Result<usize> {
        Ok(self
            .endpoints
            .iter()
            .filter(|entry| entry.owner_id == owner_id && entry.active)
            .count())
    }

    #[instrument(skip(self, request), fields(endpoint_id = %abbrev_uuid(&id)), err)]
    async fn update(&self, id: EndpointId, request: &EndpointUpdateDBRequest) -> Result<Option<Endpoint>> {
        Ok(self.modify(id, |endpoint| {
            if let Some(url) = &request.url {
                endpoint.url = url.clone();
            }
            if let Some(scope_id) = &request.scope_id {
                endpoint.scope_id = scope_id.clone();
            }
            if let Some(events) = &request.subscribed_events {
                endpoint.subscribed_events = events.clone();
            }
            if let Some(headers) = &request.headers {
                endpoint.headers = headers.clone();
            }
            if let Some(timeout_ms) = request.timeout_ms {
                endpoint.timeout_ms = timeout_ms;
            }
            if let Some(policy) = request.retry_policy {
                endpoint.retry_policy = policy;
            }
            if let Some(active) = request.active {
                endpoint.active = active;
            }
            if let Some(description) = &request.description {
                endpoint.description = description.clone();
            }
            endpoint.updated_at = Utc::now();
        }))
    }

    #[instrument(skip(self), fields(endpoint_id = %abbrev_uuid(&id)), err)]
    async fn delete(&self, id: EndpointId) -> Result<bool> {
        Ok(self.endpoints.remove(&id).is_some())
    }

    #[instrument(skip(self, new_secret), fields(endpoint_id = %abbrev_uuid(&id)), err)]
    async fn rotate_secret(&self, id: EndpointId, new_secret: String) -> Result<Option<Endpoint>> {
        Ok(self.modify(id, |endpoint| {
            endpoint.secret = new_secret;
            endpoint.updated_at = Utc::now();
        }))
    }

    async fn record_success(&self, id: EndpointId, at: DateTime<Utc>) -> Result<Option<Endpoint>> {
        Ok(self.modify(id, |endpoint| {
            endpoint.success_count += 1;
            endpoint.last_triggered_at = Some(at);
        }))
    }

    async fn record_failure(&self, id: EndpointId) -> Result<Option<Endpoint>> {
        Ok(self.modify(id, |endpoint| {
            endpoint.failure_count += 1;
        }))
    }

    #[instrument(skip(self), fields(endpoint_id = %abbrev_uuid(&id)), err)]
    async fn set_active(&self, id: EndpointId, active: bool) -> Result<Option<Endpoint>> {
        Ok(self.modify(id, |endpoint| {
            endpoint.active = active;
            endpoint.updated_at = Utc::now();
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;

    use super::*;
    use crate::db::models::endpoints::RetryPolicy;
    use crate::webhooks::EventName;

    fn create_request(owner_id: OwnerId) -> EndpointCreateDBRequest {
        EndpointCreateDBRequest {
            owner_id,
            scope_id: None,
            url: "https://example.com/hook".to_string(),
            secret: "whsec_secret".to_string(),
            subscribed_events: BTreeSet::from([EventName::MessageReceived]),
            headers: BTreeMap::new(),
            timeout_ms: 5000,
            retry_policy: RetryPolicy::default(),
            description: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let store = InMemoryEndpoints::new();
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();

        let created = store.create(&create_request(owner)).await.unwrap();
        store.create(&create_request(other)).await.unwrap();

        assert!(created.active);
        assert_eq!(created.success_count, 0);

        let listed = store.list_by_owner(owner).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, created.id);
        assert_eq!(store.count_active_by_owner(owner).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_partial_update_keeps_counters() {
        let store = InMemoryEndpoints::new();
        let created = store.create(&create_request(Uuid::new_v4())).await.unwrap();
        store.record_failure(created.id).await.unwrap();

        let updated = store
            .update(
                created.id,
                &EndpointUpdateDBRequest {
                    url: Some("https://example.com/other".to_string()),
                    active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.url, "https://example.com/other");
        assert!(!updated.active);
        assert_eq!(updated.failure_count, 1);
        assert_eq!(updated.subscribed_events, created.subscribed_events);
    }

    #[tokio::test]
    async fn test_mutations_on_missing_endpoint() {
        let store = InMemoryEndpoints::new();
        let id = Uuid::new_v4();

        assert!(store.record_success(id, Utc::now()).await.unwrap().is_none());
        assert!(store.record_failure(id).await.unwrap().is_none());
        assert!(store.set_active(id, false).await.unwrap().is_none());
        assert!(!store.delete(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_counter_updates_are_not_lost() {
        let store = Arc::new(InMemoryEndpoints::new());
        let created = store.create(&create_request(Uuid::new_v4())).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..50 {
            let store = store.clone();
            let id = created.id;
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    store.record_success(id, Utc::now()).await.unwrap();
                } else {
                    store.record_failure(id).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let endpoint = store.get_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(endpoint.success_count, 25);
        assert_eq!(endpoint.failure_count, 25);
        assert!(endpoint.last_triggered_at.is_some());
    }
}
