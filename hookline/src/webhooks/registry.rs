//! Tenant-facing management of webhook endpoints.
//!
//! Every operation takes the calling owner's id. Endpoints owned by someone else behave exactly
//! like endpoints that don't exist.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::instrument;

use crate::config::{PlansConfig, WebhookConfig};
use crate::db::handlers::{EndpointStore, PlanStore};
use crate::db::models::endpoints::{Endpoint, EndpointCreateDBRequest, EndpointUpdateDBRequest, RetryPolicy};
use crate::errors::{Error, Result};
use crate::types::{EndpointId, OwnerId, ScopeId, abbrev_uuid};
use crate::webhooks::delivery_log::{DeliveryLog, DeliveryLogEntry, DeliveryStats};
use crate::webhooks::dispatcher::EventDispatcher;
use crate::webhooks::sender::TestDeliveryResult;
use crate::webhooks::{signing, validation};

/// Caller-supplied configuration for a new endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EndpointSpec {
    pub url: String,
    /// Generated when absent
    pub secret: Option<String>,
    pub scope_id: Option<ScopeId>,
    pub subscribed_events: Vec<String>,
    pub headers: BTreeMap<String, String>,
    pub timeout_ms: Option<u64>,
    pub retry_policy: Option<RetryPolicy>,
    pub description: Option<String>,
}

/// Partial update of an endpoint. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct EndpointPatch {
    pub url: Option<String>,
    pub scope_id: Option<Option<ScopeId>>,
    pub subscribed_events: Option<Vec<String>>,
    pub headers: Option<BTreeMap<String, String>>,
    pub timeout_ms: Option<u64>,
    pub retry_policy: Option<RetryPolicy>,
    pub active: Option<bool>,
    pub description: Option<Option<String>>,
}

#[derive(Debug, Clone)]
pub struct EndpointCreated {
    pub endpoint: Endpoint,
    /// Result of the test ping sent right after creation. A failed test does not undo the create.
    pub test: TestDeliveryResult,
}

#[derive(Debug, Clone)]
pub struct EndpointUpdated {
    pub endpoint: Endpoint,
    /// Present when the URL or subscribed events changed.
    pub test: Option<TestDeliveryResult>,
}

/// Registry knobs taken from [`WebhookConfig`].
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub allow_http: bool,
    pub default_timeout_ms: u64,
    pub default_retry_policy: RetryPolicy,
    pub plans: PlansConfig,
}

impl From<&WebhookConfig> for RegistrySettings {
    fn from(config: &WebhookConfig) -> Self {
        Self {
            allow_http: config.allow_http,
            default_timeout_ms: config.default_timeout_ms,
            default_retry_policy: config.default_retry_policy,
            plans: config.plans.clone(),
        }
    }
}

#[derive(Clone)]
pub struct EndpointRegistry {
    store: Arc<dyn EndpointStore>,
    plans: Arc<dyn PlanStore>,
    log: Arc<DeliveryLog>,
    dispatcher: EventDispatcher,
    settings: RegistrySettings,
}

fn not_found(id: EndpointId) -> Error {
    Error::NotFound {
        resource: "Webhook endpoint".to_string(),
        id: id.to_string(),
    }
}

impl EndpointRegistry {
    pub fn new(
        store: Arc<dyn EndpointStore>,
        plans: Arc<dyn PlanStore>,
        log: Arc<DeliveryLog>,
        dispatcher: EventDispatcher,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            store,
            plans,
            log,
            dispatcher,
            settings,
        }
    }

    /// Fail with `QuotaExceeded` if the owner already holds as many active endpoints as their
    /// plan allows.
    async fn check_quota(&self, owner_id: OwnerId) -> Result<()> {
        let plan = self
            .plans
            .plan_for_owner(owner_id)
            .await?
            .unwrap_or(self.settings.plans.default_plan);
        let limit = self.settings.plans.limit_for(plan);
        let active = self.store.count_active_by_owner(owner_id).await?;

        if active >= limit {
            tracing::debug!(plan = %plan, limit, active, "Endpoint quota reached");
            return Err(Error::QuotaExceeded { plan, limit });
        }
        Ok(())
    }

    fn validate_secret(secret: &str) -> Result<()> {
        if secret.trim().is_empty() {
            return Err(Error::BadRequest {
                message: "Webhook secret must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Register a new endpoint and send it a test ping.
    #[instrument(skip(self, spec), fields(owner_id = %abbrev_uuid(&owner_id)), err)]
    pub async fn create(&self, owner_id: OwnerId, spec: EndpointSpec) -> Result<EndpointCreated> {
        let url = validation::validate_url(&spec.url, self.settings.allow_http)?;
        let subscribed_events = validation::parse_events(&spec.subscribed_events)?;
        let timeout_ms = spec.timeout_ms.unwrap_or(self.settings.default_timeout_ms);
        validation::validate_timeout(timeout_ms)?;
        let retry_policy = spec.retry_policy.unwrap_or(self.settings.default_retry_policy);
        validation::validate_retry_policy(&retry_policy)?;
        validation::validate_headers(&spec.headers)?;
        let secret = match spec.secret {
            Some(secret) => {
                Self::validate_secret(&secret)?;
                secret
            }
            None => signing::generate_secret(),
        };

        // Not atomic with the insert below: two concurrent creates can both pass.
        self.check_quota(owner_id).await?;

        let endpoint = self
            .store
            .create(&EndpointCreateDBRequest {
                owner_id,
                scope_id: spec.scope_id,
                url,
                secret,
                subscribed_events,
                headers: spec.headers,
                timeout_ms,
                retry_policy,
                description: spec.description,
            })
            .await?;

        tracing::info!(endpoint_id = %endpoint.id, url = %endpoint.url, "Webhook endpoint created");

        let test = self.dispatcher.test_delivery(&endpoint).await;
        if !test.success {
            tracing::info!(
                endpoint_id = %endpoint.id,
                error = ?test.error,
                "Test delivery to new endpoint failed"
            );
        }

        Ok(EndpointCreated { endpoint, test })
    }

    #[instrument(skip(self), fields(endpoint_id = %abbrev_uuid(&id), owner_id = %abbrev_uuid(&owner_id)), err)]
    pub async fn get(&self, id: EndpointId, owner_id: OwnerId) -> Result<Endpoint> {
        self.store
            .get_by_id(id)
            .await?
            .filter(|endpoint| endpoint.owner_id == owner_id)
            .ok_or_else(|| not_found(id))
    }

    /// The owner's endpoints, newest first. With a scope, only those applicable to it.
    #[instrument(skip(self), fields(owner_id = %abbrev_uuid(&owner_id)), err)]
    pub async fn list_for_owner(&self, owner_id: OwnerId, scope_id: Option<&str>) -> Result<Vec<Endpoint>> {
        let endpoints = self.store.list_by_owner(owner_id).await?;
        Ok(match scope_id {
            Some(scope) => endpoints
                .into_iter()
                .filter(|endpoint| endpoint.applies_to_scope(Some(scope)))
                .collect(),
            None => endpoints,
        })
    }

    #[instrument(skip(self, patch), fields(endpoint_id = %abbrev_uuid(&id), owner_id = %abbrev_uuid(&owner_id)), err)]
    pub async fn update(&self, id: EndpointId, owner_id: OwnerId, patch: EndpointPatch) -> Result<EndpointUpdated> {
        let current = self.get(id, owner_id).await?;

        let url = patch
            .url
            .as_deref()
            .map(|url| validation::validate_url(url, self.settings.allow_http))
            .transpose()?;
        let subscribed_events = patch
            .subscribed_events
            .as_deref()
            .map(validation::parse_events)
            .transpose()?;
        if let Some(timeout_ms) = patch.timeout_ms {
            validation::validate_timeout(timeout_ms)?;
        }
        if let Some(policy) = &patch.retry_policy {
            validation::validate_retry_policy(policy)?;
        }
        if let Some(headers) = &patch.headers {
            validation::validate_headers(headers)?;
        }

        if patch.active == Some(true) && !current.active {
            self.check_quota(owner_id).await?;
        }

        let retargeted = url.as_ref().is_some_and(|url| *url != current.url)
            || subscribed_events
                .as_ref()
                .is_some_and(|events| *events != current.subscribed_events);

        let endpoint = self
            .store
            .update(
                id,
                &EndpointUpdateDBRequest {
                    url,
                    scope_id: patch.scope_id,
                    subscribed_events,
                    headers: patch.headers,
                    timeout_ms: patch.timeout_ms,
                    retry_policy: patch.retry_policy,
                    active: patch.active,
                    description: patch.description,
                },
            )
            .await?
            .ok_or_else(|| not_found(id))?;

        if patch.active.is_some_and(|active| active != current.active) {
            tracing::info!(endpoint_id = %id, active = endpoint.active, "Webhook endpoint active flag changed");
        }

        let test = if retargeted {
            Some(self.dispatcher.test_delivery(&endpoint).await)
        } else {
            None
        };

        Ok(EndpointUpdated { endpoint, test })
    }

    /// Remove the endpoint and its delivery history. Pending attempts are dropped when they
    /// come due.
    #[instrument(skip(self), fields(endpoint_id = %abbrev_uuid(&id), owner_id = %abbrev_uuid(&owner_id)), err)]
    pub async fn delete(&self, id: EndpointId, owner_id: OwnerId) -> Result<()> {
        self.get(id, owner_id).await?;
        if !self.store.delete(id).await? {
            return Err(not_found(id));
        }
        self.log.remove(id);
        tracing::info!(endpoint_id = %id, "Webhook endpoint deleted");
        Ok(())
    }

    /// Replace the signing secret, returning the new one. Attempts already in flight keep the
    /// old signature; every later attempt is signed with the new secret.
    #[instrument(skip(self), fields(endpoint_id = %abbrev_uuid(&id), owner_id = %abbrev_uuid(&owner_id)), err)]
    pub async fn regenerate_secret(&self, id: EndpointId, owner_id: OwnerId) -> Result<String> {
        self.get(id, owner_id).await?;
        let secret = signing::generate_secret();
        self.store
            .rotate_secret(id, secret.clone())
            .await?
            .ok_or_else(|| not_found(id))?;
        tracing::info!(endpoint_id = %id, "Webhook secret rotated");
        Ok(secret)
    }

    pub async fn stats(&self, id: EndpointId, owner_id: OwnerId) -> Result<DeliveryStats> {
        let endpoint = self.get(id, owner_id).await?;
        Ok(self.log.stats(&endpoint))
    }

    pub async fn recent_deliveries(&self, id: EndpointId, owner_id: OwnerId, limit: usize) -> Result<Vec<DeliveryLogEntry>> {
        self.get(id, owner_id).await?;
        Ok(self.log.recent(id, limit))
    }

    /// Send a test ping to one of the owner's endpoints.
    pub async fn test(&self, id: EndpointId, owner_id: OwnerId) -> Result<TestDeliveryResult> {
        let endpoint = self.get(id, owner_id).await?;
        Ok(self.dispatcher.test_delivery(&endpoint).await)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use uuid::Uuid;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::db::handlers::{InMemoryEndpoints, InMemoryPlans};
    use crate::db::models::plans::Plan;
    use crate::webhooks::queue::DeliveryQueue;
    use crate::webhooks::sender;

    // Nothing listens here, so test pings fail fast.
    const UNREACHABLE: &str = "http://127.0.0.1:1/hook";

    struct Setup {
        store: Arc<InMemoryEndpoints>,
        plans: Arc<InMemoryPlans>,
        log: Arc<DeliveryLog>,
        registry: EndpointRegistry,
    }

    fn setup() -> Setup {
        let store = Arc::new(InMemoryEndpoints::new());
        let plans = Arc::new(InMemoryPlans::new());
        let log = Arc::new(DeliveryLog::new(100));
        let (queue, _rx) = DeliveryQueue::channel(10);
        let dispatcher = EventDispatcher::new(
            store.clone(),
            queue,
            sender::build_http_client().unwrap(),
            Duration::from_secs(2),
        );
        let registry = EndpointRegistry::new(
            store.clone(),
            plans.clone(),
            log.clone(),
            dispatcher,
            RegistrySettings::from(&WebhookConfig::default()),
        );
        Setup {
            store,
            plans,
            log,
            registry,
        }
    }

    fn spec(url: &str, events: &[&str]) -> EndpointSpec {
        EndpointSpec {
            url: url.to_string(),
            subscribed_events: events.iter().map(|e| e.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_applies_defaults_and_pings() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("X-Webhook-Event", "webhook.test"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let s = setup();
        let owner = Uuid::new_v4();
        let created = s
            .registry
            .create(owner, spec(&mock_server.uri(), &["message.received"]))
            .await
            .unwrap();

        assert!(created.test.success);
        let endpoint = created.endpoint;
        assert!(endpoint.active);
        assert!(endpoint.secret.starts_with(signing::SECRET_PREFIX));
        assert_eq!(endpoint.timeout_ms, 5000);
        assert_eq!(endpoint.retry_policy, RetryPolicy::default());
        // Test pings are not counted
        assert_eq!(endpoint.total_deliveries(), 0);
        assert_eq!(s.log.len(endpoint.id), 0);
    }

    #[tokio::test]
    async fn test_create_succeeds_when_test_ping_fails() {
        let s = setup();
        let created = s
            .registry
            .create(Uuid::new_v4(), spec(UNREACHABLE, &["message.sent"]))
            .await
            .unwrap();
        assert!(!created.test.success);
        assert!(created.test.error.is_some());
        assert!(s.store.get_by_id(created.endpoint.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_create_validation_errors() {
        let s = setup();
        let owner = Uuid::new_v4();

        let cases = vec![
            spec("not-a-url", &["message.sent"]),
            spec("ftp://example.com", &["message.sent"]),
            spec(UNREACHABLE, &[]),
            spec(UNREACHABLE, &["message.deleted"]),
            EndpointSpec {
                secret: Some("   ".to_string()),
                ..spec(UNREACHABLE, &["message.sent"])
            },
            EndpointSpec {
                timeout_ms: Some(0),
                ..spec(UNREACHABLE, &["message.sent"])
            },
            EndpointSpec {
                headers: BTreeMap::from([("X-Webhook-Signature".to_string(), "x".to_string())]),
                ..spec(UNREACHABLE, &["message.sent"])
            },
        ];

        for case in cases {
            let err = s.registry.create(owner, case.clone()).await.unwrap_err();
            assert!(matches!(err, Error::BadRequest { .. }), "{case:?} gave {err:?}");
        }
        assert!(s.store.list_by_owner(owner).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_quota_counts_only_active_endpoints() {
        let s = setup();
        let owner = Uuid::new_v4();

        let first = s
            .registry
            .create(owner, spec(UNREACHABLE, &["message.sent"]))
            .await
            .unwrap()
            .endpoint;

        // Free plan allows a single active endpoint
        let err = s
            .registry
            .create(owner, spec(UNREACHABLE, &["message.sent"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::QuotaExceeded {
                plan: Plan::Free,
                limit: 1
            }
        ));

        // Deactivating frees the slot
        s.registry
            .update(
                first.id,
                owner,
                EndpointPatch {
                    active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        s.registry
            .create(owner, spec(UNREACHABLE, &["message.sent"]))
            .await
            .unwrap();

        // Reactivating the first one is now over quota
        let err = s
            .registry
            .update(
                first.id,
                owner,
                EndpointPatch {
                    active: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { .. }));

        // An upgraded owner has room
        s.plans.set_plan(owner, Plan::Basic);
        let reactivated = s
            .registry
            .update(
                first.id,
                owner,
                EndpointPatch {
                    active: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(reactivated.endpoint.active);
        assert!(reactivated.test.is_none());
    }

    #[tokio::test]
    async fn test_reactivation_keeps_counters() {
        let s = setup();
        let owner = Uuid::new_v4();
        let endpoint = s
            .registry
            .create(owner, spec(UNREACHABLE, &["message.sent"]))
            .await
            .unwrap()
            .endpoint;

        s.store.record_failure(endpoint.id).await.unwrap();
        s.store.record_success(endpoint.id, Utc::now()).await.unwrap();
        s.store.set_active(endpoint.id, false).await.unwrap();

        let updated = s
            .registry
            .update(
                endpoint.id,
                owner,
                EndpointPatch {
                    active: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .endpoint;
        assert!(updated.active);
        assert_eq!(updated.success_count, 1);
        assert_eq!(updated.failure_count, 1);
    }

    #[tokio::test]
    async fn test_retarget_reruns_test() {
        let s = setup();
        let owner = Uuid::new_v4();
        let endpoint = s
            .registry
            .create(owner, spec(UNREACHABLE, &["message.sent"]))
            .await
            .unwrap()
            .endpoint;

        let updated = s
            .registry
            .update(
                endpoint.id,
                owner,
                EndpointPatch {
                    subscribed_events: Some(vec!["message.read".to_string()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(updated.test.is_some());

        let updated = s
            .registry
            .update(
                endpoint.id,
                owner,
                EndpointPatch {
                    description: Some(Some("orders".to_string())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(updated.test.is_none());
        assert_eq!(updated.endpoint.description.as_deref(), Some("orders"));
    }

    #[tokio::test]
    async fn test_cross_tenant_access_is_not_found() {
        let s = setup();
        let owner = Uuid::new_v4();
        let intruder = Uuid::new_v4();
        let endpoint = s
            .registry
            .create(owner, spec(UNREACHABLE, &["message.sent"]))
            .await
            .unwrap()
            .endpoint;

        assert!(matches!(
            s.registry.get(endpoint.id, intruder).await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            s.registry.delete(endpoint.id, intruder).await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            s.registry.regenerate_secret(endpoint.id, intruder).await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            s.registry.stats(endpoint.id, intruder).await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            s.registry.get(Uuid::new_v4(), owner).await,
            Err(Error::NotFound { .. })
        ));

        // Still there for the real owner
        assert!(s.registry.get(endpoint.id, owner).await.is_ok());
    }

    #[tokio::test]
    async fn test_list_for_owner_by_scope() {
        let s = setup();
        let owner = Uuid::new_v4();
        s.plans.set_plan(owner, Plan::Premium);

        let unscoped = s
            .registry
            .create(owner, spec(UNREACHABLE, &["message.sent"]))
            .await
            .unwrap()
            .endpoint;
        let scoped = s
            .registry
            .create(
                owner,
                EndpointSpec {
                    scope_id: Some("session-a".to_string()),
                    ..spec(UNREACHABLE, &["message.sent"])
                },
            )
            .await
            .unwrap()
            .endpoint;
        s.registry
            .create(
                owner,
                EndpointSpec {
                    scope_id: Some("session-b".to_string()),
                    ..spec(UNREACHABLE, &["message.sent"])
                },
            )
            .await
            .unwrap();

        assert_eq!(s.registry.list_for_owner(owner, None).await.unwrap().len(), 3);

        let ids: Vec<_> = s
            .registry
            .list_for_owner(owner, Some("session-a"))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&unscoped.id));
        assert!(ids.contains(&scoped.id));
    }

    #[tokio::test]
    async fn test_delete_removes_log_and_regenerate_secret() {
        let s = setup();
        let owner = Uuid::new_v4();
        let endpoint = s
            .registry
            .create(owner, spec(UNREACHABLE, &["message.sent"]))
            .await
            .unwrap()
            .endpoint;

        let secret = s.registry.regenerate_secret(endpoint.id, owner).await.unwrap();
        assert_ne!(secret, endpoint.secret);
        assert_eq!(s.registry.get(endpoint.id, owner).await.unwrap().secret, secret);

        s.log.record(
            endpoint.id,
            DeliveryLogEntry {
                timestamp: Utc::now(),
                success: true,
                error: None,
                attempt_number: 1,
                status_code: Some(200),
                response_time_ms: 3,
            },
        );
        assert_eq!(s.registry.recent_deliveries(endpoint.id, owner, 10).await.unwrap().len(), 1);

        s.registry.delete(endpoint.id, owner).await.unwrap();
        assert_eq!(s.log.len(endpoint.id), 0);
        assert!(matches!(
            s.registry.get(endpoint.id, owner).await,
            Err(Error::NotFound { .. })
        ));
    }
}
