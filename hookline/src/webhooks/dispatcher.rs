//! Fan-out of domain events to subscribed endpoints.

use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use crate::db::handlers::EndpointStore;
use crate::db::models::endpoints::Endpoint;
use crate::errors::{Error, Result};
use crate::types::{OwnerId, abbrev_uuid};
use crate::webhooks::queue::DeliveryQueue;
use crate::webhooks::sender::{self, TestDeliveryResult};
use crate::webhooks::{Envelope, EventName};

/// Entry point for producers raising events.
///
/// `trigger` only enqueues: delivery outcomes are never reported back to the caller.
#[derive(Clone)]
pub struct EventDispatcher {
    store: Arc<dyn EndpointStore>,
    queue: DeliveryQueue,
    client: reqwest::Client,
    test_timeout: Duration,
}

impl EventDispatcher {
    pub fn new(
        store: Arc<dyn EndpointStore>,
        queue: DeliveryQueue,
        client: reqwest::Client,
        test_timeout: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            client,
            test_timeout,
        }
    }

    /// Enqueue one envelope per active endpoint of `owner_id` that is subscribed to `event` and
    /// applies to `scope_id`. Returns the number of attempts enqueued.
    #[instrument(skip(self, data), fields(owner_id = %abbrev_uuid(&owner_id), event = %event), err)]
    pub async fn trigger(
        &self,
        event: EventName,
        data: serde_json::Value,
        owner_id: OwnerId,
        scope_id: Option<&str>,
    ) -> Result<usize> {
        let endpoints: Vec<Endpoint> = self
            .store
            .list_by_owner(owner_id)
            .await?
            .into_iter()
            .filter(|endpoint| endpoint.accepts_event(event) && endpoint.applies_to_scope(scope_id))
            .collect();

        if endpoints.is_empty() {
            tracing::debug!("No endpoints subscribed to event");
            return Ok(0);
        }

        // Every matching endpoint receives the same envelope, so the bytes (and timestamp) agree.
        let envelope = Arc::new(Envelope::new(event, scope_id.map(str::to_string), data));

        let enqueued = endpoints
            .iter()
            .filter(|endpoint| self.queue.enqueue(endpoint, envelope.clone()))
            .count();

        tracing::debug!(matched = endpoints.len(), enqueued, "Event enqueued for delivery");
        Ok(enqueued)
    }

    /// Like [`trigger`](Self::trigger), for event names arriving as strings.
    pub async fn trigger_named(
        &self,
        event: &str,
        data: serde_json::Value,
        owner_id: OwnerId,
        scope_id: Option<&str>,
    ) -> Result<usize> {
        let event = event.parse::<EventName>().map_err(|_| Error::BadRequest {
            message: format!("Invalid event type: {}. Valid types are: {}", event, EventName::catalog()),
        })?;
        self.trigger(event, data, owner_id, scope_id).await
    }

    /// Send one synthetic `webhook.test` delivery right now, bypassing the queue.
    ///
    /// Counters, the delivery log and retry state are left untouched, and the endpoint's
    /// `active` flag is ignored.
    #[instrument(skip(self, endpoint), fields(endpoint_id = %abbrev_uuid(&endpoint.id)))]
    pub async fn test_delivery(&self, endpoint: &Endpoint) -> TestDeliveryResult {
        let envelope = Envelope::test_ping(endpoint.scope_id.clone());
        let request = match sender::build_request(endpoint, &envelope, uuid::Uuid::new_v4(), 1, self.test_timeout) {
            Ok(request) => request,
            Err(e) => {
                return TestDeliveryResult {
                    success: false,
                    response_time_ms: 0,
                    status_code: None,
                    error: Some(format!("Failed to serialize test payload: {e}")),
                };
            }
        };

        let result = TestDeliveryResult::from(sender::send(&self.client, request).await);
        tracing::debug!(
            success = result.success,
            status_code = ?result.status_code,
            response_time_ms = result.response_time_ms,
            "Test delivery finished"
        );
        result
    }
}
