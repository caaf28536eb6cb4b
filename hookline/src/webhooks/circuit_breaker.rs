//! Deactivation of chronically failing endpoints.
//!
//! The breaker looks at an endpoint's *lifetime* success/failure counters, not a sliding window.
//! An endpoint that was reliable for a long time and then starts failing therefore trips late,
//! because its old successes dilute the failure rate. Once tripped the endpoint stays inactive
//! until its owner re-enables it; counters are never reset.

use std::sync::Arc;

use metrics::counter;

use crate::config::CircuitBreakerConfig;
use crate::db::errors::Result;
use crate::db::handlers::EndpointStore;
use crate::db::models::endpoints::Endpoint;

pub struct CircuitBreaker {
    store: Arc<dyn EndpointStore>,
    failure_threshold: u64,
    failure_rate_threshold: f64,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn EndpointStore>, config: &CircuitBreakerConfig) -> Self {
        Self {
            store,
            failure_threshold: config.failure_threshold,
            failure_rate_threshold: config.failure_rate_threshold,
        }
    }

    /// Whether the endpoint's counters cross the trip thresholds.
    pub fn should_trip(&self, endpoint: &Endpoint) -> bool {
        let total = endpoint.total_deliveries();
        if total == 0 || total < self.failure_threshold {
            return false;
        }
        endpoint.failure_count as f64 / total as f64 >= self.failure_rate_threshold
    }

    /// Evaluate an endpoint after a recorded outcome, deactivating it when it trips.
    ///
    /// Returns `true` if this call deactivated the endpoint.
    pub async fn evaluate(&self, endpoint: &Endpoint) -> Result<bool> {
        if !endpoint.active || !self.should_trip(endpoint) {
            return Ok(false);
        }

        match self.store.set_active(endpoint.id, false).await? {
            Some(_) => {
                counter!("hookline_endpoints_tripped_total").increment(1);
                tracing::warn!(
                    endpoint_id = %endpoint.id,
                    owner_id = %endpoint.owner_id,
                    success_count = endpoint.success_count,
                    failure_count = endpoint.failure_count,
                    "Circuit breaker tripped, endpoint deactivated"
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
