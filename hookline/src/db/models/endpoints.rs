//! Store models for webhook endpoint configuration.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{EndpointId, OwnerId, ScopeId};
use crate::webhooks::EventName;

/// Upper bound on a single retry delay, whatever the policy asks for.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// How a failed delivery is retried.
///
/// `max_retries` counts retries after the first try, so a policy with `max_retries = 3` allows
/// four attempts in total.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after attempt `failed_attempt` (1-based) failed:
    /// `initial_delay_ms * backoff_multiplier^(failed_attempt - 1)`, capped at [`MAX_RETRY_DELAY`].
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let cap = MAX_RETRY_DELAY.as_millis() as f64;
        if !millis.is_finite() || millis >= cap {
            return MAX_RETRY_DELAY;
        }
        Duration::from_millis(millis.round() as u64)
    }

    /// The attempt number and delay that follow a failure of `failed_attempt`, or `None` once
    /// retries are exhausted.
    pub fn next_attempt(&self, failed_attempt: u32) -> Option<(u32, Duration)> {
        if failed_attempt > self.max_retries {
            return None;
        }
        Some((failed_attempt + 1, self.delay_after(failed_attempt)))
    }
}

/// Store model for a tenant's webhook endpoint.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: EndpointId,
    pub owner_id: OwnerId,
    pub scope_id: Option<ScopeId>,
    pub url: String,
    pub secret: String,
    pub subscribed_events: BTreeSet<EventName>,
    pub headers: BTreeMap<String, String>,
    pub timeout_ms: u64,
    pub retry_policy: RetryPolicy,
    pub active: bool,
    pub description: Option<String>,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Endpoint {
    /// Check if this endpoint should receive the given event.
    pub fn accepts_event(&self, event: EventName) -> bool {
        self.active && self.subscribed_events.contains(&event)
    }

    /// Whether an event raised in `scope` is visible to this endpoint.
    ///
    /// Unscoped endpoints see every event of their owner; scoped endpoints only see events raised
    /// in exactly their scope.
    pub fn applies_to_scope(&self, scope: Option<&str>) -> bool {
        match (self.scope_id.as_deref(), scope) {
            (None, _) => true,
            (Some(own), Some(event_scope)) => own == event_scope,
            (Some(_), None) => false,
        }
    }

    pub fn total_deliveries(&self) -> u64 {
        self.success_count + self.failure_count
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Request to create a new endpoint. Fields are already validated.
#[derive(Debug, Clone)]
pub struct EndpointCreateDBRequest {
    pub owner_id: OwnerId,
    pub scope_id: Option<ScopeId>,
    pub url: String,
    pub secret: String,
    pub subscribed_events: BTreeSet<EventName>,
    pub headers: BTreeMap<String, String>,
    pub timeout_ms: u64,
    pub retry_policy: RetryPolicy,
    pub description: Option<String>,
}

/// Request to update an endpoint. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct EndpointUpdateDBRequest {
    pub url: Option<String>,
    pub scope_id: Option<Option<ScopeId>>,
    pub subscribed_events: Option<BTreeSet<EventName>>,
    pub headers: Option<BTreeMap<String, String>>,
    pub timeout_ms: Option<u64>,
    pub retry_policy: Option<RetryPolicy>,
    pub active: Option<bool>,
    pub description: Option<Option<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
        };

        assert_eq!(policy.next_attempt(1), Some((2, Duration::from_millis(1000))));
        assert_eq!(policy.next_attempt(2), Some((3, Duration::from_millis(2000))));
        assert_eq!(policy.next_attempt(3), Some((4, Duration::from_millis(4000))));
        // Attempt 4 is the last one
        assert_eq!(policy.next_attempt(4), None);
    }

    #[test]
    fn test_no_retries() {
        let policy = RetryPolicy {
            max_retries: 0,
            ..Default::default()
        };
        assert_eq!(policy.next_attempt(1), None);
    }

    #[test]
    fn test_fractional_multiplier() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay_ms: 100,
            backoff_multiplier: 1.5,
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(150));
        assert_eq!(policy.delay_after(3), Duration::from_millis(225));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_delay_ms: 60_000,
            backoff_multiplier: 10.0,
        };
        assert_eq!(policy.delay_after(10), MAX_RETRY_DELAY);
    }

    fn endpoint_with_scope(scope: Option<&str>) -> Endpoint {
        let now = Utc::now();
        Endpoint {
            id: uuid::Uuid::new_v4(),
            owner_id: uuid::Uuid::new_v4(),
            scope_id: scope.map(str::to_string),
            url: "https://example.com/hook".to_string(),
            secret: "whsec_test".to_string(),
            subscribed_events: BTreeSet::from([EventName::MessageReceived]),
            headers: BTreeMap::new(),
            timeout_ms: 5000,
            retry_policy: RetryPolicy::default(),
            active: true,
            description: None,
            success_count: 0,
            failure_count: 0,
            last_triggered_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_scope_matching() {
        let unscoped = endpoint_with_scope(None);
        assert!(unscoped.applies_to_scope(None));
        assert!(unscoped.applies_to_scope(Some("session-a")));

        let scoped = endpoint_with_scope(Some("session-a"));
        assert!(scoped.applies_to_scope(Some("session-a")));
        assert!(!scoped.applies_to_scope(Some("session-b")));
        assert!(!scoped.applies_to_scope(None));
    }

    #[test]
    fn test_accepts_event_requires_active() {
        let mut endpoint = endpoint_with_scope(None);
        assert!(endpoint.accepts_event(EventName::MessageReceived));
        assert!(!endpoint.accepts_event(EventName::MessageSent));

        endpoint.active = false;
        assert!(!endpoint.accepts_event(EventName::MessageReceived));
    }
}
