//! Bounded per-endpoint delivery history and the stats derived from it.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::db::models::endpoints::Endpoint;
use crate::types::EndpointId;

/// One observed delivery outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryLogEntry {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempt_number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub response_time_ms: u64,
}

/// Delivery statistics for one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryStats {
    pub total_deliveries: u64,
    pub successful_deliveries: u64,
    pub failed_deliveries: u64,
    /// Percentage of successful deliveries, 0 when nothing was delivered yet
    pub success_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_delivery: Option<DateTime<Utc>>,
    pub active: bool,
}

/// In-memory delivery history, newest entries at the back of each endpoint's deque.
#[derive(Debug)]
pub struct DeliveryLog {
    entries: DashMap<EndpointId, VecDeque<DeliveryLogEntry>>,
    max_entries_per_endpoint: usize,
}

impl DeliveryLog {
    pub fn new(max_entries_per_endpoint: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries_per_endpoint: max_entries_per_endpoint.max(1),
        }
    }

    /// Append an entry, dropping the oldest ones beyond the retention cap.
    pub fn record(&self, endpoint_id: EndpointId, entry: DeliveryLogEntry) {
        let mut log = self.entries.entry(endpoint_id).or_default();
        log.push_back(entry);
        while log.len() > self.max_entries_per_endpoint {
            log.pop_front();
        }
    }

    /// Most recent entries first, at most `limit` of them.
    pub fn recent(&self, endpoint_id: EndpointId, limit: usize) -> Vec<DeliveryLogEntry> {
        self.entries
            .get(&endpoint_id)
            .map(|log| log.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn latest(&self, endpoint_id: EndpointId) -> Option<DeliveryLogEntry> {
        self.entries.get(&endpoint_id).and_then(|log| log.back().cloned())
    }

    pub fn len(&self, endpoint_id: EndpointId) -> usize {
        self.entries.get(&endpoint_id).map(|log| log.len()).unwrap_or(0)
    }

    /// Drop an endpoint's whole history (the endpoint was deleted).
    pub fn remove(&self, endpoint_id: EndpointId) {
        self.entries.remove(&endpoint_id);
    }

    /// Remove entries older than `max_age`. Returns the number of entries removed.
    pub fn prune_older_than(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut removed = 0;

        for mut log in self.entries.iter_mut() {
            // Entries are appended in time order, so the stale ones sit at the front.
            while log.front().is_some_and(|entry| entry.timestamp < cutoff) {
                log.pop_front();
                removed += 1;
            }
        }
        self.entries.retain(|_, log| !log.is_empty());

        removed
    }

    /// Stats from the endpoint's lifetime counters plus the newest log entry's timestamp.
    pub fn stats(&self, endpoint: &Endpoint) -> DeliveryStats {
        let total = endpoint.total_deliveries();
        let success_rate = if total == 0 {
            0.0
        } else {
            endpoint.success_count as f64 / total as f64 * 100.0
        };

        DeliveryStats {
            total_deliveries: total,
            successful_deliveries: endpoint.success_count,
            failed_deliveries: endpoint.failure_count,
            success_rate,
            last_delivery: self.latest(endpoint.id).map(|entry| entry.timestamp),
            active: endpoint.active,
        }
    }
}
