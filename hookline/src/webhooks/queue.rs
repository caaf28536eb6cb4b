//! Delivery attempts, the bounded producer queue and the due-time heap.
//!
//! Producers push attempts through a [`DeliveryQueue`] without ever waiting. The worker owns the
//! receiving end and moves attempts into a [`RetryHeap`], popping whatever has become due on each
//! tick.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use uuid::Uuid;

use crate::db::models::endpoints::{Endpoint, RetryPolicy};
use crate::types::{DeliveryId, EndpointId};
use crate::webhooks::Envelope;

/// One try of delivering one envelope to one endpoint.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    /// Identifies the delivery of this envelope to this endpoint; stable across retries.
    pub id: DeliveryId,
    pub endpoint_id: EndpointId,
    pub envelope: Arc<Envelope>,
    /// 1-based
    pub attempt_number: u32,
    /// Policy captured when the envelope was first enqueued.
    pub retry_policy: RetryPolicy,
    pub due_at: Instant,
}

impl DeliveryAttempt {
    /// The first attempt for an envelope, due immediately.
    pub fn first(endpoint: &Endpoint, envelope: Arc<Envelope>) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint_id: endpoint.id,
            envelope,
            attempt_number: 1,
            retry_policy: endpoint.retry_policy,
            due_at: Instant::now(),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.retry_policy.max_retries
    }

    /// The attempt that follows this one failing, or `None` when retries are exhausted.
    pub fn next_retry(&self, now: Instant) -> Option<(DeliveryAttempt, Duration)> {
        let (attempt_number, delay) = self.retry_policy.next_attempt(self.attempt_number)?;
        Some((
            DeliveryAttempt {
                id: self.id,
                endpoint_id: self.endpoint_id,
                envelope: self.envelope.clone(),
                attempt_number,
                retry_policy: self.retry_policy,
                due_at: now + delay,
            },
            delay,
        ))
    }
}

/// Producer handle onto the worker's bounded intake channel.
#[derive(Debug, Clone)]
pub struct DeliveryQueue {
    tx: mpsc::Sender<DeliveryAttempt>,
}

impl DeliveryQueue {
    /// Create a queue and the receiver the worker consumes.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<DeliveryAttempt>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue the first attempt of `envelope` for `endpoint`.
    ///
    /// Never blocks. Returns `false` when the attempt was dropped because the queue is full or
    /// the worker has stopped.
    pub fn enqueue(&self, endpoint: &Endpoint, envelope: Arc<Envelope>) -> bool {
        let attempt = DeliveryAttempt::first(endpoint, envelope);

        match self.tx.try_send(attempt) {
            Ok(()) => {
                counter!("hookline_deliveries_enqueued_total").increment(1);
                true
            }
            Err(TrySendError::Full(attempt)) => {
                counter!("hookline_deliveries_dropped_total", "reason" => "queue_full").increment(1);
                tracing::warn!(
                    endpoint_id = %attempt.endpoint_id,
                    delivery_id = %attempt.id,
                    event = %attempt.envelope.event(),
                    "Delivery queue full, dropping attempt"
                );
                false
            }
            Err(TrySendError::Closed(attempt)) => {
                counter!("hookline_deliveries_dropped_total", "reason" => "queue_closed").increment(1);
                tracing::warn!(
                    endpoint_id = %attempt.endpoint_id,
                    delivery_id = %attempt.id,
                    event = %attempt.envelope.event(),
                    "Delivery worker stopped, dropping attempt"
                );
                false
            }
        }
    }
}

/// Heap entry ordered so that `BinaryHeap` pops the earliest due attempt first.
/// Ties are broken by insertion order.
#[derive(Debug)]
struct Scheduled {
    due_at: Instant,
    seq: u64,
    attempt: DeliveryAttempt,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due_at == other.due_at && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap
        other
            .due_at
            .cmp(&self.due_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of pending attempts keyed by due time.
#[derive(Debug, Default)]
pub struct RetryHeap {
    heap: BinaryHeap<Scheduled>,
    next_seq: u64,
}

impl RetryHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, attempt: DeliveryAttempt) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.heap.push(Scheduled {
            due_at: attempt.due_at,
            seq,
            attempt,
        });
    }

    /// Pop the earliest attempt if it is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<DeliveryAttempt> {
        if self.heap.peek()?.due_at > now {
            return None;
        }
        self.heap.pop().map(|scheduled| scheduled.attempt)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
