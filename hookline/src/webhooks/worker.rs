//! Webhook delivery worker: schedule, sign, send, record.
//!
//! ```text
//! worker.tick()
//!   ├─ collect_incoming()
//!   │    └─ incoming.try_recv() → heap.push()     // attempts from DeliveryQueue
//!   ├─ dispatch_due()
//!   │    └─ for each attempt due now:
//!   │         ├─ store: get_by_id()               // missing or inactive → abandon silently
//!   │         ├─ CPU: build_request()              // canonical JSON + HMAC-SHA256
//!   │         └─ send_tx.try_send(job) ───────────────────────────┐
//!   │                                                             │
//!   │              ┌──────────────────────────────────────────────┘
//!   │              ▼
//!   │         run_sender (spawned task):
//!   │              ├─ recv from send_rx
//!   │              ├─ acquire semaphore permit (caps concurrency)
//!   │              ├─ spawn HTTP POST
//!   │              └─ result_tx.send(result) ────────────────────┐
//!   │                                                             │
//!   └─ drain_results()                                            │
//!        ├─ result_rx.try_recv() ◄───────────────────────────────┘
//!        └─ for each result:
//!             ├─ Success → store: record_success() + log entry
//!             ├─ Failure → store: record_failure() + log entry + schedule retry or abandon
//!             └─ circuit breaker on the updated endpoint
//! ```
//!
//! The worker is the only owner of pending attempts. The sender task has no store access, only
//! HTTP in and result out. On shutdown, pending attempts are dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use tokio::sync::{Semaphore, mpsc, mpsc::error::TrySendError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::WebhookConfig;
use crate::db::handlers::EndpointStore;
use crate::webhooks::circuit_breaker::CircuitBreaker;
use crate::webhooks::delivery_log::{DeliveryLog, DeliveryLogEntry};
use crate::webhooks::queue::{DeliveryAttempt, RetryHeap};
use crate::webhooks::sender::{self, DeliveryRequest, SendOutcome, SendReport};

// --- Channel types ---

#[derive(Debug)]
struct SendJob {
    attempt: DeliveryAttempt,
    request: DeliveryRequest,
}

#[derive(Debug)]
struct SendResult {
    attempt: DeliveryAttempt,
    report: SendReport,
}

// --- Worker ---

pub struct DeliveryWorker {
    store: Arc<dyn EndpointStore>,
    log: Arc<DeliveryLog>,
    breaker: CircuitBreaker,
    incoming: mpsc::Receiver<DeliveryAttempt>,
    pending: RetryHeap,
    send_tx: mpsc::Sender<SendJob>,
    result_rx: mpsc::Receiver<SendResult>,
    in_flight: usize,
}

impl DeliveryWorker {
    /// Create a worker and spawn its background sender task.
    pub fn spawn(
        store: Arc<dyn EndpointStore>,
        log: Arc<DeliveryLog>,
        incoming: mpsc::Receiver<DeliveryAttempt>,
        http_client: reqwest::Client,
        config: &WebhookConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let (send_tx, send_rx) = mpsc::channel::<SendJob>(config.channel_capacity);
        let (result_tx, result_rx) = mpsc::channel(config.channel_capacity);

        tokio::spawn(run_sender(send_rx, result_tx, http_client, config.max_concurrent_sends, shutdown));

        Self {
            breaker: CircuitBreaker::new(store.clone(), &config.circuit_breaker),
            store,
            log,
            incoming,
            pending: RetryHeap::new(),
            send_tx,
            result_rx,
            in_flight: 0,
        }
    }

    /// Attempts waiting for their due time.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Attempts handed to the sender whose results have not been drained yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Run ticks until `shutdown` is cancelled.
    pub async fn run(mut self, tick_interval: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(tick_interval = ?tick_interval, "Webhook delivery worker started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => self.tick().await,
            }
        }

        if !self.pending.is_empty() || self.in_flight > 0 {
            tracing::info!(
                pending = self.pending.len(),
                in_flight = self.in_flight,
                "Webhook delivery worker stopping, dropping undelivered attempts"
            );
        }
        tracing::debug!("Webhook delivery worker exited");
    }

    /// Run one delivery cycle: collect → dispatch due → process results.
    pub async fn tick(&mut self) {
        self.collect_incoming();
        self.dispatch_due().await;
        self.drain_results().await;
    }

    fn collect_incoming(&mut self) {
        let mut collected = 0u32;
        while let Ok(attempt) = self.incoming.try_recv() {
            self.pending.push(attempt);
            collected += 1;
        }
        if collected > 0 {
            tracing::debug!(count = collected, "Collected new delivery attempts");
        }
    }

    /// Pop every due attempt, re-check its endpoint, sign it and push to the sender channel.
    async fn dispatch_due(&mut self) {
        let now = Instant::now();

        while let Some(attempt) = self.pending.pop_due(now) {
            // Cancellation is cooperative: deletion or deactivation is noticed here.
            let endpoint = match self.store.get_by_id(attempt.endpoint_id).await {
                Ok(Some(endpoint)) if endpoint.active => endpoint,
                Ok(Some(_)) => {
                    counter!("hookline_deliveries_abandoned_total", "reason" => "endpoint_inactive").increment(1);
                    tracing::debug!(
                        endpoint_id = %attempt.endpoint_id,
                        delivery_id = %attempt.id,
                        attempt = attempt.attempt_number,
                        "Endpoint inactive, abandoning attempt"
                    );
                    continue;
                }
                Ok(None) => {
                    counter!("hookline_deliveries_abandoned_total", "reason" => "endpoint_deleted").increment(1);
                    tracing::debug!(
                        endpoint_id = %attempt.endpoint_id,
                        delivery_id = %attempt.id,
                        attempt = attempt.attempt_number,
                        "Endpoint deleted, abandoning attempt"
                    );
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, endpoint_id = %attempt.endpoint_id, "Failed to load endpoint, deferring attempt");
                    self.pending.push(attempt);
                    break;
                }
            };

            let request = match sender::build_request(
                &endpoint,
                &attempt.envelope,
                attempt.id,
                attempt.attempt_number,
                endpoint.timeout(),
            ) {
                Ok(request) => request,
                Err(e) => {
                    counter!("hookline_deliveries_abandoned_total", "reason" => "serialization").increment(1);
                    tracing::warn!(error = %e, delivery_id = %attempt.id, "Failed to serialize envelope, abandoning attempt");
                    continue;
                }
            };

            match self.send_tx.try_send(SendJob { attempt, request }) {
                Ok(()) => self.in_flight += 1,
                Err(TrySendError::Full(job)) => {
                    // Sender is saturated; pick it up again next tick.
                    tracing::debug!(delivery_id = %job.attempt.id, "Sender channel full, deferring attempt");
                    self.pending.push(job.attempt);
                    break;
                }
                Err(TrySendError::Closed(job)) => {
                    tracing::warn!(delivery_id = %job.attempt.id, "Sender task stopped, dropping attempt");
                    break;
                }
            }
        }
    }

    /// Drain completed send results and record their outcomes.
    async fn drain_results(&mut self) {
        let mut drained = 0u32;
        while let Ok(result) = self.result_rx.try_recv() {
            drained += 1;
            self.in_flight = self.in_flight.saturating_sub(1);
            self.process_result(result).await;
        }

        if drained > 0 {
            tracing::debug!(count = drained, "Drained webhook send results");
        }
    }

    async fn process_result(&mut self, result: SendResult) {
        let SendResult { attempt, report } = result;
        let now = Utc::now();
        let entry = DeliveryLogEntry {
            timestamp: now,
            success: report.outcome.is_success(),
            error: report.outcome.error().map(str::to_string),
            attempt_number: attempt.attempt_number,
            status_code: report.outcome.status_code(),
            response_time_ms: report.response_time_ms(),
        };

        let recorded = match &report.outcome {
            SendOutcome::Success { .. } => self.store.record_success(attempt.endpoint_id, now).await,
            SendOutcome::Failure { .. } => self.store.record_failure(attempt.endpoint_id).await,
        };

        // The endpoint may have been deleted while this send was in flight. Nothing is
        // recorded and nothing is retried in that case. A store error is not a deletion: the
        // outcome still drives retries, only the breaker is skipped.
        let endpoint = match recorded {
            Ok(Some(endpoint)) => Some(endpoint),
            Ok(None) => {
                tracing::debug!(
                    endpoint_id = %attempt.endpoint_id,
                    delivery_id = %attempt.id,
                    "Endpoint deleted while delivery was in flight, discarding result"
                );
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, endpoint_id = %attempt.endpoint_id, "Failed to record delivery outcome");
                None
            }
        };

        self.log.record(attempt.endpoint_id, entry);

        match report.outcome {
            SendOutcome::Success { status_code } => {
                counter!("hookline_deliveries_total", "outcome" => "success").increment(1);
                tracing::debug!(
                    endpoint_id = %attempt.endpoint_id,
                    delivery_id = %attempt.id,
                    attempt = attempt.attempt_number,
                    status = status_code,
                    "Webhook delivered successfully"
                );
            }
            SendOutcome::Failure { status_code, ref error } => {
                counter!("hookline_deliveries_total", "outcome" => "failure").increment(1);
                match attempt.next_retry(Instant::now()) {
                    Some((retry, delay)) => {
                        tracing::info!(
                            endpoint_id = %attempt.endpoint_id,
                            delivery_id = %attempt.id,
                            attempt = attempt.attempt_number,
                            next_attempt = retry.attempt_number,
                            delay_ms = delay.as_millis() as u64,
                            status_code = ?status_code,
                            error = %error,
                            "Webhook delivery failed, scheduling retry"
                        );
                        self.pending.push(retry);
                    }
                    None => {
                        counter!("hookline_deliveries_abandoned_total", "reason" => "retries_exhausted").increment(1);
                        tracing::warn!(
                            endpoint_id = %attempt.endpoint_id,
                            owner_id = ?endpoint.as_ref().map(|e| e.owner_id),
                            delivery_id = %attempt.id,
                            attempt = attempt.attempt_number,
                            event = %attempt.envelope.event(),
                            status_code = ?status_code,
                            error = %error,
                            "Webhook delivery failed, retries exhausted"
                        );
                    }
                }
            }
        }

        let Some(endpoint) = endpoint else {
            return;
        };
        if let Err(e) = self.breaker.evaluate(&endpoint).await {
            tracing::warn!(error = %e, endpoint_id = %endpoint.id, "Failed to evaluate circuit breaker");
        }
    }
}

// --- Sender task ---

/// Long-lived task that receives signed requests and performs HTTP delivery.
async fn run_sender(
    mut rx: mpsc::Receiver<SendJob>,
    result_tx: mpsc::Sender<SendResult>,
    http_client: reqwest::Client,
    max_concurrent_sends: usize,
    shutdown: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(max_concurrent_sends));

    loop {
        let job = tokio::select! {
            job = rx.recv() => {
                match job {
                    Some(j) => j,
                    None => {
                        tracing::debug!("Webhook sender channel closed, shutting down");
                        break;
                    }
                }
            }
            _ = shutdown.cancelled() => {
                tracing::debug!("Webhook sender received shutdown signal");
                break;
            }
        };

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                tracing::warn!("Webhook sender semaphore closed");
                break;
            }
        };

        let client = http_client.clone();
        let tx = result_tx.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let SendJob { attempt, request } = job;

            tracing::debug!(
                delivery_id = %attempt.id,
                url = %request.url,
                attempt = attempt.attempt_number,
                "Sending webhook HTTP request"
            );

            let report = sender::send(&client, request).await;
            let delivery_id = attempt.id;

            if let Err(e) = tx.send(SendResult { attempt, report }).await {
                tracing::warn!(delivery_id = %delivery_id, "Failed to send webhook result back: {}", e);
            }
        });
    }

    tracing::debug!("Webhook sender task exited");
}
