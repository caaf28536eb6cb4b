//! Assembly of the delivery engine and its background tasks.
//!
//! [`WebhookEngine::start`] builds the queue, the worker and the log-maintenance task around the
//! given stores and hands back the two producer-facing handles: the [`EndpointRegistry`] and the
//! [`EventDispatcher`]. Dropping the engine cancels its tasks; [`WebhookEngine::shutdown`] also
//! waits for them to finish.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::config::WebhookConfig;
use crate::db::handlers::{EndpointStore, PlanStore};
use crate::webhooks::delivery_log::DeliveryLog;
use crate::webhooks::dispatcher::EventDispatcher;
use crate::webhooks::queue::DeliveryQueue;
use crate::webhooks::registry::{EndpointRegistry, RegistrySettings};
use crate::webhooks::sender;
use crate::webhooks::worker::DeliveryWorker;

pub struct WebhookEngine {
    registry: EndpointRegistry,
    dispatcher: EventDispatcher,
    log: Arc<DeliveryLog>,
    background_tasks: Vec<JoinHandle<()>>,
    shutdown_token: CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<DropGuard>,
}

impl WebhookEngine {
    /// Start the engine. Must be called from within a Tokio runtime.
    pub fn start(
        store: Arc<dyn EndpointStore>,
        plans: Arc<dyn PlanStore>,
        config: &WebhookConfig,
        shutdown_token: CancellationToken,
    ) -> anyhow::Result<Self> {
        let drop_guard = shutdown_token.clone().drop_guard();
        let mut background_tasks = Vec::new();

        let max_age = chrono::Duration::from_std(config.delivery_log.max_age)
            .context("webhooks.delivery_log.max_age is out of range")?;
        let http_client = sender::build_http_client().context("Failed to create webhook HTTP client")?;

        let log = Arc::new(DeliveryLog::new(config.delivery_log.max_entries_per_endpoint));
        let (queue, incoming) = DeliveryQueue::channel(config.queue_capacity);

        let worker = DeliveryWorker::spawn(
            store.clone(),
            log.clone(),
            incoming,
            http_client.clone(),
            config,
            shutdown_token.clone(),
        );
        background_tasks.push(tokio::spawn(worker.run(config.tick_interval, shutdown_token.clone())));

        background_tasks.push(tokio::spawn(run_log_maintenance(
            log.clone(),
            max_age,
            config.delivery_log.prune_interval,
            shutdown_token.clone(),
        )));

        let dispatcher = EventDispatcher::new(
            store.clone(),
            queue,
            http_client,
            Duration::from_millis(config.test_timeout_ms),
        );
        let registry = EndpointRegistry::new(
            store,
            plans,
            log.clone(),
            dispatcher.clone(),
            RegistrySettings::from(config),
        );

        tracing::info!(
            max_concurrent_sends = config.max_concurrent_sends,
            queue_capacity = config.queue_capacity,
            "Webhook engine started"
        );

        Ok(Self {
            registry,
            dispatcher,
            log,
            background_tasks,
            shutdown_token,
            drop_guard: Some(drop_guard),
        })
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn delivery_log(&self) -> &Arc<DeliveryLog> {
        &self.log
    }

    /// Gracefully shutdown all background tasks
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();

        for handle in self.background_tasks {
            let _ = handle.await;
        }
        tracing::info!("Webhook engine stopped");
    }
}

async fn run_log_maintenance(
    log: Arc<DeliveryLog>,
    max_age: chrono::Duration,
    prune_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(prune_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let removed = log.prune_older_than(max_age);
                if removed > 0 {
                    tracing::info!(removed, "Pruned expired delivery log entries");
                } else {
                    tracing::debug!("No delivery log entries to prune");
                }
            }
        }
    }

    tracing::debug!("Delivery log maintenance task exited");
}
