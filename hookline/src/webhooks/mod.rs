//! Webhook delivery engine.
//!
//! - [`events`]: The closed event catalog and the envelope sent to endpoints
//! - [`signing`]: HMAC-SHA256 body signatures and secret generation
//! - [`validation`]: Endpoint configuration checks
//! - [`registry`]: Tenant-facing endpoint management with plan quotas
//! - [`dispatcher`]: Event fan-out into the delivery queue, plus synchronous test pings
//! - [`queue`]: Delivery attempts and the due-time heap
//! - [`sender`]: Request building and the HTTP call itself
//! - [`worker`]: Schedule/sign/send/record loop with retries
//! - [`circuit_breaker`]: Deactivation of chronically failing endpoints
//! - [`delivery_log`]: Bounded per-endpoint history and stats
//! - [`engine`]: Wires the above together and owns the background tasks

pub mod circuit_breaker;
pub mod delivery_log;
pub mod dispatcher;
pub mod engine;
pub mod events;
pub mod queue;
pub mod registry;
pub mod sender;
pub mod signing;
pub mod validation;
pub mod worker;

pub use dispatcher::EventDispatcher;
pub use engine::WebhookEngine;
pub use events::{Envelope, EventName};
pub use registry::{EndpointCreated, EndpointPatch, EndpointRegistry, EndpointSpec, EndpointUpdated};
pub use sender::TestDeliveryResult;
pub use signing::{generate_secret, sign, verify};
