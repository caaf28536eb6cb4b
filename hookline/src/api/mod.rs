//! HTTP surface of the service.
//!
//! The engine is driven in-process through [`EndpointRegistry`](crate::webhooks::EndpointRegistry)
//! and [`EventDispatcher`](crate::webhooks::EventDispatcher); the HTTP routes here cover health,
//! metrics and the platform's own signed-webhook receiver.

pub mod handlers;
