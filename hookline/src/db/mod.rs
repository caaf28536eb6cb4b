//! Record store for endpoint configuration and tenant plans.
//!
//! The engine never talks to a concrete database directly. Each entity has a store trait in
//! [`handlers`] that describes the operations the engine needs, including the atomic per-record
//! counter updates the delivery worker relies on. The in-memory implementations shipped here back
//! the default [`Application`](crate::Application) and the test-suite; a deployment with a real
//! database implements the same traits.

pub mod errors;
pub mod handlers;
pub mod models;

pub use errors::DbError;
