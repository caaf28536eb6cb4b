pub mod endpoints;
pub mod plans;

pub use endpoints::{EndpointStore, InMemoryEndpoints};
pub use plans::{InMemoryPlans, PlanStore};
