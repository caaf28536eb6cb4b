pub mod endpoints;
pub mod plans;
