//! Axum route handlers, grouped by functional area.

pub mod payments;
pub mod subscriptions;
pub mod usage;
