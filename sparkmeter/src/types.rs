//! Common type definitions shared across the crate.
//!
//! Identifiers in this system are opaque strings assigned by external
//! collaborators: run ids come from the execution engine, trace ids from the
//! telemetry source, customer ids from the auth layer / payment provider.
//! They are aliased rather than newtyped so they deserialize straight out of
//! the wire formats those collaborators use.

/// Lifecycle-unit identifier assigned by the execution engine.
pub type RunId = String;

/// Completed-execution identifier assigned by the telemetry source.
pub type TraceId = String;

/// Billing-account identifier resolved by the auth collaborator.
pub type CustomerId = String;

/// Abbreviate an opaque id to its first 8 characters for more readable logs.
/// Example: "6f9a2c1e-43d7-4b11-9c55-0d2f8e7a1b3c" -> "6f9a2c1e"
pub fn abbrev_id(id: &str) -> String {
    id.chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abbrev_id_truncates_long_ids() {
        assert_eq!(abbrev_id("6f9a2c1e-43d7-4b11"), "6f9a2c1e");
    }

    #[test]
    fn abbrev_id_keeps_short_ids_whole() {
        assert_eq!(abbrev_id("abc"), "abc");
    }
}
