//! ---
//! courier_section: "01-core-functionality"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Shared primitives and utilities for courier services."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{Registry, TextEncoder};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Render every metric family in the Prometheus text exposition format.
pub fn encode_text(registry: &Registry) -> Result<String> {
    let families = registry.gather();
    TextEncoder::new()
        .encode_to_string(&families)
        .context("failed to encode metrics")
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{IntCounter, Opts};

    #[test]
    fn encode_text_includes_registered_counters() {
        let registry = new_registry();
        let counter =
            IntCounter::with_opts(Opts::new("courier_test_total", "test counter")).unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        counter.inc();

        let body = encode_text(&registry).unwrap();
        assert!(body.contains("courier_test_total 1"));
    }
}
