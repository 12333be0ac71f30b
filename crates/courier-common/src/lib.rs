//! ---
//! courier_section: "01-core-functionality"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Shared primitives and utilities for courier services."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
//! Shared primitives for the courier workspace.
//! This crate exposes configuration loading, tracing setup, and the metrics
//! registry consumed across the workspace.

pub mod config;
pub mod logging;
pub mod metrics;

pub use config::{
    AppConfig, BrokerConfig, BrokerKind, ClientConfig, DispatcherConfig, LoadedAppConfig,
    LoggingConfig, MetricsConfig, TopologyConfig, NOTIFICATION_REQUESTS, SUBMISSION_REQUESTS,
    USER_REQUESTS,
};
pub use logging::{init_tracing, LogFormat};
pub use metrics::{encode_text, new_registry, SharedRegistry};
