//! ---
//! courier_section: "03-logging-metrics"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Structured logging adapters for RPC traffic."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Context-carrying log macros shared by the RPC client and dispatcher.

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

pub mod macros;

/// Initialize a baseline tracing subscriber suitable for tools and tests.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer())
        .try_init();
}

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogContext<'a> {
    /// Service hosting the dispatcher or issuing the request.
    pub service: Option<&'a str>,
    /// Queue the message travelled on.
    pub queue: Option<&'a str>,
    /// Action name routed by the dispatcher.
    pub action: Option<&'a str>,
    /// Correlation id linking a request to its reply.
    pub correlation_id: Option<&'a str>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a service name.
    pub fn with_service(mut self, service: &'a str) -> Self {
        self.service = Some(service);
        self
    }

    /// Attach a queue name.
    pub fn with_queue(mut self, queue: &'a str) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Attach an action name.
    pub fn with_action(mut self, action: &'a str) -> Self {
        self.action = Some(action);
        self
    }

    /// Attach a correlation id, if the message carried one.
    pub fn with_correlation_id(mut self, correlation_id: Option<&'a str>) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}

/// High-level outcome used when emitting lifecycle log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEventOutcome {
    /// The operation completed successfully.
    Success,
    /// The operation failed or was aborted.
    Fault,
}

impl SystemEventOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            SystemEventOutcome::Success => "success",
            SystemEventOutcome::Fault => "fault",
        }
    }
}

/// Emit a standardized lifecycle event (consumer started, channel reconnected, ...).
pub fn log_system_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: SystemEventOutcome,
) {
    let ctx = context.copied().unwrap_or_default();
    match outcome {
        SystemEventOutcome::Success => tracing::info!(
            event,
            outcome = outcome.as_str(),
            service = ctx.service.unwrap_or(""),
            queue = ctx.queue.unwrap_or(""),
            message = %message
        ),
        SystemEventOutcome::Fault => tracing::error!(
            event,
            outcome = outcome.as_str(),
            service = ctx.service.unwrap_or(""),
            queue = ctx.queue.unwrap_or(""),
            message = %message
        ),
    }
}
