//! ---
//! courier_section: "04-rpc-correlation"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Request/reply correlation over durable queues."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
//! Request/reply correlation on top of courier brokers.
//!
//! [`RpcClient`] turns publish/consume into a call with a timeout, [`Dispatcher`] serves
//! durable request queues from an [`ActionRegistry`], and [`Notifier`] sends one-way events.

pub mod channel;
pub mod client;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod notify;
pub mod registry;
pub mod topology;

pub use channel::{ChannelState, Connector, ManagedChannel};
pub use client::{InFlightRequest, RpcClient, DEFAULT_REQUEST_TIMEOUT};
pub use dispatcher::{Dispatcher, RequestShape};
pub use error::{HandlerError, RegistryError, RpcError};
pub use metrics::{DispatchOutcome, RpcMetrics};
pub use notify::{
    new_submission_event, submission_evaluated_event, Notifier, SubmissionNotifier,
    SubmissionStatus, SubmissionSummary, NOTIFICATION_CREATE,
};
pub use registry::{ActionHandler, ActionRegistry, ActionRegistryBuilder, HandlerPtr};
pub use topology::declare_topology;
