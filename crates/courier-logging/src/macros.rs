//! ---
//! courier_section: "03-logging-metrics"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Structured logging adapters for RPC traffic."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
#[doc(hidden)]
#[macro_export]
macro_rules! __courier_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            $level,
            service = ctx.service.unwrap_or(""),
            queue = ctx.queue.unwrap_or(""),
            action = ctx.action.unwrap_or(""),
            correlation_id = ctx.correlation_id.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit an informational log enriched with RPC context.
#[macro_export]
macro_rules! courier_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__courier_event!(tracing::Level::INFO, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__courier_event!(tracing::Level::INFO, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a debug log enriched with RPC context.
#[macro_export]
macro_rules! courier_debug {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__courier_event!(tracing::Level::DEBUG, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__courier_event!(tracing::Level::DEBUG, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a warning enriched with RPC context.
#[macro_export]
macro_rules! courier_warn {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__courier_event!(tracing::Level::WARN, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__courier_event!(tracing::Level::WARN, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit an error log enriched with RPC context.
#[macro_export]
macro_rules! courier_error {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__courier_event!(tracing::Level::ERROR, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__courier_event!(tracing::Level::ERROR, $crate::LogContext::default(), $($arg)+)
    };
}
