//! Logging infrastructure for blockcompact.
//!
//! All events use `tracing` with target "blockcompact" and include an `event`
//! field for filtering.
//!
//! ## Library Integration
//!
//! The crate never initializes a global subscriber. Applications configure
//! tracing via `tracing_subscriber` or similar.
//!
//! ## Conventions
//!
//! - `event`: snake_case event name (required)
//! - `component`: subsystem (e.g., "fetcher", "compactor", "cleaner")
//! - Use `%` for Display, `?` for Debug formatting
//! - Block ids are logged with `block = %id`

/// Target for all blockcompact log events.
pub(crate) const TARGET: &str = "blockcompact";

/// Macro for info-level log events.
///
/// # Example
/// ```ignore
/// log_info!(
///     component = "compactor",
///     event = "group_compacted",
///     group = %key,
///     inputs = plan.len(),
/// );
/// ```
macro_rules! log_info {
    ($($field:tt)*) => {
        ::tracing::info!(target: $crate::observability::TARGET, $($field)*)
    };
}

/// Macro for debug-level log events.
macro_rules! log_debug {
    ($($field:tt)*) => {
        ::tracing::debug!(target: $crate::observability::TARGET, $($field)*)
    };
}

/// Macro for warn-level log events.
macro_rules! log_warn {
    ($($field:tt)*) => {
        ::tracing::warn!(target: $crate::observability::TARGET, $($field)*)
    };
}

/// Macro for error-level log events.
macro_rules! log_error {
    ($($field:tt)*) => {
        ::tracing::error!(target: $crate::observability::TARGET, $($field)*)
    };
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
