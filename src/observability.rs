//! Logging infrastructure for merge observability.
//!
//! The crate uses `tracing` for structured logging. All events use target
//! `"lsm_merge"` and include an `event` field for filtering.
//!
//! ## Library Integration
//!
//! The crate never initializes a global subscriber. Applications configure
//! tracing via `tracing_subscriber` or similar.
//!
//! ## Conventions
//!
//! - `event`: snake_case event name (required)
//! - `component`: subsystem (e.g., "planner", "installer")
//! - Use `%` for Display, `?` for Debug formatting

/// Target for all merge log events.
pub(crate) const MERGE_TARGET: &str = "lsm_merge";

/// Macro for info-level log events.
///
/// # Example
/// ```ignore
/// log_info!(
///     component = "installer",
///     event = "merge_installed",
///     tree = %name,
///     span = span,
/// );
/// ```
macro_rules! log_info {
    ($($field:tt)*) => {
        ::tracing::info!(target: $crate::observability::MERGE_TARGET, $($field)*)
    };
}

/// Macro for debug-level log events.
macro_rules! log_debug {
    ($($field:tt)*) => {
        ::tracing::debug!(target: $crate::observability::MERGE_TARGET, $($field)*)
    };
}

/// Macro for warn-level log events.
macro_rules! log_warn {
    ($($field:tt)*) => {
        ::tracing::warn!(target: $crate::observability::MERGE_TARGET, $($field)*)
    };
}

/// Macro for error-level log events.
macro_rules! log_error {
    ($($field:tt)*) => {
        ::tracing::error!(target: $crate::observability::MERGE_TARGET, $($field)*)
    };
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
