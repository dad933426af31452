//! Best-effort logging of failures the caller deliberately ignores.

use std::fmt::Display;

/// Log an `Err` and hand the result back untouched.
///
/// Used where a failure must not abort the caller (event fan-out, cleanup of
/// auxiliary keys) but should still leave a trace.
pub trait ResultExt<T, E> {
    /// Emit a warning carrying `context` and the call site when `self` is an `Err`.
    fn log<S: ToString>(self, context: S) -> Result<T, E>;
}

impl<T, E: Display> ResultExt<T, E> for Result<T, E> {
    #[track_caller]
    fn log<S: ToString>(self, context: S) -> Result<T, E> {
        if let Err(e) = &self {
            let at = std::panic::Location::caller();
            tracing::warn!(
                target: "stackbrowser_coordinator",
                error = %e,
                at = %format_args!("{}:{}", at.file(), at.line()),
                context = %context.to_string(),
                "Ignored failure"
            );
        }
        self
    }
}
