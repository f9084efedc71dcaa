//! Error types for task execution.

use std::any::Any;

/// Failure captured from a future's action.
///
/// A failing action does not kill the thread that ran it: the error is
/// stored on the future (readable via `get_exception`) and returned from
/// `complete()` so the servicing loop can log it and move on.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FutureError {
    /// The action panicked while it was running.
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl FutureError {
    /// Build an error from a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "non-string panic payload".to_string()
        };
        FutureError::Panicked(message)
    }
}
