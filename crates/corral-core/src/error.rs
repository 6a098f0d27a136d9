//! Error types shared across the corral workspace.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

/// Boxed error used for opaque handler/notification failures.
///
/// Mirrors the boxed-source convention used throughout the corral
/// workspace: callers hand us arbitrary error types, we keep them behind
/// one boxed trait object so `CorralError` itself stays `Sized` and easy
/// to pass around.
pub type BoxedError = Box<dyn StdError + Send + Sync>;

/// Result type alias used throughout corral.
pub type Result<T, E = CorralError> = std::result::Result<T, E>;

/// Errors surfaced by the registry, the execution backends, and the executor.
///
/// Each variant corresponds to exactly one of the terminal notification
/// paths (`on_failure`, `on_cancel`) or to a synchronous registration
/// failure (`AlreadyRunning`). A handler error for one job never produces
/// any variant other than [`CorralError::Handler`]; backend dispatch
/// failures that occur before a handler body runs are always
/// [`CorralError::Backend`].
#[derive(Debug, thiserror::Error)]
pub enum CorralError {
    /// The handler body itself returned an error.
    #[error("handler failed: {0}")]
    Handler(#[source] BoxedError),

    /// The handler's configured timeout elapsed before it completed.
    #[error("handler timed out after {after:?}")]
    Timeout {
        /// The configured timeout that elapsed.
        after: Duration,
    },

    /// The job was cancelled, either explicitly or via executor shutdown.
    #[error("job was cancelled")]
    Cancelled,

    /// Dispatch to a THREAD or PROCESS backend failed before the handler ran.
    #[error("backend dispatch failed: {0}")]
    Backend(#[from] BackendError),

    /// A registry mutation (`add`) was attempted after an executor built
    /// from that registry has started.
    #[error("registry is already running")]
    AlreadyRunning,

    /// An adapter notification callback (`on_success`/`on_failure`/`on_cancel`)
    /// itself raised an error. Never propagates to another job; forwarded
    /// only to `on_notify_error`.
    #[error("notification callback failed: {0}")]
    Notify(#[source] BoxedError),
}

impl CorralError {
    /// Wraps an arbitrary handler error.
    pub fn handler(err: impl StdError + Send + Sync + 'static) -> Self {
        Self::Handler(Box::new(err))
    }

    /// Wraps an arbitrary notification-callback error.
    pub fn notify(err: impl StdError + Send + Sync + 'static) -> Self {
        Self::Notify(Box::new(err))
    }
}

/// Failures dispatching to the THREAD or PROCESS backend before the handler
/// body was ever invoked.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// A `PROCESS` handler's payload or result type could not be serialized.
    #[error("payload/result is not serializable for the PROCESS backend")]
    NotSerializable,

    /// The backend's worker pool has been closed (executor is shutting down).
    #[error("backend pool is closed")]
    PoolClosed,

    /// Spawning a thread or worker process failed.
    #[error("failed to spawn backend worker: {0}")]
    Spawn(#[from] std::io::Error),

    /// The worker process exited unexpectedly or wrote an unparseable frame.
    #[error("worker process protocol error: {0}")]
    Protocol(String),
}

/// Helper newtype for attaching a human-readable boxed error without
/// requiring callers to implement `std::error::Error` for simple strings.
pub struct BoxedErrorDisplay(pub String);

impl fmt::Debug for BoxedErrorDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BoxedErrorDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl StdError for BoxedErrorDisplay {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_display() {
        let err = CorralError::Timeout {
            after: Duration::from_millis(100),
        };
        assert!(err.to_string().contains("100ms"));
    }

    #[test]
    fn handler_wraps_source() {
        let source = BoxedErrorDisplay("boom".to_string());
        let err = CorralError::handler(source);
        assert!(matches!(err, CorralError::Handler(_)));
        assert_eq!(err.to_string(), "handler failed: boom");
    }

    #[test]
    fn backend_error_converts() {
        let err: CorralError = BackendError::NotSerializable.into();
        assert!(matches!(err, CorralError::Backend(BackendError::NotSerializable)));
    }
}
