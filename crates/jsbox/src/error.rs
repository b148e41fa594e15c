//! Error types for the jsbox sandbox service.

use thiserror::Error;

use crate::features::Feature;

/// Errors surfaced by sandbox, isolate and evaluation operations.
///
/// The first four variants are the terminal failure kinds of an
/// [`Evaluation`](crate::Evaluation). The programmer-error variants are
/// returned synchronously from misused operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SandboxError {
    /// The script threw, or the promise it returned was rejected.
    #[error("evaluation failed: {message}")]
    EvaluationFailed {
        /// Textual form of the thrown value.
        message: String,
    },

    /// This evaluation pushed its isolate over the heap limit.
    #[error("isolate memory limit exceeded")]
    MemoryLimitExceeded,

    /// The owning isolate died (out of memory, termination or helper fault).
    #[error("isolate terminated")]
    IsolateTerminated,

    /// The sandbox died or was closed.
    #[error("sandbox dead")]
    SandboxDead,

    /// Another sandbox currently holds the helper process binding.
    #[error("a sandbox is already bound to the helper process")]
    AlreadyBound,

    /// An operation was invoked on a closed object.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The operation depends on a feature the helper did not advertise.
    #[error("feature not supported by the sandbox: {0}")]
    FeatureUnsupported(Feature),

    /// A caller-supplied argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A caller-imposed wait elapsed.
    #[error("timed out after {timeout_ms}ms")]
    Timeout {
        /// The timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// The channel to the helper failed while connecting.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Generic failure spawning or talking to the helper.
    #[error("sandbox execution failed: {0}")]
    Execution(#[from] anyhow::Error),
}

impl SandboxError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EvaluationFailed { .. } => "EVALUATION_FAILED",
            Self::MemoryLimitExceeded => "MEMORY_LIMIT_EXCEEDED",
            Self::IsolateTerminated => "ISOLATE_TERMINATED",
            Self::SandboxDead => "SANDBOX_DEAD",
            Self::AlreadyBound => "ALREADY_BOUND",
            Self::IllegalState(_) => "ILLEGAL_STATE",
            Self::FeatureUnsupported(_) => "FEATURE_UNSUPPORTED",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Transport(_) => "TRANSPORT",
            Self::Execution(_) => "INTERNAL",
        }
    }

    /// Whether this error signals misuse of the API rather than a runtime failure.
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            Self::AlreadyBound
                | Self::IllegalState(_)
                | Self::FeatureUnsupported(_)
                | Self::InvalidArgument(_)
        )
    }

    /// Whether the isolate that produced this error can still be used.
    ///
    /// Only a plain evaluation failure leaves the isolate live.
    pub fn isolate_usable(&self) -> bool {
        matches!(self, Self::EvaluationFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_bound_message_is_recognisable() {
        let msg = SandboxError::AlreadyBound.to_string();
        assert!(msg.contains("already bound"), "got: {msg}");
    }

    #[test]
    fn codes_are_distinct_for_terminal_kinds() {
        let codes = [
            SandboxError::EvaluationFailed {
                message: "x".into(),
            }
            .code(),
            SandboxError::MemoryLimitExceeded.code(),
            SandboxError::IsolateTerminated.code(),
            SandboxError::SandboxDead.code(),
        ];
        let unique: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len());
    }

    #[test]
    fn programmer_errors_are_classified() {
        assert!(SandboxError::IllegalState("closed".into()).is_programmer_error());
        assert!(SandboxError::AlreadyBound.is_programmer_error());
        assert!(SandboxError::FeatureUnsupported(Feature::WasmCompilation).is_programmer_error());
        assert!(!SandboxError::SandboxDead.is_programmer_error());
        assert!(!SandboxError::IsolateTerminated.is_programmer_error());
    }

    #[test]
    fn only_evaluation_failure_keeps_isolate_usable() {
        assert!(SandboxError::EvaluationFailed {
            message: "boom".into()
        }
        .isolate_usable());
        assert!(!SandboxError::MemoryLimitExceeded.isolate_usable());
        assert!(!SandboxError::IsolateTerminated.isolate_usable());
        assert!(!SandboxError::SandboxDead.isolate_usable());
    }

    #[test]
    fn evaluation_failure_carries_message() {
        let err = SandboxError::EvaluationFailed {
            message: "Uncaught Error: X".into(),
        };
        assert!(err.to_string().contains("Uncaught Error: X"));
    }
}
