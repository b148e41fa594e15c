//! One-shot handles for submitted evaluations.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::SandboxError;
use crate::ipc::{RequestId, Terminal, TerminalKind};

/// The single terminal state an evaluation reaches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The script, or the promise it returned, produced this string.
    Value(String),
    /// The script threw or its promise rejected.
    EvaluationFailure(String),
    /// This evaluation exhausted the isolate's heap.
    MemoryLimitExceeded,
    /// The isolate died while this evaluation was pending, or before it was submitted.
    IsolateTerminated,
    /// The sandbox died or was closed.
    SandboxDead,
}

impl Outcome {
    /// Map a helper terminal record onto an outcome.
    pub(crate) fn from_terminal(terminal: Terminal) -> Self {
        match terminal.kind {
            TerminalKind::Value => Outcome::Value(terminal.message.unwrap_or_default()),
            TerminalKind::Threw => Outcome::EvaluationFailure(terminal.message.unwrap_or_default()),
            TerminalKind::Oom => Outcome::MemoryLimitExceeded,
            TerminalKind::Terminated => Outcome::IsolateTerminated,
        }
    }

    /// Convert into the caller-facing result type.
    pub fn into_result(self) -> Result<String, SandboxError> {
        match self {
            Outcome::Value(value) => Ok(value),
            Outcome::EvaluationFailure(message) => Err(SandboxError::EvaluationFailed { message }),
            Outcome::MemoryLimitExceeded => Err(SandboxError::MemoryLimitExceeded),
            Outcome::IsolateTerminated => Err(SandboxError::IsolateTerminated),
            Outcome::SandboxDead => Err(SandboxError::SandboxDead),
        }
    }
}

/// Future of an evaluation's result.
///
/// Resolves once; there is no direct cancellation. Dropping the handle does
/// not stop the script. Close the isolate or the sandbox for that.
#[must_use = "an evaluation does nothing observable unless awaited"]
#[derive(Debug)]
pub struct Evaluation {
    request_id: Option<RequestId>,
    rx: oneshot::Receiver<Outcome>,
}

impl Evaluation {
    pub(crate) fn pending(request_id: RequestId, rx: oneshot::Receiver<Outcome>) -> Self {
        Self {
            request_id: Some(request_id),
            rx,
        }
    }

    /// An evaluation that was never submitted and already has its outcome.
    pub(crate) fn settled(outcome: Outcome) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        Self {
            request_id: None,
            rx,
        }
    }

    /// Wire request id, or `None` when the evaluation was resolved locally.
    pub fn request_id(&self) -> Option<RequestId> {
        self.request_id
    }

    /// Wait for the raw outcome.
    pub async fn outcome(self) -> Outcome {
        // Every registered sender is completed before it is dropped; a bare
        // drop only happens when the owning sandbox is torn down.
        self.rx.await.unwrap_or(Outcome::SandboxDead)
    }

    /// Wait for the result, giving up after `timeout`.
    ///
    /// The helper keeps working on the script after a timeout.
    pub async fn result_within(self, timeout: Duration) -> Result<String, SandboxError> {
        match tokio::time::timeout(timeout, self.outcome()).await {
            Ok(outcome) => outcome.into_result(),
            Err(_elapsed) => Err(SandboxError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

impl Future for Evaluation {
    type Output = Result<String, SandboxError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Outcome::SandboxDead).into_result())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn settled_evaluation_resolves_immediately() {
        let eval = Evaluation::settled(Outcome::IsolateTerminated);
        assert!(eval.request_id().is_none());
        assert!(matches!(eval.await, Err(SandboxError::IsolateTerminated)));
    }

    #[tokio::test]
    async fn dropped_sender_reads_as_sandbox_death() {
        let (tx, rx) = oneshot::channel();
        drop(tx);
        let eval = Evaluation::pending(1, rx);
        assert_eq!(eval.outcome().await, Outcome::SandboxDead);
    }

    #[tokio::test]
    async fn result_within_reports_timeout() {
        let (_tx, rx) = oneshot::channel();
        let eval = Evaluation::pending(4, rx);
        let err = eval
            .result_within(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout { timeout_ms: 20 }));
    }

    #[test]
    fn terminal_kinds_map_to_outcomes() {
        assert_eq!(
            Outcome::from_terminal(Terminal::value("PASS")),
            Outcome::Value("PASS".into())
        );
        assert_eq!(
            Outcome::from_terminal(Terminal::threw("Uncaught Error: X")),
            Outcome::EvaluationFailure("Uncaught Error: X".into())
        );
        assert_eq!(
            Outcome::from_terminal(Terminal::oom()),
            Outcome::MemoryLimitExceeded
        );
        assert_eq!(
            Outcome::from_terminal(Terminal::terminated()),
            Outcome::IsolateTerminated
        );
    }
}
