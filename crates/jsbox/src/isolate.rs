//! Host-side state of one JavaScript realm in the helper.
//!
//! An isolate is `Live` until the helper reports it lost (out of memory,
//! terminated, helper fault), at which point it is `Dead` and every pending
//! and later evaluation resolves with a termination outcome. `Closed` is the
//! caller's release and rejects further use as a programmer error.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::SandboxError;
use crate::evaluation::{Evaluation, Outcome};
use crate::features::Feature;
use crate::ipc::{self, HostOp, IsolateId, RequestId, TerminalKind};
use crate::params::IsolateStartupParameters;
use crate::sandbox::SandboxShared;
use crate::transport::{Completion, Reply};

/// Why an isolate stopped accepting work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeathCause {
    /// The isolate itself was lost.
    Terminated,
    /// The whole sandbox went away.
    SandboxDead,
}

impl DeathCause {
    fn outcome(self) -> Outcome {
        match self {
            DeathCause::Terminated => Outcome::IsolateTerminated,
            DeathCause::SandboxDead => Outcome::SandboxDead,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Live,
    Dead(DeathCause),
    Closed,
}

struct IsolateCore {
    status: Status,
    pending: BTreeMap<RequestId, oneshot::Sender<Outcome>>,
    data_names: HashSet<String>,
}

impl IsolateCore {
    /// Resolve every pending evaluation with `outcome`.
    fn fail_pending(&mut self, outcome: &Outcome) {
        for (_, tx) in std::mem::take(&mut self.pending) {
            let _ = tx.send(outcome.clone());
        }
    }
}

pub(crate) struct IsolateInner {
    id: IsolateId,
    params: IsolateStartupParameters,
    sandbox: Weak<SandboxShared>,
    core: Mutex<IsolateCore>,
}

impl IsolateInner {
    pub(crate) fn new(
        id: IsolateId,
        params: IsolateStartupParameters,
        sandbox: Weak<SandboxShared>,
        dead: Option<DeathCause>,
    ) -> Self {
        Self {
            id,
            params,
            sandbox,
            core: Mutex::new(IsolateCore {
                status: dead.map_or(Status::Live, Status::Dead),
                pending: BTreeMap::new(),
                data_names: HashSet::new(),
            }),
        }
    }

    /// Move to `Dead` and fan `cause` out to all pending evaluations.
    ///
    /// Sandbox death overrides an earlier isolate death; nothing overrides
    /// `Closed`.
    pub(crate) fn mark_dead(&self, cause: DeathCause) {
        let mut core = self.core.lock();
        match core.status {
            Status::Closed => return,
            Status::Dead(DeathCause::SandboxDead) => return,
            Status::Dead(DeathCause::Terminated) if cause == DeathCause::Terminated => return,
            _ => {}
        }
        core.status = Status::Dead(cause);
        let pending = core.pending.len();
        core.fail_pending(&cause.outcome());
        tracing::debug!(isolate_id = self.id, ?cause, pending, "isolate dead");
    }

    /// Completion path for one evaluation reply.
    fn on_reply(&self, request_id: RequestId, reply: Reply) {
        let mut core = self.core.lock();
        let Some(tx) = core.pending.remove(&request_id) else {
            // Already resolved locally by close or a death fan-out.
            return;
        };

        match reply {
            Reply::Terminal(terminal) => {
                let kind = terminal.kind;
                let _ = tx.send(Outcome::from_terminal(terminal));
                if matches!(kind, TerminalKind::Oom | TerminalKind::Terminated)
                    && core.status == Status::Live
                {
                    core.status = Status::Dead(DeathCause::Terminated);
                    core.fail_pending(&Outcome::IsolateTerminated);
                    tracing::debug!(
                        isolate_id = self.id,
                        request_id,
                        ?kind,
                        "isolate lost during evaluation"
                    );
                }
            }
            Reply::Disconnected => {
                let _ = tx.send(Outcome::SandboxDead);
            }
            Reply::Connected { .. } => {
                tracing::warn!(request_id, "handshake reply for an evaluation");
                let _ = tx.send(Outcome::EvaluationFailure(
                    "protocol error: unexpected handshake reply".into(),
                ));
            }
        }
    }
}

/// One JavaScript realm hosted by the helper.
///
/// Dropping an `Isolate` closes it.
pub struct Isolate {
    inner: Arc<IsolateInner>,
}

impl std::fmt::Debug for Isolate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Isolate")
            .field("id", &self.inner.id)
            .field("status", &self.inner.core.lock().status)
            .finish()
    }
}

impl Isolate {
    pub(crate) fn from_inner(inner: Arc<IsolateInner>) -> Self {
        Self { inner }
    }

    /// Identifier of this isolate within its sandbox.
    pub fn id(&self) -> IsolateId {
        self.inner.id
    }

    /// Parameters the isolate was created with.
    pub fn startup_parameters(&self) -> IsolateStartupParameters {
        self.inner.params
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.core.lock().status == Status::Closed
    }

    /// Whether the isolate or its sandbox has died.
    pub fn is_dead(&self) -> bool {
        matches!(self.inner.core.lock().status, Status::Dead(_))
    }

    /// Submit `source` for evaluation.
    ///
    /// Returns at once. Evaluations on one isolate run in submission order
    /// and share its global object. On a dead isolate the returned handle is
    /// already resolved. Fails if the isolate is closed, or with
    /// [`InvalidArgument`](SandboxError::InvalidArgument) if `source` does
    /// not fit in one IPC frame.
    pub fn evaluate(&self, source: impl Into<String>) -> Result<Evaluation, SandboxError> {
        let source = source.into();
        let mut core = self.inner.core.lock();
        match core.status {
            Status::Closed => {
                return Err(SandboxError::IllegalState("isolate is closed".into()));
            }
            Status::Dead(cause) => return Ok(Evaluation::settled(cause.outcome())),
            Status::Live => {}
        }

        let Some(sandbox) = self.inner.sandbox.upgrade() else {
            core.status = Status::Dead(DeathCause::SandboxDead);
            return Ok(Evaluation::settled(Outcome::SandboxDead));
        };
        sandbox.check_frame_len("source", ipc::evaluate_frame_len(&source))?;

        let weak = Arc::downgrade(&self.inner);
        let completion: Completion = Box::new(move |request_id, reply| {
            if let Some(inner) = weak.upgrade() {
                inner.on_reply(request_id, reply);
            }
        });

        let op = HostOp::Evaluate {
            isolate_id: self.inner.id,
            source,
        };
        match sandbox.transport().submit(op, completion) {
            Ok(request_id) => {
                // The reply cannot be dispatched before this lock is released.
                let (tx, rx) = oneshot::channel();
                core.pending.insert(request_id, tx);
                tracing::trace!(isolate_id = self.inner.id, request_id, "evaluation submitted");
                Ok(Evaluation::pending(request_id, rx))
            }
            Err(_) => {
                core.status = Status::Dead(DeathCause::SandboxDead);
                Ok(Evaluation::settled(Outcome::SandboxDead))
            }
        }
    }

    /// Register `data` under `name` for one-shot consumption by
    /// `android.consumeNamedDataAsArrayBuffer(name)`.
    ///
    /// Returns `Ok(false)` without side effects if `name` was already used on
    /// this isolate or the isolate can no longer accept data. Data that does
    /// not fit in one IPC frame is rejected with
    /// [`InvalidArgument`](SandboxError::InvalidArgument).
    pub fn provide_named_data(
        &self,
        name: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Result<bool, SandboxError> {
        let name = name.into();
        let data = data.into();
        if name.is_empty() {
            return Err(SandboxError::InvalidArgument(
                "named data requires a non-empty name".into(),
            ));
        }

        let mut core = self.inner.core.lock();
        if core.status == Status::Closed {
            return Err(SandboxError::IllegalState("isolate is closed".into()));
        }
        let Some(sandbox) = self.inner.sandbox.upgrade() else {
            return Ok(false);
        };
        if !sandbox.supports(Feature::ProvideConsumeArrayBuffer) {
            return Err(SandboxError::FeatureUnsupported(
                Feature::ProvideConsumeArrayBuffer,
            ));
        }
        sandbox.check_frame_len("named data", ipc::provide_data_frame_len(&name, data.len()))?;
        if core.status != Status::Live || core.data_names.contains(&name) {
            return Ok(false);
        }

        let op = HostOp::ProvideData {
            isolate_id: self.inner.id,
            name: name.clone(),
            data,
        };
        match sandbox.transport().post(op) {
            Ok(_) => {
                core.data_names.insert(name);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// Release the isolate. Idempotent.
    ///
    /// Evaluations still pending resolve with
    /// [`IsolateTerminated`](Outcome::IsolateTerminated) and the helper is
    /// asked to interrupt whatever is running.
    pub fn close(&self) {
        let previous = {
            let mut core = self.inner.core.lock();
            if core.status == Status::Closed {
                return;
            }
            let previous = std::mem::replace(&mut core.status, Status::Closed);
            core.fail_pending(&Outcome::IsolateTerminated);
            core.data_names.clear();
            previous
        };

        if let Some(sandbox) = self.inner.sandbox.upgrade() {
            if previous != Status::Dead(DeathCause::SandboxDead) {
                let _ = sandbox.transport().post(HostOp::DestroyIsolate {
                    isolate_id: self.inner.id,
                });
            }
            sandbox.forget_isolate(self.inner.id);
        }
        tracing::debug!(isolate_id = self.inner.id, "isolate closed");
    }
}

impl Drop for Isolate {
    fn drop(&mut self) {
        self.close();
    }
}
