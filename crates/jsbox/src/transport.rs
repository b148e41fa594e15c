//! Framed, correlated message channel to the helper process.
//!
//! A writer task serialises [`HostFrame`]s in submission order; a reader task
//! demultiplexes [`HelperMessage`]s by request id and hands unsolicited
//! notifications to the subscribed [`HelperObserver`]s. Completions run inline
//! on the reader task, so replies are observed in the order the helper sent
//! them.
//!
//! There is no retry. When the channel breaks every unresolved request is
//! completed with [`Reply::Disconnected`] and observers receive
//! [`Notification::SandboxDead`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};

use crate::error::SandboxError;
use crate::ipc::{
    read_message_with_limit, write_message, DeathReason, HelperMessage, HostFrame, HostOp,
    IsolateId, LogLevel, RequestId, Terminal,
};

/// What a pending request resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// A terminal record from the helper.
    Terminal(Terminal),
    /// The handshake reply.
    Connected {
        /// Advertised feature names.
        features: Vec<String>,
        /// Engine description.
        engine: String,
    },
    /// The channel closed before the helper answered.
    Disconnected,
}

/// Callback run exactly once with the id and reply of a submitted request.
pub type Completion = Box<dyn FnOnce(RequestId, Reply) + Send + 'static>;

/// Unsolicited events from the helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The helper lost an isolate.
    IsolateDead {
        /// The isolate that died.
        isolate_id: IsolateId,
        /// Why.
        reason: DeathReason,
    },
    /// The channel is gone; nothing further will arrive.
    SandboxDead,
}

/// Receives unsolicited helper notifications.
///
/// Called on the transport's reader task; implementations must not block.
pub trait HelperObserver: Send + Sync {
    /// Handle one notification.
    fn on_notification(&self, notification: &Notification);
}

struct TransportState {
    closed: bool,
    pending: HashMap<RequestId, Completion>,
    observers: Vec<Arc<dyn HelperObserver>>,
    outgoing: Option<mpsc::UnboundedSender<HostFrame>>,
}

struct TransportShared {
    next_id: AtomicU64,
    state: Mutex<TransportState>,
    child: Mutex<Option<Child>>,
}

/// Handle to the helper connection. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<TransportShared>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Start the reader and writer tasks over an arbitrary byte stream pair.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<R, W>(reader: R, writer: W, max_message_size: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(TransportShared {
            next_id: AtomicU64::new(1),
            state: Mutex::new(TransportState {
                closed: false,
                pending: HashMap::new(),
                observers: Vec::new(),
                outgoing: Some(tx),
            }),
            child: Mutex::new(None),
        });

        tokio::spawn(writer_loop(rx, writer, Arc::clone(&shared)));
        tokio::spawn(reader_loop(
            BufReader::new(reader),
            max_message_size,
            Arc::clone(&shared),
        ));

        Self { shared }
    }

    /// Start a transport over a spawned helper's stdin/stdout.
    ///
    /// The transport takes ownership of the child and kills it on shutdown.
    pub fn from_child(mut child: Child, max_message_size: usize) -> Result<Self, SandboxError> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Execution(anyhow::anyhow!("no stdin on helper")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Execution(anyhow::anyhow!("no stdout on helper")))?;
        let transport = Self::spawn(stdout, stdin, max_message_size);
        *transport.shared.child.lock() = Some(child);
        Ok(transport)
    }

    /// Enqueue a request; `completion` runs once with its reply.
    ///
    /// Fails with [`SandboxError::SandboxDead`] if the channel is already
    /// closed, in which case `completion` is dropped without being called.
    pub fn submit(&self, op: HostOp, completion: Completion) -> Result<RequestId, SandboxError> {
        self.enqueue(op, Some(completion))
    }

    /// Enqueue a request whose reply is not awaited.
    pub fn post(&self, op: HostOp) -> Result<RequestId, SandboxError> {
        self.enqueue(op, None)
    }

    fn enqueue(
        &self,
        op: HostOp,
        completion: Option<Completion>,
    ) -> Result<RequestId, SandboxError> {
        let request_id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(SandboxError::SandboxDead);
        }
        let Some(outgoing) = state.outgoing.as_ref() else {
            return Err(SandboxError::SandboxDead);
        };
        if outgoing.send(HostFrame { request_id, op }).is_err() {
            return Err(SandboxError::SandboxDead);
        }
        if let Some(completion) = completion {
            state.pending.insert(request_id, completion);
        }
        Ok(request_id)
    }

    /// Perform the connect handshake, returning the advertised feature names
    /// and the engine description.
    pub async fn handshake(
        &self,
        max_message_size: usize,
        timeout: Duration,
    ) -> Result<(Vec<String>, String), SandboxError> {
        let (tx, rx) = oneshot::channel();
        self.submit(
            HostOp::Connect {
                max_ipc_message_size: max_message_size,
            },
            Box::new(move |_, reply| {
                let _ = tx.send(reply);
            }),
        )?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Reply::Connected { features, engine })) => Ok((features, engine)),
            Ok(Ok(Reply::Terminal(terminal))) => Err(SandboxError::Execution(anyhow::anyhow!(
                "helper rejected handshake: {}",
                terminal.message.unwrap_or_default()
            ))),
            Ok(Ok(Reply::Disconnected)) | Ok(Err(_)) => Err(SandboxError::SandboxDead),
            Err(_elapsed) => Err(SandboxError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Register an observer for unsolicited notifications.
    ///
    /// If the channel already closed, the observer is told immediately.
    pub fn subscribe(&self, observer: Arc<dyn HelperObserver>) {
        let mut state = self.shared.state.lock();
        if state.closed {
            drop(state);
            observer.on_notification(&Notification::SandboxDead);
            return;
        }
        state.observers.push(observer);
    }

    /// Whether the channel has closed.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Ask the helper to exit, stop the writer and kill the helper process.
    ///
    /// Idempotent. Unresolved requests complete with [`Reply::Disconnected`].
    pub fn shutdown(&self) {
        let _ = self.post(HostOp::CloseSandbox);
        self.shared.disconnect("shutdown requested");
        if let Some(mut child) = self.shared.child.lock().take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "helper already exited");
            }
        }
    }
}

impl TransportShared {
    fn dispatch(&self, msg: HelperMessage) {
        match msg {
            HelperMessage::Connected {
                request_id,
                features,
                engine,
            } => self.complete(request_id, Reply::Connected { features, engine }),
            HelperMessage::Response {
                request_id,
                terminal,
            } => self.complete(request_id, Reply::Terminal(terminal)),
            HelperMessage::IsolateDead { isolate_id, reason } => {
                tracing::debug!(isolate_id, ?reason, "helper reported isolate death");
                self.notify(&Notification::IsolateDead { isolate_id, reason });
            }
            HelperMessage::Log { level, message } => match level {
                LogLevel::Error => tracing::error!(target: "jsbox::worker", "{}", message),
                LogLevel::Warn => tracing::warn!(target: "jsbox::worker", "{}", message),
                LogLevel::Info => tracing::info!(target: "jsbox::worker", "{}", message),
                LogLevel::Debug => tracing::debug!(target: "jsbox::worker", "{}", message),
            },
        }
    }

    fn complete(&self, request_id: RequestId, reply: Reply) {
        let completion = self.state.lock().pending.remove(&request_id);
        match completion {
            Some(completion) => completion(request_id, reply),
            None => tracing::trace!(request_id, "reply for unawaited request"),
        }
    }

    fn notify(&self, notification: &Notification) {
        let observers = self.state.lock().observers.clone();
        for observer in observers {
            observer.on_notification(notification);
        }
    }

    fn disconnect(&self, reason: &str) {
        let (pending, observers) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.outgoing = None;
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.observers),
            )
        };

        tracing::debug!(reason, unresolved = pending.len(), "helper channel closed");
        for (request_id, completion) in pending {
            completion(request_id, Reply::Disconnected);
        }
        for observer in observers {
            observer.on_notification(&Notification::SandboxDead);
        }
    }
}

async fn writer_loop<W: AsyncWrite + Unpin>(
    mut rx: mpsc::UnboundedReceiver<HostFrame>,
    mut writer: W,
    shared: Arc<TransportShared>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_message(&mut writer, &frame).await {
            tracing::warn!(error = %e, "failed to write to helper");
            shared.disconnect("write failed");
            return;
        }
    }
    // Dropping the writer closes the helper's stdin.
}

async fn reader_loop<R: AsyncRead + Unpin>(
    mut reader: BufReader<R>,
    max_message_size: usize,
    shared: Arc<TransportShared>,
) {
    loop {
        match read_message_with_limit::<HelperMessage, _>(&mut reader, max_message_size).await {
            Ok(Some(msg)) => shared.dispatch(msg),
            Ok(None) => {
                shared.disconnect("helper closed its output");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read from helper");
                shared.disconnect("read failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{read_message, TerminalKind};
    use std::sync::atomic::AtomicUsize;

    struct CountingObserver {
        dead: AtomicUsize,
        isolates: Mutex<Vec<IsolateId>>,
    }

    impl HelperObserver for CountingObserver {
        fn on_notification(&self, notification: &Notification) {
            match notification {
                Notification::SandboxDead => {
                    self.dead.fetch_add(1, Ordering::SeqCst);
                }
                Notification::IsolateDead { isolate_id, .. } => {
                    self.isolates.lock().push(*isolate_id);
                }
            }
        }
    }

    fn observer() -> Arc<CountingObserver> {
        Arc::new(CountingObserver {
            dead: AtomicUsize::new(0),
            isolates: Mutex::new(Vec::new()),
        })
    }

    fn collect(tx: oneshot::Sender<Reply>) -> Completion {
        Box::new(move |_, reply| {
            let _ = tx.send(reply);
        })
    }

    #[tokio::test]
    async fn replies_are_routed_by_request_id() {
        let (host_side, helper_side) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host_side);
        let (mut helper_read, mut helper_write) = tokio::io::split(helper_side);
        let transport = Transport::spawn(host_read, host_write, 1024 * 1024);

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        let id1 = transport
            .submit(
                HostOp::Evaluate {
                    isolate_id: 1,
                    source: "'a'".into(),
                },
                collect(tx1),
            )
            .unwrap();
        let id2 = transport
            .submit(
                HostOp::Evaluate {
                    isolate_id: 1,
                    source: "'b'".into(),
                },
                collect(tx2),
            )
            .unwrap();
        assert!(id2 > id1);

        let f1: HostFrame = read_message(&mut helper_read).await.unwrap().unwrap();
        let f2: HostFrame = read_message(&mut helper_read).await.unwrap().unwrap();
        assert_eq!((f1.request_id, f2.request_id), (id1, id2));

        // Answer out of order
        write_message(
            &mut helper_write,
            &HelperMessage::Response {
                request_id: id2,
                terminal: Terminal::value("b"),
            },
        )
        .await
        .unwrap();
        write_message(
            &mut helper_write,
            &HelperMessage::Response {
                request_id: id1,
                terminal: Terminal::threw("Uncaught Error: a"),
            },
        )
        .await
        .unwrap();

        assert_eq!(rx2.await.unwrap(), Reply::Terminal(Terminal::value("b")));
        match rx1.await.unwrap() {
            Reply::Terminal(t) => assert_eq!(t.kind, TerminalKind::Threw),
            other => panic!("expected terminal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_fails_pending_and_notifies_once() {
        let (host_side, helper_side) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host_side);
        let transport = Transport::spawn(host_read, host_write, 1024 * 1024);
        let obs = observer();
        transport.subscribe(obs.clone());

        let (tx, rx) = oneshot::channel();
        transport
            .submit(
                HostOp::Evaluate {
                    isolate_id: 1,
                    source: "while(true){}".into(),
                },
                collect(tx),
            )
            .unwrap();

        drop(helper_side);

        assert_eq!(rx.await.unwrap(), Reply::Disconnected);
        assert!(transport.is_closed());
        transport.shutdown();
        assert_eq!(obs.dead.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn submit_after_close_is_rejected() {
        let (host_side, _helper_side) = tokio::io::duplex(1024);
        let (host_read, host_write) = tokio::io::split(host_side);
        let transport = Transport::spawn(host_read, host_write, 1024);
        transport.shutdown();

        let err = transport.post(HostOp::CloseSandbox).unwrap_err();
        assert!(matches!(err, SandboxError::SandboxDead));
    }

    #[tokio::test]
    async fn late_subscriber_learns_of_death() {
        let (host_side, _helper_side) = tokio::io::duplex(1024);
        let (host_read, host_write) = tokio::io::split(host_side);
        let transport = Transport::spawn(host_read, host_write, 1024);
        transport.shutdown();

        let obs = observer();
        transport.subscribe(obs.clone());
        assert_eq!(obs.dead.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn isolate_death_is_forwarded_to_observers() {
        let (host_side, helper_side) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host_side);
        let (_helper_read, mut helper_write) = tokio::io::split(helper_side);
        let transport = Transport::spawn(host_read, host_write, 1024 * 1024);
        let obs = observer();
        transport.subscribe(obs.clone());

        write_message(
            &mut helper_write,
            &HelperMessage::IsolateDead {
                isolate_id: 7,
                reason: DeathReason::Fault,
            },
        )
        .await
        .unwrap();
        // A handshake round trip orders us after the notification.
        let (tx, rx) = oneshot::channel();
        let id = transport
            .submit(
                HostOp::Connect {
                    max_ipc_message_size: 1024,
                },
                collect(tx),
            )
            .unwrap();
        write_message(
            &mut helper_write,
            &HelperMessage::Connected {
                request_id: id,
                features: vec![],
                engine: "fake".into(),
            },
        )
        .await
        .unwrap();
        rx.await.unwrap();

        assert_eq!(*obs.isolates.lock(), vec![7]);
    }

    #[tokio::test]
    async fn handshake_times_out_without_reply() {
        let (host_side, _helper_side) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host_side);
        let transport = Transport::spawn(host_read, host_write, 1024);

        let err = transport
            .handshake(1024, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout { .. }), "got: {err:?}");
    }
}
