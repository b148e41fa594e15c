//! The process-wide sandbox: binding, feature negotiation, isolate registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::features::{Feature, FeatureSet};
use crate::host;
use crate::ipc::{HostOp, IsolateId};
use crate::isolate::{DeathCause, Isolate, IsolateInner};
use crate::params::IsolateStartupParameters;
use crate::transport::{HelperObserver, Notification, Transport};

/// Set while some sandbox holds the helper binding.
static BOUND: AtomicBool = AtomicBool::new(false);

/// Exclusive claim on the helper binding, released on drop.
#[derive(Debug)]
struct Binding(());

impl Binding {
    fn acquire() -> Result<Self, SandboxError> {
        BOUND
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Binding(()))
            .map_err(|_| SandboxError::AlreadyBound)
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        BOUND.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ready,
    Dead,
    Closed,
}

struct SandboxCore {
    status: Status,
    isolates: HashMap<IsolateId, Arc<IsolateInner>>,
    binding: Option<Binding>,
}

pub(crate) struct SandboxShared {
    transport: Transport,
    features: FeatureSet,
    engine: String,
    default_params: IsolateStartupParameters,
    /// Frame limit announced to the helper in the handshake.
    max_ipc_message_size: usize,
    next_isolate_id: AtomicU64,
    core: Mutex<SandboxCore>,
}

impl SandboxShared {
    pub(crate) fn transport(&self) -> &Transport {
        &self.transport
    }

    pub(crate) fn supports(&self, feature: Feature) -> bool {
        self.features.contains(feature)
    }

    /// Reject a request whose frame would exceed the helper's read limit.
    pub(crate) fn check_frame_len(&self, what: &str, len: usize) -> Result<(), SandboxError> {
        if len > self.max_ipc_message_size {
            return Err(SandboxError::InvalidArgument(format!(
                "{what} needs a {len} byte frame, over the {} byte IPC limit",
                self.max_ipc_message_size
            )));
        }
        Ok(())
    }

    pub(crate) fn forget_isolate(&self, id: IsolateId) {
        self.core.lock().isolates.remove(&id);
    }

    fn isolate(&self, id: IsolateId) -> Option<Arc<IsolateInner>> {
        self.core.lock().isolates.get(&id).cloned()
    }

    /// The helper went away. Every isolate dies with the sandbox.
    fn on_helper_lost(&self) {
        let isolates: Vec<_> = {
            let mut core = self.core.lock();
            if core.status == Status::Ready {
                core.status = Status::Dead;
            }
            core.isolates.values().cloned().collect()
        };
        tracing::warn!(isolates = isolates.len(), "sandbox helper lost");
        for isolate in isolates {
            isolate.mark_dead(DeathCause::SandboxDead);
        }
    }
}

/// Routes helper notifications to the owning sandbox.
struct SandboxObserver {
    sandbox: Weak<SandboxShared>,
}

impl HelperObserver for SandboxObserver {
    fn on_notification(&self, notification: &Notification) {
        let Some(sandbox) = self.sandbox.upgrade() else {
            return;
        };
        match notification {
            Notification::IsolateDead { isolate_id, reason } => {
                tracing::debug!(isolate_id, ?reason, "isolate lost by helper");
                if let Some(isolate) = sandbox.isolate(*isolate_id) {
                    isolate.mark_dead(DeathCause::Terminated);
                }
            }
            Notification::SandboxDead => sandbox.on_helper_lost(),
        }
    }
}

/// Connection to the helper process hosting JavaScript isolates.
///
/// At most one `Sandbox` can be bound per process. Dropping it closes it.
///
/// ```no_run
/// # async fn demo() -> Result<(), jsbox::SandboxError> {
/// use jsbox::{Sandbox, SandboxConfig};
///
/// let sandbox = Sandbox::connect(SandboxConfig::default()).await?;
/// let isolate = sandbox.create_isolate()?;
/// let value = isolate.evaluate("1 + 1")?.await?;
/// assert_eq!(value, "2");
/// # Ok(())
/// # }
/// ```
pub struct Sandbox {
    shared: Arc<SandboxShared>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("status", &self.shared.core.lock().status)
            .field("features", &self.shared.features)
            .field("engine", &self.shared.engine)
            .finish()
    }
}

impl Sandbox {
    /// Spawn the helper process and complete the handshake.
    ///
    /// Fails with [`SandboxError::AlreadyBound`] while another sandbox is
    /// bound, and with [`SandboxError::Timeout`] if the helper does not
    /// answer within the configured connect timeout.
    #[tracing::instrument(skip(config), fields(timeout_ms = config.connect_timeout.as_millis() as u64))]
    pub async fn connect(config: SandboxConfig) -> Result<Sandbox, SandboxError> {
        let binding = Binding::acquire()?;
        let child = host::spawn_helper(&config)?;
        let transport = Transport::from_child(child, config.max_ipc_message_size)?;
        Self::establish(transport, binding, &config).await
    }

    /// Bind a helper reachable over an arbitrary byte stream pair.
    ///
    /// The same binding rules as [`connect`](Self::connect) apply.
    pub async fn connect_with_io<R, W>(
        reader: R,
        writer: W,
        config: SandboxConfig,
    ) -> Result<Sandbox, SandboxError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let binding = Binding::acquire()?;
        let transport = Transport::spawn(reader, writer, config.max_ipc_message_size);
        Self::establish(transport, binding, &config).await
    }

    async fn establish(
        transport: Transport,
        binding: Binding,
        config: &SandboxConfig,
    ) -> Result<Sandbox, SandboxError> {
        let (names, engine) = match transport
            .handshake(config.max_ipc_message_size, config.connect_timeout)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                transport.shutdown();
                return Err(e);
            }
        };

        let features = FeatureSet::from_names(&names);
        tracing::info!(features = ?features.names(), engine = %engine, "sandbox connected");

        let shared = Arc::new(SandboxShared {
            transport: transport.clone(),
            features,
            engine,
            default_params: config.default_isolate_parameters,
            max_ipc_message_size: config.max_ipc_message_size,
            next_isolate_id: AtomicU64::new(1),
            core: Mutex::new(SandboxCore {
                status: Status::Ready,
                isolates: HashMap::new(),
                binding: Some(binding),
            }),
        });
        transport.subscribe(Arc::new(SandboxObserver {
            sandbox: Arc::downgrade(&shared),
        }));

        Ok(Sandbox { shared })
    }

    /// Features negotiated with the helper.
    pub fn features(&self) -> &FeatureSet {
        &self.shared.features
    }

    /// Whether the helper advertised `feature`.
    pub fn supports(&self, feature: Feature) -> bool {
        self.shared.supports(feature)
    }

    /// Engine description reported by the helper.
    pub fn engine(&self) -> &str {
        &self.shared.engine
    }

    /// Whether the helper connection is gone, by failure or by [`close`](Self::close).
    pub fn is_dead(&self) -> bool {
        self.shared.core.lock().status != Status::Ready
    }

    /// Number of isolates created and not yet closed.
    pub fn isolate_count(&self) -> usize {
        self.shared.core.lock().isolates.len()
    }

    /// Create an isolate with the configured default parameters.
    pub fn create_isolate(&self) -> Result<Isolate, SandboxError> {
        self.create_isolate_with(self.shared.default_params)
    }

    /// Create an isolate with explicit startup parameters.
    ///
    /// On a dead sandbox this returns an isolate that is already dead. It
    /// fails only on a closed sandbox, or when a heap cap is requested from
    /// a helper that does not advertise
    /// [`IsolateMaxHeapSize`](Feature::IsolateMaxHeapSize).
    pub fn create_isolate_with(
        &self,
        params: IsolateStartupParameters,
    ) -> Result<Isolate, SandboxError> {
        let shared = &self.shared;
        let mut core = shared.core.lock();
        let id = shared.next_isolate_id.fetch_add(1, Ordering::SeqCst);

        match core.status {
            Status::Closed => {
                return Err(SandboxError::IllegalState("sandbox is closed".into()));
            }
            Status::Dead => {
                return Ok(Isolate::from_inner(Arc::new(IsolateInner::new(
                    id,
                    params,
                    Arc::downgrade(shared),
                    Some(DeathCause::SandboxDead),
                ))));
            }
            Status::Ready => {}
        }

        if params.has_heap_cap() && !shared.supports(Feature::IsolateMaxHeapSize) {
            return Err(SandboxError::FeatureUnsupported(Feature::IsolateMaxHeapSize));
        }

        let dead = shared
            .transport
            .post(HostOp::CreateIsolate {
                isolate_id: id,
                max_heap_bytes: params.max_heap_bytes(),
            })
            .err()
            .map(|_| DeathCause::SandboxDead);
        let inner = Arc::new(IsolateInner::new(id, params, Arc::downgrade(shared), dead));
        if dead.is_none() {
            core.isolates.insert(id, Arc::clone(&inner));
        }
        tracing::debug!(
            isolate_id = id,
            max_heap_bytes = params.max_heap_bytes(),
            "isolate created"
        );
        Ok(Isolate::from_inner(inner))
    }

    /// Close the sandbox. Idempotent.
    ///
    /// Every pending evaluation in every isolate resolves with
    /// [`SandboxDead`](crate::Outcome::SandboxDead), the helper is shut down
    /// and the process-wide binding is released.
    pub fn close(&self) {
        let (isolates, binding) = {
            let mut core = self.shared.core.lock();
            if core.status == Status::Closed {
                return;
            }
            core.status = Status::Closed;
            let isolates: Vec<_> = core.isolates.drain().map(|(_, i)| i).collect();
            (isolates, core.binding.take())
        };

        for isolate in &isolates {
            isolate.mark_dead(DeathCause::SandboxDead);
        }
        self.shared.transport.shutdown();
        drop(binding);
        tracing::info!(isolates = isolates.len(), "sandbox closed");
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.close();
    }
}
