//! One V8 isolate on its own thread.
//!
//! V8 isolates are `!Send`, so every isolate gets a dedicated OS thread with
//! a current-thread tokio runtime driving its `JsRuntime`. The stdio loop
//! talks to it through a command channel and a shared [`Control`] block.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use jsbox::ipc::{DeathReason, HelperMessage, IsolateId, LogLevel, RequestId, Terminal};
use tokio::sync::mpsc;

use crate::ops::{jsbox_ext, NamedDataStore};

/// Heap caps are rounded up to this many bytes.
const HEAP_GRANULARITY: u64 = 64 * 1024;

/// Smallest heap an isolate is given when a cap is requested.
const MIN_HEAP_BYTES: u64 = 16 * 1024 * 1024;

const BOOTSTRAP: &str = r#"((ops) => {
    const consume = ops.op_consume_named_data;
    const android = Object.freeze({
        consumeNamedDataAsArrayBuffer(name) {
            return new Promise((resolve) => {
                const view = consume(String(name));
                resolve(view.byteLength === view.buffer.byteLength ? view.buffer : view.slice().buffer);
            });
        },
    });
    Object.defineProperty(globalThis, "android", {
        value: android, writable: false, configurable: false, enumerable: false,
    });
    delete globalThis.Deno;
})(Deno.core.ops);"#;

const DESCRIBE: &str = r#"(() => {
    const wasmErrors = [WebAssembly.CompileError, WebAssembly.LinkError, WebAssembly.RuntimeError];
    const ErrorCtor = Error;
    const StringCtor = String;
    return (value) => {
        try {
            if (value instanceof ErrorCtor) {
                const wasm = wasmErrors.find((c) => value instanceof c);
                const name = wasm ? `WebAssembly.${wasm.name}` : value.name;
                return `Uncaught ${name}: ${value.message}`;
            }
            return `Uncaught ${StringCtor(value)}`;
        } catch {
            return "Uncaught exception";
        }
    };
})()"#;

// Marks a promise as handled so a rejection is reported to the host
// instead of the runtime's unhandled-rejection path.
const TRACK: &str = r#"(() => {
    const then = Promise.prototype.then;
    const ignore = () => {};
    return (promise) => { then.call(promise, undefined, ignore); };
})()"#;

/// Map a requested heap cap onto the V8 limit, `None` for the engine default.
pub fn heap_limit_bytes(requested: u64) -> Option<usize> {
    if requested == 0 {
        return None;
    }
    let rounded = requested
        .div_ceil(HEAP_GRANULARITY)
        .saturating_mul(HEAP_GRANULARITY)
        .max(MIN_HEAP_BYTES);
    Some(usize::try_from(rounded).unwrap_or(usize::MAX))
}

/// Work sent to an isolate thread.
#[derive(Debug)]
pub enum Command {
    /// Run source text.
    Evaluate {
        /// Host request id.
        request_id: RequestId,
        /// JavaScript source.
        source: String,
    },
    /// Finish up and exit.
    Destroy {
        /// Host request id.
        request_id: RequestId,
    },
}

/// State shared between the stdio loop and an isolate thread.
#[derive(Default)]
pub struct Control {
    terminating: AtomicBool,
    handle: OnceLock<v8::IsolateHandle>,
    data: NamedDataStore,
}

/// Stdio-loop handle to a running isolate thread.
pub struct IsolateThread {
    commands: mpsc::UnboundedSender<Command>,
    control: Arc<Control>,
}

impl IsolateThread {
    /// Start the thread. Creation failures inside the thread are reported
    /// to the host as an isolate death.
    pub fn spawn(
        isolate_id: IsolateId,
        max_heap_bytes: u64,
        out: mpsc::UnboundedSender<HelperMessage>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let control = Arc::new(Control::default());
        let thread_control = Arc::clone(&control);

        std::thread::Builder::new()
            .name(format!("jsbox-isolate-{isolate_id}"))
            .spawn(move || run_thread(isolate_id, max_heap_bytes, rx, thread_control, out))
            .context("failed to spawn isolate thread")?;

        Ok(Self {
            commands: tx,
            control,
        })
    }

    /// Queue a command. Gives it back if the thread has exited.
    pub fn send(&self, command: Command) -> Result<(), Command> {
        self.commands.send(command).map_err(|e| e.0)
    }

    /// Register named data for this isolate.
    pub fn provide_data(&self, name: String, data: Vec<u8>) -> bool {
        self.control.data.provide(name, data)
    }

    /// Interrupt whatever the isolate is running. Later evaluations are refused.
    pub fn terminate(&self) {
        self.control.terminating.store(true, Ordering::SeqCst);
        if let Some(handle) = self.control.handle.get() {
            handle.terminate_execution();
        }
    }
}

/// Reports the isolate lost if its thread unwinds.
///
/// Without it a panic would leave every accepted evaluation unanswered.
struct PanicNotice {
    isolate_id: IsolateId,
    out: mpsc::UnboundedSender<HelperMessage>,
}

impl Drop for PanicNotice {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            return;
        }
        tracing::error!(isolate_id = self.isolate_id, "isolate thread panicked");
        let _ = self.out.send(HelperMessage::Log {
            level: LogLevel::Error,
            message: format!("isolate {} panicked", self.isolate_id),
        });
        let _ = self.out.send(HelperMessage::IsolateDead {
            isolate_id: self.isolate_id,
            reason: DeathReason::Fault,
        });
    }
}

fn run_thread(
    isolate_id: IsolateId,
    max_heap_bytes: u64,
    commands: mpsc::UnboundedReceiver<Command>,
    control: Arc<Control>,
    out: mpsc::UnboundedSender<HelperMessage>,
) {
    let _notice = PanicNotice {
        isolate_id,
        out: out.clone(),
    };
    let fault = move |out: &mpsc::UnboundedSender<HelperMessage>, message: String| {
        tracing::error!(isolate_id, "{}", message);
        let _ = out.send(HelperMessage::Log {
            level: LogLevel::Error,
            message,
        });
        let _ = out.send(HelperMessage::IsolateDead {
            isolate_id,
            reason: DeathReason::Fault,
        });
    };

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            fault(&out, format!("failed to create tokio runtime: {e}"));
            return;
        }
    };

    rt.block_on(async move {
        match Engine::new(isolate_id, max_heap_bytes, commands, control, out.clone()) {
            Ok(engine) => engine.run().await,
            Err(e) => fault(&out, format!("failed to create isolate {isolate_id}: {e:#}")),
        }
    });
}

/// Request id meaning "no evaluation".
const NO_REQUEST: RequestId = 0;

/// What the near-heap-limit callback does on a given call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeapLimitAction {
    /// Request termination and raise the limit to this many bytes once.
    Terminate(usize),
    /// Termination did not get through: report the loss and stop the thread.
    Freeze,
}

fn heap_limit_action(already_triggered: bool, current_heap_limit: usize) -> HeapLimitAction {
    if already_triggered {
        HeapLimitAction::Freeze
    } else {
        HeapLimitAction::Terminate(current_heap_limit.saturating_mul(2))
    }
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    isolate_id: IsolateId,
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
    /// Evaluation whose script body is running.
    running: AtomicU64,
    /// Newest evaluation still waiting on its promise.
    newest_tracked: AtomicU64,
    out: mpsc::UnboundedSender<HelperMessage>,
}

impl HeapLimitState {
    fn offender(&self) -> Option<RequestId> {
        [&self.running, &self.newest_tracked]
            .into_iter()
            .map(|id| id.load(Ordering::SeqCst))
            .find(|id| *id != NO_REQUEST)
    }

    /// Blame the offender, announce the death and park the isolate thread
    /// for the rest of the process lifetime. Its heap is not reclaimed.
    fn freeze(&self) -> ! {
        let offender = self.offender();
        tracing::error!(isolate_id = self.isolate_id, ?offender, "heap limit ignored, freezing isolate");
        if let Some(request_id) = offender {
            let _ = self.out.send(HelperMessage::Response {
                request_id,
                terminal: Terminal::oom(),
            });
        }
        let _ = self.out.send(HelperMessage::IsolateDead {
            isolate_id: self.isolate_id,
            reason: DeathReason::MemoryLimit,
        });
        loop {
            std::thread::park();
        }
    }
}

/// V8 near-heap-limit callback.
///
/// The first call terminates execution and doubles the limit so the
/// termination can unwind. A second call means a builtin kept allocating
/// without checking for interrupts; the isolate is frozen rather than
/// letting V8 abort the whole process.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the engine's boxed `HeapLimitState`, which is
    // dropped after the isolate that invokes this callback.
    let state = unsafe { &*(data as *const HeapLimitState) };
    let already = state.triggered.swap(true, Ordering::SeqCst);
    match heap_limit_action(already, current_heap_limit) {
        HeapLimitAction::Terminate(limit) => {
            state.handle.terminate_execution();
            limit
        }
        HeapLimitAction::Freeze => state.freeze(),
    }
}

enum ScriptResult {
    Value(String),
    Threw(String),
    Promise(v8::Global<v8::Promise>),
    Terminated,
}

enum Flow {
    Continue,
    Exit,
}

// Field order is drop order: handles first, then the isolate, then the
// heap callback state it points into.
struct Engine {
    isolate_id: IsolateId,
    describe: v8::Global<v8::Function>,
    track: v8::Global<v8::Function>,
    /// Evaluations whose completion value is a promise that has not settled.
    tracked: BTreeMap<RequestId, v8::Global<v8::Promise>>,
    runtime: JsRuntime,
    heap: Box<HeapLimitState>,
    commands: mpsc::UnboundedReceiver<Command>,
    control: Arc<Control>,
    out: mpsc::UnboundedSender<HelperMessage>,
}

impl Engine {
    fn new(
        isolate_id: IsolateId,
        max_heap_bytes: u64,
        commands: mpsc::UnboundedReceiver<Command>,
        control: Arc<Control>,
        out: mpsc::UnboundedSender<HelperMessage>,
    ) -> Result<Self> {
        let create_params =
            heap_limit_bytes(max_heap_bytes).map(|limit| v8::CreateParams::default().heap_limits(0, limit));

        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![jsbox_ext::init_ops_and_esm()],
            create_params,
            ..Default::default()
        });
        runtime.op_state().borrow_mut().put(control.data.clone());

        let heap = Box::new(HeapLimitState {
            isolate_id,
            handle: runtime.v8_isolate().thread_safe_handle(),
            triggered: AtomicBool::new(false),
            running: AtomicU64::new(NO_REQUEST),
            newest_tracked: AtomicU64::new(NO_REQUEST),
            out: out.clone(),
        });
        runtime.v8_isolate().add_near_heap_limit_callback(
            near_heap_limit_callback,
            &*heap as *const HeapLimitState as *mut std::ffi::c_void,
        );
        let _ = control.handle.set(runtime.v8_isolate().thread_safe_handle());

        runtime
            .execute_script("[jsbox:bootstrap]", BOOTSTRAP)
            .map_err(|e| anyhow::anyhow!("bootstrap failed: {e}"))?;
        let describe = compile_function(&mut runtime, "[jsbox:describe]", DESCRIBE)?;
        let track = compile_function(&mut runtime, "[jsbox:track]", TRACK)?;

        tracing::debug!(isolate_id, max_heap_bytes, "isolate ready");

        Ok(Self {
            isolate_id,
            describe,
            track,
            tracked: BTreeMap::new(),
            runtime,
            heap,
            commands,
            control,
            out,
        })
    }

    async fn run(mut self) {
        // Set when the event loop has nothing left to do.
        let mut idle = true;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Evaluate { request_id, source }) => {
                        if let Flow::Exit = self.evaluate(request_id, &source) {
                            return;
                        }
                        idle = false;
                    }
                    Some(Command::Destroy { request_id }) => {
                        self.shut_down(DeathReason::Closed);
                        self.respond(request_id, Terminal::ack());
                        return;
                    }
                    None => return,
                },
                result = self.runtime.run_event_loop(PollEventLoopOptions::default()), if !idle => {
                    idle = true;
                    if self.heap.triggered.load(Ordering::SeqCst) {
                        let offender = self.tracked.keys().next_back().copied();
                        self.fail(offender, DeathReason::MemoryLimit);
                        return;
                    }
                    if let Err(e) = result {
                        if self.control.terminating.load(Ordering::SeqCst) {
                            // The destroy command is already queued.
                            continue;
                        }
                        tracing::warn!(isolate_id = self.isolate_id, error = %e, "event loop error");
                        let _ = self.out.send(HelperMessage::Log {
                            level: LogLevel::Warn,
                            message: format!("isolate {}: {e}", self.isolate_id),
                        });
                    }
                    self.settle_tracked();
                }
            }
        }
    }

    fn evaluate(&mut self, request_id: RequestId, source: &str) -> Flow {
        if self.control.terminating.load(Ordering::SeqCst) {
            self.respond(request_id, Terminal::terminated());
            return Flow::Continue;
        }

        self.heap.running.store(request_id, Ordering::SeqCst);
        let result = self.run_script(source);
        self.heap.running.store(NO_REQUEST, Ordering::SeqCst);

        // The limit may have been hit inside a builtin that returned normally.
        if self.heap.triggered.load(Ordering::SeqCst) {
            self.fail(Some(request_id), DeathReason::MemoryLimit);
            return Flow::Exit;
        }

        match result {
            ScriptResult::Value(value) => self.respond(request_id, Terminal::value(value)),
            ScriptResult::Threw(message) => self.respond(request_id, Terminal::threw(message)),
            ScriptResult::Promise(promise) => {
                self.tracked.insert(request_id, promise);
                self.note_newest_tracked();
                self.settle_tracked();
            }
            ScriptResult::Terminated => {
                self.respond(request_id, Terminal::terminated());
                if !self.control.terminating.load(Ordering::SeqCst) {
                    self.fail(None, DeathReason::Fault);
                    return Flow::Exit;
                }
            }
        }
        Flow::Continue
    }

    fn run_script(&mut self, source: &str) -> ScriptResult {
        let scope = &mut self.runtime.handle_scope();
        let tc = &mut v8::TryCatch::new(scope);

        let Some(code) = v8::String::new(tc, source) else {
            return ScriptResult::Threw("Uncaught RangeError: source text too large".into());
        };
        let completion = v8::Script::compile(tc, code, None).and_then(|script| script.run(tc));

        if let Some(value) = completion {
            if let Ok(promise) = v8::Local::<v8::Promise>::try_from(value) {
                let track = v8::Local::new(tc, &self.track);
                let recv = v8::undefined(tc).into();
                track.call(tc, recv, &[promise.into()]);
                return ScriptResult::Promise(v8::Global::new(tc, promise));
            }
            if let Some(text) = value.to_string(tc) {
                return ScriptResult::Value(text.to_rust_string_lossy(tc));
            }
        }

        if tc.has_terminated() {
            return ScriptResult::Terminated;
        }
        match tc.exception() {
            Some(exception) => ScriptResult::Threw(describe_value(tc, &self.describe, exception)),
            None => ScriptResult::Terminated,
        }
    }

    /// Answer every tracked evaluation whose promise has settled.
    fn settle_tracked(&mut self) {
        if self.tracked.is_empty() {
            return;
        }

        let mut settled = Vec::new();
        {
            let scope = &mut self.runtime.handle_scope();
            for (request_id, promise) in &self.tracked {
                let promise = v8::Local::new(scope, promise);
                let terminal = match promise.state() {
                    v8::PromiseState::Pending => continue,
                    v8::PromiseState::Fulfilled => {
                        let value = promise.result(scope);
                        match stringify(scope, &self.describe, value) {
                            Ok(text) => Terminal::value(text),
                            Err(message) => Terminal::threw(message),
                        }
                    }
                    v8::PromiseState::Rejected => {
                        let reason = promise.result(scope);
                        Terminal::threw(describe_value(scope, &self.describe, reason))
                    }
                };
                settled.push((*request_id, terminal));
            }
        }

        for (request_id, terminal) in settled {
            self.tracked.remove(&request_id);
            self.respond(request_id, terminal);
        }
        self.note_newest_tracked();
    }

    fn note_newest_tracked(&self) {
        let newest = self.tracked.keys().next_back().copied();
        self.heap
            .newest_tracked
            .store(newest.unwrap_or(NO_REQUEST), Ordering::SeqCst);
    }

    /// The isolate is lost: blame `offender`, terminate everything else
    /// and tell the host.
    fn fail(&mut self, offender: Option<RequestId>, reason: DeathReason) {
        tracing::warn!(isolate_id = self.isolate_id, ?offender, ?reason, "isolate lost");
        if let Some(request_id) = offender {
            self.tracked.remove(&request_id);
            self.respond(request_id, Terminal::oom());
        }
        self.shut_down(reason);
    }

    /// Answer all outstanding work as terminated and announce the death.
    fn shut_down(&mut self, reason: DeathReason) {
        for request_id in std::mem::take(&mut self.tracked).into_keys() {
            self.respond(request_id, Terminal::terminated());
        }

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Evaluate { request_id, .. } => {
                    self.respond(request_id, Terminal::terminated())
                }
                Command::Destroy { request_id } => self.respond(request_id, Terminal::ack()),
            }
        }

        self.control.data.clear();
        let _ = self.out.send(HelperMessage::IsolateDead {
            isolate_id: self.isolate_id,
            reason,
        });
    }

    fn respond(&self, request_id: RequestId, terminal: Terminal) {
        let _ = self.out.send(HelperMessage::Response {
            request_id,
            terminal,
        });
    }
}

fn compile_function(
    runtime: &mut JsRuntime,
    name: &'static str,
    source: &'static str,
) -> Result<v8::Global<v8::Function>> {
    let value = runtime
        .execute_script(name, source)
        .map_err(|e| anyhow::anyhow!("{name} failed: {e}"))?;
    let scope = &mut runtime.handle_scope();
    let local = v8::Local::new(scope, value);
    let function = v8::Local::<v8::Function>::try_from(local)
        .map_err(|_| anyhow::anyhow!("{name} did not produce a function"))?;
    Ok(v8::Global::new(scope, function))
}

/// ToString `value`, or describe what the conversion threw.
fn stringify(
    scope: &mut v8::HandleScope,
    describe: &v8::Global<v8::Function>,
    value: v8::Local<v8::Value>,
) -> Result<String, String> {
    let tc = &mut v8::TryCatch::new(scope);
    if let Some(text) = value.to_string(tc) {
        return Ok(text.to_rust_string_lossy(tc));
    }
    match tc.exception() {
        Some(exception) if !tc.has_terminated() => Err(describe_value(tc, describe, exception)),
        _ => Err("Uncaught exception".to_string()),
    }
}

/// Render a thrown value as `Uncaught <Name>: <message>`.
fn describe_value(
    scope: &mut v8::HandleScope,
    describe: &v8::Global<v8::Function>,
    value: v8::Local<v8::Value>,
) -> String {
    let tc = &mut v8::TryCatch::new(scope);
    let describe = v8::Local::new(tc, describe);
    let recv = v8::undefined(tc).into();
    match describe.call(tc, recv, &[value]) {
        Some(text) => text.to_rust_string_lossy(tc),
        None => "Uncaught exception".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_selects_the_default_heap() {
        assert_eq!(heap_limit_bytes(0), None);
    }

    #[test]
    fn small_caps_are_raised_to_the_floor() {
        for requested in [1, 4095, 4096, 65535, 65536, MIN_HEAP_BYTES - 1] {
            assert_eq!(heap_limit_bytes(requested), Some(MIN_HEAP_BYTES as usize));
        }
    }

    #[test]
    fn caps_round_up_to_granularity() {
        let requested = 100 * 1024 * 1024 + 1;
        assert_eq!(
            heap_limit_bytes(requested),
            Some((100 * 1024 * 1024 + HEAP_GRANULARITY) as usize)
        );
        assert_eq!(
            heap_limit_bytes(100 * 1024 * 1024),
            Some(100 * 1024 * 1024)
        );
    }

    #[test]
    fn heap_limit_doubles_once_then_freezes() {
        assert_eq!(
            heap_limit_action(false, 100 << 20),
            HeapLimitAction::Terminate(200 << 20)
        );
        assert_eq!(heap_limit_action(true, 200 << 20), HeapLimitAction::Freeze);
        assert_eq!(
            heap_limit_action(false, usize::MAX),
            HeapLimitAction::Terminate(usize::MAX)
        );
    }

    #[test]
    fn panicking_isolate_thread_reports_a_fault() {
        let (out, mut rx) = mpsc::unbounded_channel();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _notice = PanicNotice {
                isolate_id: 7,
                out: out.clone(),
            };
            panic!("op blew up");
        }));
        assert!(result.is_err());

        let mut dead = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let HelperMessage::IsolateDead { isolate_id, reason } = msg {
                dead.push((isolate_id, reason));
            }
        }
        assert_eq!(dead, vec![(7, DeathReason::Fault)]);
    }

    #[test]
    fn clean_exit_sends_no_fault() {
        let (out, mut rx) = mpsc::unbounded_channel();
        drop(PanicNotice { isolate_id: 3, out });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn huge_caps_are_accepted() {
        let limit = heap_limit_bytes(1 << 50).unwrap();
        assert!(limit >= MIN_HEAP_BYTES as usize);
        assert!(heap_limit_bytes(u64::MAX).is_some());
    }
}
