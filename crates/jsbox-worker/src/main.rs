//! jsbox worker: the helper process hosting JavaScript isolates.
//!
//! Spawned by [`jsbox::Sandbox::connect`] in the host process. Reads
//! [`HostFrame`]s from stdin, runs each isolate on its own thread, and writes
//! [`HelperMessage`]s to stdout.
//!
//! **Security**: This process runs with a clean environment. Scripts see no
//! filesystem, network or environment; the only host bridge is
//! `android.consumeNamedDataAsArrayBuffer`.

mod engine;
mod ops;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use jsbox::ipc::{
    read_message_with_limit, write_message, DeathReason, HelperMessage, HostFrame, HostOp,
    IsolateId, RequestId, Terminal, DEFAULT_MAX_IPC_MESSAGE_SIZE,
};
use jsbox::Feature;
use tokio::io::{self, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::engine::{Command, IsolateThread};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Clean environment: remove all env vars for security isolation
    let env_keys: Vec<String> = std::env::vars().map(|(k, _)| k).collect();
    for key in env_keys {
        std::env::remove_var(&key);
    }

    // Minimal logging to stderr (the host discards it unless debugging)
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();

    let max_ipc_size = Arc::new(AtomicUsize::new(DEFAULT_MAX_IPC_MESSAGE_SIZE));
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<HostFrame>();
    tokio::spawn(read_frames(frame_tx, Arc::clone(&max_ipc_size)));

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<HelperMessage>();
    let mut stdout = io::stdout();
    let mut helper = Helper {
        isolates: HashMap::new(),
        out: out_tx,
        max_ipc_size,
    };

    loop {
        tokio::select! {
            // Outgoing: replies and notifications from isolate threads
            msg = out_rx.recv() => {
                // `helper.out` keeps the channel open
                let Some(msg) = msg else { break };
                write_message(&mut stdout, &msg)
                    .await
                    .context("failed to write message to host")?;
                stdout.flush().await?;
            }

            // Incoming: host requests
            frame = frame_rx.recv() => {
                let Some(frame) = frame else { break };
                if !helper.handle(frame) {
                    break;
                }
            }
        }
    }

    helper.shut_down();

    // Flush what the isolates already answered
    while let Ok(msg) = out_rx.try_recv() {
        if write_message(&mut stdout, &msg).await.is_err() {
            break;
        }
    }
    stdout.flush().await.ok();

    Ok(())
}

/// Forward host frames to the main loop until stdin closes.
async fn read_frames(tx: mpsc::UnboundedSender<HostFrame>, max_ipc_size: Arc<AtomicUsize>) {
    let mut stdin = BufReader::new(io::stdin());
    loop {
        let limit = max_ipc_size.load(Ordering::SeqCst);
        match read_message_with_limit::<HostFrame, _>(&mut stdin, limit).await {
            Ok(Some(frame)) => {
                if tx.send(frame).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                tracing::error!(error = %e, "failed to read from host");
                return;
            }
        }
    }
}

struct Helper {
    isolates: HashMap<IsolateId, IsolateThread>,
    out: mpsc::UnboundedSender<HelperMessage>,
    max_ipc_size: Arc<AtomicUsize>,
}

impl Helper {
    /// Handle one host frame. Returns `false` when the helper should exit.
    fn handle(&mut self, frame: HostFrame) -> bool {
        let request_id = frame.request_id;
        match frame.op {
            HostOp::Connect {
                max_ipc_message_size,
            } => {
                self.max_ipc_size
                    .store(max_ipc_message_size, Ordering::SeqCst);
                self.send(HelperMessage::Connected {
                    request_id,
                    features: Feature::ALL.iter().map(|f| f.as_str().to_string()).collect(),
                    engine: format!("V8 {}", deno_core::v8::V8::get_version()),
                });
            }
            HostOp::CreateIsolate {
                isolate_id,
                max_heap_bytes,
            } => {
                if self.isolates.contains_key(&isolate_id) {
                    self.respond(
                        request_id,
                        Terminal::threw(format!("isolate {isolate_id} already exists")),
                    );
                    return true;
                }
                match IsolateThread::spawn(isolate_id, max_heap_bytes, self.out.clone()) {
                    Ok(thread) => {
                        self.isolates.insert(isolate_id, thread);
                        self.respond(request_id, Terminal::ack());
                    }
                    Err(e) => {
                        tracing::error!(isolate_id, error = %e, "failed to create isolate");
                        self.respond(request_id, Terminal::threw(format!("{e:#}")));
                        self.send(HelperMessage::IsolateDead {
                            isolate_id,
                            reason: DeathReason::Fault,
                        });
                    }
                }
            }
            HostOp::DestroyIsolate { isolate_id } => match self.isolates.remove(&isolate_id) {
                Some(thread) => {
                    thread.terminate();
                    if thread.send(Command::Destroy { request_id }).is_err() {
                        self.respond(request_id, Terminal::ack());
                    }
                }
                None => self.respond(request_id, Terminal::ack()),
            },
            HostOp::Evaluate { isolate_id, source } => {
                let delivered = self.isolates.get(&isolate_id).is_some_and(|thread| {
                    thread
                        .send(Command::Evaluate { request_id, source })
                        .is_ok()
                });
                if !delivered {
                    self.respond(request_id, Terminal::terminated());
                }
            }
            HostOp::ProvideData {
                isolate_id,
                name,
                data,
            } => {
                let terminal = match self.isolates.get(&isolate_id) {
                    Some(thread) => {
                        if thread.provide_data(name, data) {
                            Terminal::ack()
                        } else {
                            Terminal::threw("named data already provided")
                        }
                    }
                    None => Terminal::threw(format!("unknown isolate {isolate_id}")),
                };
                self.respond(request_id, terminal);
            }
            HostOp::CloseSandbox => return false,
        }
        true
    }

    fn shut_down(&mut self) {
        for (_, thread) in self.isolates.drain() {
            thread.terminate();
        }
    }

    fn respond(&self, request_id: RequestId, terminal: Terminal) {
        self.send(HelperMessage::Response {
            request_id,
            terminal,
        });
    }

    fn send(&self, msg: HelperMessage) {
        let _ = self.out.send(msg);
    }
}
