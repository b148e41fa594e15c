//! Wire protocol between the host and the helper process.
//!
//! Uses length-delimited JSON messages: 4-byte big-endian length prefix + JSON payload.
//! Host requests are [`HostFrame`]s carrying a request id and a [`HostOp`];
//! the helper answers with [`HelperMessage`]s.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default maximum IPC message size: 64 MB.
pub const DEFAULT_MAX_IPC_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Opaque id correlating a request with its response.
pub type RequestId = u64;

/// Identifier of an isolate within one sandbox.
pub type IsolateId = u64;

/// A request from the host to the helper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostFrame {
    /// Correlation id, unique per connection.
    pub request_id: RequestId,
    /// The operation to perform.
    pub op: HostOp,
}

/// Operations the host can ask the helper to perform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostOp {
    /// Handshake. The helper answers with [`HelperMessage::Connected`].
    Connect {
        /// Largest frame the host will accept.
        max_ipc_message_size: usize,
    },
    /// Create a fresh isolate with its own realm.
    CreateIsolate {
        /// Id chosen by the host.
        isolate_id: IsolateId,
        /// Soft heap ceiling in bytes, 0 for the helper default.
        max_heap_bytes: u64,
    },
    /// Terminate and free an isolate.
    DestroyIsolate {
        /// The isolate to destroy.
        isolate_id: IsolateId,
    },
    /// Run source text in an isolate.
    Evaluate {
        /// Target isolate.
        isolate_id: IsolateId,
        /// JavaScript source text.
        source: String,
    },
    /// Register a named byte buffer in an isolate.
    ProvideData {
        /// Target isolate.
        isolate_id: IsolateId,
        /// Name the script consumes the buffer by.
        name: String,
        /// The bytes, base64 encoded on the wire.
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// Shut the helper down.
    CloseSandbox,
}

/// Messages sent from the helper to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HelperMessage {
    /// Reply to [`HostOp::Connect`].
    Connected {
        /// Matches the connect request.
        request_id: RequestId,
        /// Advertised feature names.
        features: Vec<String>,
        /// Human-readable engine description.
        #[serde(default)]
        engine: String,
    },
    /// Terminal reply to any other request.
    Response {
        /// Matches the request.
        request_id: RequestId,
        /// Outcome record.
        terminal: Terminal,
    },
    /// Unsolicited: the helper lost an isolate.
    IsolateDead {
        /// The isolate that died.
        isolate_id: IsolateId,
        /// Why it died.
        reason: DeathReason,
    },
    /// A diagnostic line from the helper.
    Log {
        /// Severity.
        level: LogLevel,
        /// The log message text.
        message: String,
    },
}

/// Terminal record for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Terminal {
    /// What happened.
    pub kind: TerminalKind,
    /// Completion value or error text, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Kind of a [`Terminal`] record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalKind {
    /// Completed; `message` holds the string-coerced completion value.
    Value,
    /// Threw or rejected; `message` holds the error text.
    Threw,
    /// This request pushed the isolate past its heap limit.
    Oom,
    /// The isolate was terminated while this request was pending.
    Terminated,
}

impl Terminal {
    /// A successful completion carrying `value`.
    pub fn value(value: impl Into<String>) -> Self {
        Self {
            kind: TerminalKind::Value,
            message: Some(value.into()),
        }
    }

    /// An acknowledgement with no payload.
    pub fn ack() -> Self {
        Self {
            kind: TerminalKind::Value,
            message: None,
        }
    }

    /// A thrown exception or rejected promise.
    pub fn threw(message: impl Into<String>) -> Self {
        Self {
            kind: TerminalKind::Threw,
            message: Some(message.into()),
        }
    }

    /// Out of memory; this request is the offender.
    pub fn oom() -> Self {
        Self {
            kind: TerminalKind::Oom,
            message: None,
        }
    }

    /// Terminated as a bystander.
    pub fn terminated() -> Self {
        Self {
            kind: TerminalKind::Terminated,
            message: None,
        }
    }
}

/// Why the helper lost an isolate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeathReason {
    /// The isolate exceeded its heap limit.
    MemoryLimit,
    /// Any other engine-side fault.
    Fault,
    /// The isolate was destroyed on request.
    Closed,
}

/// Severity of a helper log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Something failed.
    Error,
    /// Something looks wrong.
    Warn,
    /// Routine information.
    Info,
    /// Verbose diagnostics.
    Debug,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Write a length-delimited JSON message to an async writer.
///
/// Format: 4-byte big-endian length prefix followed by the JSON payload bytes.
pub async fn write_message<T: Serialize, W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &T,
) -> Result<(), std::io::Error> {
    let payload = serde_json::to_vec(msg)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "IPC payload too large: {} bytes (max {} bytes)",
                payload.len(),
                u32::MAX
            ),
        )
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-delimited JSON message from an async reader.
///
/// Returns `None` if the reader has reached EOF (clean shutdown).
/// Uses [`DEFAULT_MAX_IPC_MESSAGE_SIZE`] as the size limit.
pub async fn read_message<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<T>, std::io::Error> {
    read_message_with_limit(reader, DEFAULT_MAX_IPC_MESSAGE_SIZE).await
}

/// Read a length-delimited JSON message with a configurable size limit.
///
/// Returns `None` if the reader has reached EOF (clean shutdown).
pub async fn read_message_with_limit<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<T>, std::io::Error> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "IPC message too large: {} bytes (limit: {} bytes)",
                len, max_size
            ),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let msg: T = serde_json::from_slice(&payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(msg))
}

/// Room reserved for the fixed fields of a host frame around its payload.
const FRAME_OVERHEAD: usize = 256;

/// Length of `s` once written as a JSON string literal.
fn json_string_len(s: &str) -> usize {
    let escaped: usize = s
        .chars()
        .map(|c| match c {
            '"' | '\\' | '\u{8}' | '\u{c}' | '\n' | '\r' | '\t' => 2,
            c if (c as u32) < 0x20 => 6,
            c => c.len_utf8(),
        })
        .sum();
    escaped + 2
}

/// Upper bound on the encoded size of an `evaluate` frame for `source`.
pub fn evaluate_frame_len(source: &str) -> usize {
    json_string_len(source).saturating_add(FRAME_OVERHEAD)
}

/// Upper bound on the encoded size of a `provide_data` frame.
pub fn provide_data_frame_len(name: &str, data_len: usize) -> usize {
    let encoded = data_len.div_ceil(3).saturating_mul(4);
    encoded
        .saturating_add(json_string_len(name))
        .saturating_add(FRAME_OVERHEAD)
}
