//! IPC protocol messages for bale worker processes.
//!
//! Uses length-prefixed JSON envelopes over stdin/stdout.
//! Format: 4-byte length (u32 LE) + JSON-encoded [`Envelope`].
//!
//! A decode failure of a single frame surfaces as [`Error::Json`]; the frame
//! has been fully consumed at that point, so the reader may keep going.
//! Everything else (truncated frames, oversized frames, pipe errors) is
//! reported as [`Error::Ipc`] and leaves the stream unusable.

use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Frames above this size are rejected (100MB).
const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// The correlation counter restarts from zero once it passes this bound.
const MAX_CORRELATION_COUNTER: u64 = 9_999_999_999;

/// What an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// Coordinator → worker: a unit of work to execute.
    Task,
    /// Worker → coordinator: the task finished, payload is its outcome.
    Done,
    /// Worker → coordinator: application message awaiting a reply.
    Message,
    /// Coordinator → worker: answer to a `Message` with the same correlation id.
    Reply,
}

/// Message exchanged over the worker channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub kind: EnvelopeKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Envelope {
    /// Envelope carrying a task description.
    pub fn task(payload: Value) -> Self {
        Self {
            kind: EnvelopeKind::Task,
            payload,
            correlation_id: None,
        }
    }

    /// Envelope reporting a task outcome.
    pub fn done(payload: Value) -> Self {
        Self {
            kind: EnvelopeKind::Done,
            payload,
            correlation_id: None,
        }
    }

    /// Worker-originated message keyed by `correlation_id`.
    pub fn message(payload: Value, correlation_id: impl Into<String>) -> Self {
        Self {
            kind: EnvelopeKind::Message,
            payload,
            correlation_id: Some(correlation_id.into()),
        }
    }

    /// Reply to a worker message.
    pub fn reply(payload: Value, correlation_id: Option<String>) -> Self {
        Self {
            kind: EnvelopeKind::Reply,
            payload,
            correlation_id,
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_FRAME_LEN {
            return Err(Error::Ipc(format!(
                "IPC message too large: {} bytes",
                bytes.len()
            )));
        }
        Ok(bytes)
    }
}

/// Generator for message correlation ids.
///
/// Ids have the form `<unix-millis>:<counter>`. Each worker runtime owns one
/// generator, so ids are unique for the lifetime of that worker.
#[derive(Debug, Default)]
pub struct CorrelationIds {
    counter: u64,
}

impl CorrelationIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the next id.
    pub fn next_id(&mut self) -> String {
        if self.counter > MAX_CORRELATION_COUNTER {
            self.counter = 0;
        }
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let id = format!("{}:{}", millis, self.counter);
        self.counter += 1;
        id
    }
}

/// Write an envelope to a writer using length-prefixed JSON encoding.
pub fn write_message<W: Write>(writer: &mut W, envelope: &Envelope) -> Result<()> {
    let bytes = envelope.encode()?;

    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message length: {}", e)))?;
    writer
        .write_all(&bytes)
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message body: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;

    Ok(())
}

/// Read an envelope from a reader using length-prefixed JSON encoding.
///
/// Returns `Ok(None)` when the stream ends cleanly between frames.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Option<Envelope>> {
    let mut len_bytes = [0u8; 4];
    let mut filled = 0;
    while filled < len_bytes.len() {
        match reader.read(&mut len_bytes[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(Error::Ipc(
                    "IPC stream closed inside a frame header".to_string(),
                ));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(Error::Ipc(format!(
                    "Failed to read IPC message length: {}",
                    e
                )));
            }
        }
    }

    let len = checked_len(len_bytes)?;
    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;

    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Async counterpart of [`write_message`].
pub async fn write_envelope<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<()> {
    let bytes = envelope.encode()?;

    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .await
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message length: {}", e)))?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message body: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;

    Ok(())
}

/// Async counterpart of [`read_message`].
///
/// Not cancellation safe: dropping the future mid-frame desynchronizes the stream.
pub async fn read_envelope<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Envelope>> {
    let mut len_bytes = [0u8; 4];
    let mut filled = 0;
    while filled < len_bytes.len() {
        let n = reader
            .read(&mut len_bytes[filled..])
            .await
            .map_err(|e| Error::Ipc(format!("Failed to read IPC message length: {}", e)))?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::Ipc(
                "IPC stream closed inside a frame header".to_string(),
            ));
        }
        filled += n;
    }

    let len = checked_len(len_bytes)?;
    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .await
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;

    Ok(Some(serde_json::from_slice(&bytes)?))
}

fn checked_len(len_bytes: [u8; 4]) -> Result<usize> {
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", len)));
    }
    Ok(len)
}
