//! Framed message protocol between the master and a worker process.
//!
//! Every frame is a 4-byte big-endian length followed by a JSON body. The
//! master writes [`MasterMessage`]s to the worker's stdin and reads
//! [`WorkerMessage`]s from its stdout.

use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};

use crate::queue::{base64_body, Disposition, MessageId};
use crate::worker::engine::FinishedState;

/// Largest frame either side accepts.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Errors on a worker channel.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("Channel IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid frame: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),

    #[error("Channel closed")]
    Closed,
}

impl IpcError {
    /// Whether the peer has gone away rather than the channel misbehaving.
    pub fn is_disconnect(&self) -> bool {
        match self {
            IpcError::Closed => true,
            IpcError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// A unit of work as shipped to a worker. The worker never sees the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireUnit {
    pub id: MessageId,
    pub queue_name: String,
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,
}

/// Master to worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MasterMessage {
    /// Run these units in order and report back with `Done`.
    Assign { batch_id: u64, units: Vec<WireUnit> },
    /// Finish the current batch, if any, then exit.
    Shutdown,
}

/// Outcome of one unit, as reported by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitResult {
    pub id: MessageId,
    pub state: FinishedState,
    pub disposition: Disposition,
    pub duration_ms: u64,
    /// `None` when the body could not be decoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
}

/// Worker to master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Sent once after start-up; the worker can take an assignment.
    Ready { worker_id: u32, pid: u32 },
    /// The batch finished. `retiring` means the worker exits next.
    Done {
        worker_id: u32,
        batch_id: u64,
        results: Vec<UnitResult>,
        retiring: bool,
    },
}

impl WorkerMessage {
    pub fn worker_id(&self) -> u32 {
        match self {
            WorkerMessage::Ready { worker_id, .. } | WorkerMessage::Done { worker_id, .. } => {
                *worker_id
            }
        }
    }
}

pub type FrameReader<R> = FramedRead<R, LengthDelimitedCodec>;

/// Wraps a byte stream in the length-delimited frame decoder.
pub fn frame_reader<R: AsyncRead>(reader: R) -> FrameReader<R> {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_read(reader)
}

/// Serializes a message into a frame body, rejecting bodies the peer's
/// decoder would refuse.
pub fn encode<M: Serialize>(message: &M) -> Result<Vec<u8>, IpcError> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(IpcError::FrameTooLarge(body.len()));
    }
    Ok(body)
}

/// Writes an already encoded frame body and flushes it.
pub async fn send_encoded<W>(writer: &mut W, body: &[u8]) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME_LEN {
        return Err(IpcError::FrameTooLarge(body.len()));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Writes one framed message and flushes it.
pub async fn send<W, M>(writer: &mut W, message: &M) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let body = encode(message)?;
    send_encoded(writer, &body).await
}

/// Reads the next message. `Ok(None)` means the peer closed the stream
/// cleanly between frames.
pub async fn recv<R, M>(reader: &mut FrameReader<R>) -> Result<Option<M>, IpcError>
where
    R: AsyncRead + Unpin,
    M: DeserializeOwned,
{
    match reader.next().await {
        None => Ok(None),
        Some(Err(e)) => Err(IpcError::Io(e)),
        Some(Ok(frame)) => Ok(Some(serde_json::from_slice(&frame)?)),
    }
}
