//! JSON line protocol shared by the replica and client-facing servers.
//!
//! Every connection carries a request line followed by its response line;
//! a connection may be reused for further round trips.

use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::ClientId;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// One call from the coordinator to a replica.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaCall {
    /// Fault-injection hook: the replica sleeps this many seconds first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_secs: Option<u64>,
    pub op: ReplicaOp,
}

impl ReplicaCall {
    pub fn new(op: ReplicaOp) -> Self {
        Self {
            delay_secs: None,
            op,
        }
    }

    pub fn delayed(op: ReplicaOp, delay_secs: Option<u64>) -> Self {
        Self { delay_secs, op }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplicaOp {
    Put { tuple: String },
    Read { pattern: String },
    Take { pattern: String, client_id: ClientId },
    Dump,
    AcquireLock { client_id: ClientId, pattern: String },
    ReleaseLock { client_id: ClientId },
}

impl ReplicaOp {
    pub fn name(&self) -> &'static str {
        match self {
            ReplicaOp::Put { .. } => "put",
            ReplicaOp::Read { .. } => "read",
            ReplicaOp::Take { .. } => "take",
            ReplicaOp::Dump => "dump",
            ReplicaOp::AcquireLock { .. } => "acquire_lock",
            ReplicaOp::ReleaseLock { .. } => "release_lock",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplicaReply {
    Ok,
    Tuple { tuple: String },
    Tuples { tuples: Vec<String> },
    Error { message: String },
}

/// Requests accepted by the client-facing frontend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrontendRequest {
    Put {
        tuple: String,
        #[serde(default)]
        delays: Vec<u64>,
    },
    Read {
        pattern: String,
        #[serde(default)]
        delays: Vec<u64>,
    },
    Take {
        pattern: String,
        client_id: ClientId,
        #[serde(default)]
        delays: Vec<u64>,
    },
    Dump,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrontendResponse {
    Ok,
    Tuple { tuple: String },
    Tuples { tuples: Vec<String> },
    Error { message: String },
}

/// Longest frame quoted back in a decode error.
const QUOTED_FRAME_CHARS: usize = 120;

/// Reads the next JSON-line frame, skipping blank lines.
///
/// Returns `Ok(None)` once the peer has closed the connection. A frame that
/// does not decode is an `InvalidData` error that quotes the offending line.
pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }

        let frame = line.trim_end_matches(LINE_ENDINGS);
        if frame.is_empty() {
            continue;
        }

        return serde_json::from_str(frame)
            .map(Some)
            .map_err(|err| decode_error(frame, err));
    }
}

/// Writes `message` as one newline-terminated JSON frame and flushes it, so a
/// replica blocked on the reply sees it without waiting for more traffic.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut frame = serde_json::to_vec(message)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
    frame.push(b'\n');
    writer.write_all(&frame).await?;
    writer.flush().await
}

fn decode_error(frame: &str, err: serde_json::Error) -> io::Error {
    let quoted: String = frame.chars().take(QUOTED_FRAME_CHARS).collect();
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("undecodable frame `{quoted}`: {err}"),
    )
}
