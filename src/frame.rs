//! Length-prefixed JSON framing.
//!
//! Wire form of one frame:
//!
//! ```text
//! <decimal byte length>\n<compact JSON object>\n
//! ```
//!
//! Encoding sorts object keys and uses compact separators, so the same
//! frame always produces the same bytes. Exactly one frame is in flight per
//! direction at a time.

use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

pub const PROTOCOL: &str = "rag-cli-ipc";
pub const PROTOCOL_VERSION: u64 = 1;
pub const SERVER_NAME: &str = "rag-backend";

const SENTINEL: u8 = b'\n';

/// Longest accepted length line, excluding the sentinel. Enough for any `usize`.
pub const MAX_LEN_DIGITS: usize = 20;

/// One JSON envelope on the wire.
///
/// Fields are kept as a JSON object so unknown keys survive a round trip;
/// the accessors interpret the well-known ones.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Frame(Map<String, Value>);

impl Frame {
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// The `type` field, when it is a string.
    pub fn kind(&self) -> Option<&str> {
        self.0.get("type").and_then(Value::as_str)
    }

    /// The `path` field, when it is a non-empty string.
    pub fn path(&self) -> Option<&str> {
        self.0
            .get("path")
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty())
    }

    /// The `correlation_id` field, when it is a non-empty string.
    pub fn correlation_id(&self) -> Option<&str> {
        self.0
            .get("correlation_id")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
    }

    pub fn status(&self) -> Option<u16> {
        self.0
            .get("status")
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok())
    }

    /// The request body; absent or `null` bodies read as an empty object.
    pub fn body(&self) -> Value {
        match self.0.get("body") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(body) => body.clone(),
        }
    }

    pub fn handshake(correlation_id: Option<&str>) -> Self {
        let mut frame = Self::default();
        frame.insert("type", "handshake");
        frame.insert("protocol", PROTOCOL);
        frame.insert("version", PROTOCOL_VERSION);
        if let Some(id) = correlation_id {
            frame.insert("correlation_id", id);
        }
        frame
    }

    pub fn handshake_ack(correlation_id: Option<&str>) -> Self {
        let mut frame = Self::default();
        frame.insert("type", "handshake_ack");
        frame.insert("protocol", PROTOCOL);
        frame.insert("version", PROTOCOL_VERSION);
        frame.insert("server", SERVER_NAME);
        if let Some(id) = correlation_id {
            frame.insert("correlation_id", id);
        }
        frame
    }

    pub fn request(path: &str, correlation_id: Option<&str>, body: Value) -> Self {
        let mut frame = Self::default();
        frame.insert("type", "request");
        frame.insert("path", path);
        frame.insert("body", body);
        if let Some(id) = correlation_id {
            frame.insert("correlation_id", id);
        }
        frame
    }

    pub fn response(status: u16, correlation_id: &str, body: Value) -> Self {
        let mut frame = Self::default();
        frame.insert("type", "response");
        frame.insert("status", status);
        frame.insert("correlation_id", correlation_id);
        frame.insert("body", body);
        frame
    }
}

/// Serialize a frame to its exact wire bytes.
pub fn encode(frame: &Frame) -> Vec<u8> {
    // serde_json's default map is ordered by key, which gives sorted output.
    let payload = Value::Object(frame.0.clone()).to_string();
    let mut out = Vec::with_capacity(payload.len() + 12);
    out.extend_from_slice(payload.len().to_string().as_bytes());
    out.push(SENTINEL);
    out.extend_from_slice(payload.as_bytes());
    out.push(SENTINEL);
    out
}

/// Decode a JSON payload (without length prefix or sentinel) into a frame.
pub fn decode_payload(payload: &[u8]) -> Result<Frame, ProtocolError> {
    let map: Map<String, Value> = serde_json::from_slice(payload)?;
    Ok(Frame(map))
}

/// Read one frame.
///
/// Returns `Ok(None)` when the peer closes the stream before sending a
/// length line.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<Frame>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let declared = match read_length_line(reader).await? {
        Some(declared) => declared,
        None => return Ok(None),
    };
    if declared > max_frame_bytes {
        return Err(ProtocolError::FrameTooLarge {
            declared,
            limit: max_frame_bytes,
        });
    }

    let mut payload = vec![0u8; declared];
    let mut received = 0;
    while received < declared {
        let n = reader.read(&mut payload[received..]).await?;
        if n == 0 {
            return Err(ProtocolError::Truncated { declared, received });
        }
        received += n;
    }

    let mut sentinel = [0u8; 1];
    if reader.read(&mut sentinel).await? == 0 {
        return Err(ProtocolError::Truncated {
            declared: declared + 1,
            received: declared,
        });
    }
    if sentinel[0] != SENTINEL {
        return Err(ProtocolError::MissingSentinel);
    }

    decode_payload(&payload).map(Some)
}

/// Read and parse the length line without buffering more than
/// `MAX_LEN_DIGITS + 1` bytes. An over-long line is discarded through its
/// sentinel so the next frame starts cleanly.
async fn read_length_line<R>(reader: &mut R) -> Result<Option<usize>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(MAX_LEN_DIGITS + 1);
    let limit = (MAX_LEN_DIGITS + 1) as u64;
    let n = (&mut *reader).take(limit).read_until(SENTINEL, &mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    if line.last() != Some(&SENTINEL) && n as u64 == limit {
        skip_line(reader).await?;
        return Err(ProtocolError::InvalidLength(String::from_utf8_lossy(&line).into_owned()));
    }

    let text = std::str::from_utf8(&line)
        .map_err(|_| ProtocolError::InvalidLength(String::from_utf8_lossy(&line).into_owned()))?;
    let trimmed = text.trim();
    trimmed
        .parse()
        .map(Some)
        .map_err(|_| ProtocolError::InvalidLength(trimmed.to_string()))
}

async fn skip_line<R>(reader: &mut R) -> Result<(), ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(());
        }
        match buf.iter().position(|&b| b == SENTINEL) {
            Some(pos) => {
                reader.consume(pos + 1);
                return Ok(());
            }
            None => {
                let len = buf.len();
                reader.consume(len);
            }
        }
    }
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode(frame)).await?;
    writer.flush().await?;
    Ok(())
}
