//! Wire Codec
//!
//! Length-framed binary encoding for all RPC traffic. Every message on a
//! connection is one frame: a `u32` little-endian byte length followed by the
//! bincode body. Requests and responses travel on dedicated directions of the
//! stream, so the two envelope shapes need no discriminator:
//!
//! - request: `(req_id: u64, method: String, args: Vec<u8>)`
//! - response: `(req_id: u64, result: Vec<u8>)`
//!
//! The inner `args`/`result` blobs are themselves bincode encodings of the
//! positional-argument tuple and the return value. All peers must use this
//! codec; bincode is deterministic for the integer/string/blob/tuple coverage
//! the protocol needs.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Frames larger than this are treated as protocol corruption and the
/// connection carrying them is dropped.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// An RPC request envelope.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub method: String,
    pub args: Vec<u8>,
}

/// An RPC response envelope.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    pub result: Vec<u8>,
}

/// Raised by the unpacker when a peer declares an impossible frame. The only
/// recovery is dropping the connection.
#[derive(Debug, PartialEq, Eq)]
pub struct FrameTooLarge {
    pub declared: usize,
}

impl std::fmt::Display for FrameTooLarge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "declared frame length {} exceeds limit {}",
            self.declared, MAX_FRAME_LEN
        )
    }
}

impl std::error::Error for FrameTooLarge {}

/// Encodes a value as one length-prefixed frame.
pub fn encode_frame<T: Serialize>(value: &T) -> Vec<u8> {
    let body = bincode::serialize(value).expect("frame types always serialize");
    let mut out = Vec::with_capacity(LEN_PREFIX + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

/// Decodes a single value from a frame body or inner blob.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Option<T> {
    bincode::deserialize(bytes).ok()
}

/// Encodes a positional-argument tuple (or any single return value) as an
/// inner blob.
pub fn encode_value<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serialize(value).expect("wire values always serialize")
}

/// Incremental frame reassembler. Feed it whatever chunks the socket yields;
/// it hands back complete frame bodies in arrival order.
#[derive(Default)]
pub struct Unpacker {
    buf: Vec<u8>,
}

impl Unpacker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Extracts the next complete frame body, if one has fully arrived.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameTooLarge> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let declared =
            u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if declared > MAX_FRAME_LEN {
            return Err(FrameTooLarge { declared });
        }
        if self.buf.len() < LEN_PREFIX + declared {
            return Ok(None);
        }
        let body = self.buf[LEN_PREFIX..LEN_PREFIX + declared].to_vec();
        self.buf.drain(..LEN_PREFIX + declared);
        Ok(Some(body))
    }
}
