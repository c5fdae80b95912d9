//! Framed wire codec for hub/replica traffic.
//!
//! One transport message carries exactly one frame. A frame is a sequence of
//! variable-length unsigned integers and length-prefixed byte arrays:
//!
//! ```text
//! ┌──────────┬───────────────────────────────────────────┐
//! │ kind     │ body                                      │
//! │ varuint  │                                           │
//! ├──────────┼───────────────────────────────────────────┤
//! │ 0 sync   │ step varuint (0/1/2) + payload byte array │
//! │ 1 aware  │ opaque byte array (relayed, never parsed) │
//! │ 2 custom │ UTF-8 JSON string (control message)       │
//! └──────────┴───────────────────────────────────────────┘
//! ```
//!
//! Sync steps: 0 = "here is my state vector, send what I'm missing",
//! 1 = the answering diff, 2 = an incremental update.

use serde::{Deserialize, Serialize};

use crate::types::{Activity, ActivityPatch, SessionStats};

pub const KIND_SYNC: u64 = 0;
pub const KIND_AWARENESS: u64 = 1;
pub const KIND_CONTROL: u64 = 2;

pub const STEP_STATE_VECTOR: u64 = 0;
pub const STEP_ANSWER: u64 = 1;
pub const STEP_UPDATE: u64 = 2;

/// Sync sub-protocol message (frame kind 0).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncFrame {
    /// Step 0: sender's state vector.
    StateVector(Vec<u8>),
    /// Step 1: diff answering a step 0.
    Answer(Vec<u8>),
    /// Step 2: incremental update.
    Update(Vec<u8>),
}

/// Top-level wire frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Sync(SyncFrame),
    /// Opaque awareness bytes, fanned out without interpretation.
    Awareness(Vec<u8>),
    Control(ControlMessage),
}

/// JSON payload of a custom control frame (kind 2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Join {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Leave {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Heartbeat {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    UpdateActivity {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        activity: ActivityPatch,
    },
    Joined {
        data: JoinedData,
    },
    ParticipantJoined {
        data: ParticipantData,
    },
    ParticipantLeft {
        data: ParticipantData,
    },
    ActivityUpdate {
        data: ActivityUpdateData,
    },
    Error {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinedData {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub stats: SessionStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantData {
    #[serde(rename = "userId")]
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityUpdateData {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub activity: Activity,
}

impl Frame {
    pub fn state_vector(sv: Vec<u8>) -> Self {
        Frame::Sync(SyncFrame::StateVector(sv))
    }

    pub fn answer(diff: Vec<u8>) -> Self {
        Frame::Sync(SyncFrame::Answer(diff))
    }

    pub fn update(update: Vec<u8>) -> Self {
        Frame::Sync(SyncFrame::Update(update))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Frame::Control(ControlMessage::Error {
            error: message.into(),
        })
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::with_capacity(64);
        match self {
            Frame::Sync(sync) => {
                write_var(&mut buf, KIND_SYNC);
                let (step, payload) = match sync {
                    SyncFrame::StateVector(p) => (STEP_STATE_VECTOR, p),
                    SyncFrame::Answer(p) => (STEP_ANSWER, p),
                    SyncFrame::Update(p) => (STEP_UPDATE, p),
                };
                write_var(&mut buf, step);
                write_buf(&mut buf, payload);
            }
            Frame::Awareness(payload) => {
                write_var(&mut buf, KIND_AWARENESS);
                write_buf(&mut buf, payload);
            }
            Frame::Control(msg) => {
                write_var(&mut buf, KIND_CONTROL);
                let json = serde_json::to_string(msg)
                    .map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
                write_buf(&mut buf, json.as_bytes());
            }
        }
        Ok(buf)
    }

    /// Parse one frame from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(bytes);
        let kind = cursor.read_var()?;
        match kind {
            KIND_SYNC => {
                let step = cursor.read_var()?;
                let payload = cursor.read_buf()?.to_vec();
                match step {
                    STEP_STATE_VECTOR => Ok(Frame::Sync(SyncFrame::StateVector(payload))),
                    STEP_ANSWER => Ok(Frame::Sync(SyncFrame::Answer(payload))),
                    STEP_UPDATE => Ok(Frame::Sync(SyncFrame::Update(payload))),
                    other => Err(ProtocolError::InvalidStep(other)),
                }
            }
            KIND_AWARENESS => Ok(Frame::Awareness(cursor.read_buf()?.to_vec())),
            KIND_CONTROL => {
                let payload = cursor.read_buf()?;
                let json = std::str::from_utf8(payload).map_err(|_| ProtocolError::InvalidUtf8)?;
                let msg: ControlMessage = serde_json::from_str(json)
                    .map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
                Ok(Frame::Control(msg))
            }
            other => Err(ProtocolError::InvalidKind(other)),
        }
    }
}

/// Codec errors. Any of these means the sender's stream gets closed; no
/// other peer is affected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    UnexpectedEof,
    VarIntOverflow,
    InvalidKind(u64),
    InvalidStep(u64),
    InvalidUtf8,
    InvalidJson(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::UnexpectedEof => write!(f, "frame truncated"),
            ProtocolError::VarIntOverflow => write!(f, "varint exceeds 64 bits"),
            ProtocolError::InvalidKind(k) => write!(f, "unknown frame kind {k}"),
            ProtocolError::InvalidStep(s) => write!(f, "unknown sync step {s}"),
            ProtocolError::InvalidUtf8 => write!(f, "control payload is not UTF-8"),
            ProtocolError::InvalidJson(e) => write!(f, "control payload is not valid JSON: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Append `n` as a little-endian base-128 varuint.
pub fn write_var(buf: &mut Vec<u8>, mut n: u64) {
    loop {
        let byte = (n & 0x7f) as u8;
        n >>= 7;
        if n == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Append a length-prefixed byte array.
pub fn write_buf(buf: &mut Vec<u8>, payload: &[u8]) {
    write_var(buf, payload.len() as u64);
    buf.extend_from_slice(payload);
}

/// Reading cursor over one frame.
pub struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn read_var(&mut self) -> Result<u64, ProtocolError> {
        let mut value: u64 = 0;
        let mut shift: u32 = 0;
        loop {
            let byte = *self
                .bytes
                .get(self.pos)
                .ok_or(ProtocolError::UnexpectedEof)?;
            self.pos += 1;
            if shift >= 64 {
                return Err(ProtocolError::VarIntOverflow);
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    pub fn read_buf(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.read_var()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .ok_or(ProtocolError::UnexpectedEof)?;
        if end > self.bytes.len() {
            return Err(ProtocolError::UnexpectedEof);
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}
