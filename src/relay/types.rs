use std::fmt;
use std::sync::Arc;

use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};

/// Relay server errors
#[derive(Debug, Error)]
pub enum RelayError {
    /// A second teacher tried to bind to a room whose seat is taken.
    /// The `Display` text is the exact wire error sent to the rejected client.
    #[error("Teacher is already connected in this room.")]
    TeacherSeatTaken,

    #[error("internal error: {0}")]
    Internal(String),
}

const CONN_ID_LEN: usize = 13;
const HEX_CHARS: &[u8] = b"0123456789abcdef";

/// Room key: opaque client-supplied string, matched exactly (no case folding,
/// no length bound). Cheap to clone so it can live in the registry map and on
/// each connection at the same time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(Arc<str>);

impl RoomId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

/// Connection ID: 13-byte fixed array ("conn_" + 8 hex)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    bytes: [u8; CONN_ID_LEN],
    len: u8,
}

impl ConnId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; CONN_ID_LEN];
        bytes[..5].copy_from_slice(b"conn_");

        let mut rng = rand::rng();
        let value: u32 = rng.random();

        for i in 0..8 {
            let nibble = ((value >> (28 - i * 4)) & 0xF) as usize;
            bytes[5 + i] = HEX_CHARS[nibble];
        }
        Self {
            bytes,
            len: CONN_ID_LEN as u8,
        }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ConnId {
    fn from(s: &str) -> Self {
        let mut bytes = [0u8; CONN_ID_LEN];
        let src = s.as_bytes();
        let len = src.len().min(CONN_ID_LEN);
        bytes[..len].copy_from_slice(&src[..len]);
        Self {
            bytes,
            len: len as u8,
        }
    }
}

/// Client role, fixed at admission. Parsed from the `type` query parameter
/// by case-sensitive exact match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Teacher,
    Student,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "teacher" => Some(Role::Teacher),
            "student" => Some(Role::Student),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Teacher => f.write_str("teacher"),
            Role::Student => f.write_str("student"),
        }
    }
}

/// Wrapper for relayed WebSocket payloads.
/// Text and Binary frames are carried verbatim; both are refcount-backed in
/// tungstenite, so broadcast cloning is O(1).
#[derive(Debug, Clone)]
pub struct Outbound(Message);

impl Outbound {
    /// Create a text payload from any string type
    pub fn text(s: impl Into<Utf8Bytes>) -> Self {
        Self(Message::Text(s.into()))
    }

    /// Get the inner message for the WebSocket sink
    pub fn into_inner(self) -> Message {
        self.0
    }
}

impl From<Message> for Outbound {
    fn from(msg: Message) -> Self {
        Self(msg)
    }
}

#[derive(Debug)]
pub(crate) struct Occupant {
    pub id: ConnId,
    /// Channel for outbound messages to this connection. A failed send means
    /// the connection's writer is gone, which routing treats as "not open".
    pub tx: mpsc::UnboundedSender<Outbound>,
}

#[derive(Debug, Default)]
pub(crate) struct Room {
    pub teacher: Option<Occupant>,
    pub students: Vec<Occupant>,
}

impl Room {
    pub fn is_empty(&self) -> bool {
        self.teacher.is_none() && self.students.is_empty()
    }
}
