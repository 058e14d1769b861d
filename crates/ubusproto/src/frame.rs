//! UBUS01 Frame Protocol
//!
//! Multipart ZMQ framing for calls into iot-ubusd. Routing fields (object,
//! method, request id) live in their own frames so the server can resolve a
//! binding before touching the JSON body.
//!
//! ## Wire Format
//!
//! A UBUS01 message is a 7-frame ZMQ multipart message:
//!
//! ```text
//! Frame 0: Protocol version    "UBUS01" (6 bytes)
//! Frame 1: Command             2 bytes (big-endian u16)
//! Frame 2: Content-Type        2 bytes (big-endian u16)
//! Frame 3: Request ID          16 bytes (UUID)
//! ─── fixed-width above / variable-width below ───
//! Frame 4: Object name         UTF-8 string (may be empty)
//! Frame 5: Method name         UTF-8 string (may be empty)
//! Frame 6: Body                bytes (interpretation per Content-Type)
//! ```
//!
//! ## ROUTER Socket Handling
//!
//! ROUTER sockets prepend identity frame(s). We scan for "UBUS01" to find
//! frame 0 and hand the identity back so replies can be routed.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use crate::envelope::{CallEnvelope, ReplyEnvelope};

/// Protocol version - bump on breaking changes
pub const PROTOCOL_VERSION: &[u8] = b"UBUS01";

/// Number of frames in a UBUS01 message (excluding identity prefix)
pub const FRAME_COUNT: usize = 7;

/// Command types (2 bytes, big-endian)
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Invoke object.method (client -> server)
    Request = 0x0001,
    /// Answer to Request or List (server -> client)
    Reply = 0x0002,
    /// Ask for the registered objects and their method signatures
    List = 0x0003,
    /// Bidirectional liveness check
    Heartbeat = 0x0004,
    /// Graceful shutdown notification
    Disconnect = 0x0005,
}

impl Command {
    pub fn from_u16(value: u16) -> Result<Self, FrameError> {
        match value {
            0x0001 => Ok(Command::Request),
            0x0002 => Ok(Command::Reply),
            0x0003 => Ok(Command::List),
            0x0004 => Ok(Command::Heartbeat),
            0x0005 => Ok(Command::Disconnect),
            other => Err(FrameError::InvalidCommand(other)),
        }
    }

    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// Content type for body interpretation (2 bytes, big-endian)
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    /// No body (heartbeats, list queries)
    Empty = 0x0000,
    /// UTF-8 JSON document
    Json = 0x0001,
}

impl ContentType {
    pub fn from_u16(value: u16) -> Result<Self, FrameError> {
        match value {
            0x0000 => Ok(ContentType::Empty),
            0x0001 => Ok(ContentType::Json),
            other => Err(FrameError::InvalidContentType(other)),
        }
    }

    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// A parsed UBUS01 multipart message
#[derive(Debug, Clone)]
pub struct BusFrame {
    pub command: Command,
    pub content_type: ContentType,
    pub request_id: Uuid,
    pub object: String,
    pub method: String,
    pub body: Bytes,
}

/// Errors during frame parsing
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Invalid protocol version: expected UBUS01")]
    InvalidProtocol,
    #[error("Missing frame: {0}")]
    MissingFrame(&'static str),
    #[error("Invalid command: {0:#06x}")]
    InvalidCommand(u16),
    #[error("Invalid content type: {0:#06x}")]
    InvalidContentType(u16),
    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("Invalid UUID in request ID")]
    InvalidUuid,
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Content type mismatch: expected {expected:?}, got {actual:?}")]
    ContentTypeMismatch {
        expected: ContentType,
        actual: ContentType,
    },
    #[error("Frame too short: expected {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },
}

fn read_u16(frame: &Bytes) -> Result<u16, FrameError> {
    if frame.len() < 2 {
        return Err(FrameError::FrameTooShort {
            expected: 2,
            actual: frame.len(),
        });
    }
    Ok(u16::from_be_bytes([frame[0], frame[1]]))
}

fn read_utf8(frame: &Bytes, what: &'static str) -> Result<String, FrameError> {
    std::str::from_utf8(frame)
        .map(str::to_string)
        .map_err(|_| FrameError::InvalidUtf8(what))
}

fn u16_frame(value: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(2);
    buf.put_u16(value);
    buf.freeze()
}

impl BusFrame {
    /// Parse frames, ignoring any identity prefix
    pub fn from_frames(frames: &[Bytes]) -> Result<Self, FrameError> {
        let (_, frame) = Self::from_frames_with_identity(frames)?;
        Ok(frame)
    }

    /// Parse frames, returning identity frames separately (for ROUTER socket replies)
    pub fn from_frames_with_identity(frames: &[Bytes]) -> Result<(Vec<Bytes>, Self), FrameError> {
        let proto_idx = frames
            .iter()
            .position(|f| f.as_ref() == PROTOCOL_VERSION)
            .ok_or(FrameError::InvalidProtocol)?;

        let identity: Vec<Bytes> = frames[..proto_idx].to_vec();

        let bus_frames = &frames[proto_idx..];
        if bus_frames.len() < FRAME_COUNT {
            return Err(FrameError::MissingFrame("insufficient frames after UBUS01"));
        }

        let command = Command::from_u16(read_u16(&bus_frames[1])?)?;
        let content_type = ContentType::from_u16(read_u16(&bus_frames[2])?)?;

        let reqid_frame = &bus_frames[3];
        if reqid_frame.len() < 16 {
            return Err(FrameError::FrameTooShort {
                expected: 16,
                actual: reqid_frame.len(),
            });
        }
        let request_id =
            Uuid::from_slice(&reqid_frame[..16]).map_err(|_| FrameError::InvalidUuid)?;

        let object = read_utf8(&bus_frames[4], "object")?;
        let method = read_utf8(&bus_frames[5], "method")?;
        let body = bus_frames[6].clone();

        Ok((
            identity,
            BusFrame {
                command,
                content_type,
                request_id,
                object,
                method,
                body,
            },
        ))
    }

    /// Serialize to a list of frame bytes (7 frames)
    pub fn to_frames(&self) -> Vec<Bytes> {
        vec![
            Bytes::from_static(PROTOCOL_VERSION),
            u16_frame(self.command.to_u16()),
            u16_frame(self.content_type.to_u16()),
            Bytes::copy_from_slice(self.request_id.as_bytes()),
            Bytes::from(self.object.clone()),
            Bytes::from(self.method.clone()),
            self.body.clone(),
        ]
    }

    /// Serialize with identity prefix (for ROUTER socket replies)
    pub fn to_frames_with_identity(&self, identity: &[Bytes]) -> Vec<Bytes> {
        let mut frames = identity.to_vec();
        frames.extend(self.to_frames());
        frames
    }

    fn empty(command: Command, request_id: Uuid) -> Self {
        Self {
            command,
            content_type: ContentType::Empty,
            request_id,
            object: String::new(),
            method: String::new(),
            body: Bytes::new(),
        }
    }

    fn json<T: Serialize>(command: Command, request_id: Uuid, payload: &T) -> Result<Self, FrameError> {
        let body = serde_json::to_vec(payload)?;
        Ok(Self {
            content_type: ContentType::Json,
            body: Bytes::from(body),
            ..Self::empty(command, request_id)
        })
    }

    /// Create a heartbeat frame
    pub fn heartbeat() -> Self {
        Self::empty(Command::Heartbeat, Uuid::new_v4())
    }

    /// Create a disconnect frame
    pub fn disconnect() -> Self {
        Self::empty(Command::Disconnect, Uuid::new_v4())
    }

    /// Create a list query
    pub fn list(request_id: Uuid) -> Self {
        Self::empty(Command::List, request_id)
    }

    /// Create a call request for `call.object`/`call.method`
    pub fn request(request_id: Uuid, call: &CallEnvelope) -> Result<Self, FrameError> {
        let mut frame = Self::json(Command::Request, request_id, &call.params)?;
        frame.object = call.object.clone();
        frame.method = call.method.clone();
        Ok(frame)
    }

    /// Create a reply carrying a call result
    pub fn reply(request_id: Uuid, reply: &ReplyEnvelope) -> Result<Self, FrameError> {
        Self::json(Command::Reply, request_id, reply)
    }

    /// Create a reply carrying any JSON-serializable payload
    pub fn reply_json<T: Serialize>(request_id: Uuid, payload: &T) -> Result<Self, FrameError> {
        Self::json(Command::Reply, request_id, payload)
    }

    /// Decode the JSON body (checks content_type)
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        if self.content_type != ContentType::Json {
            return Err(FrameError::ContentTypeMismatch {
                expected: ContentType::Json,
                actual: self.content_type,
            });
        }
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Interpret a Request frame as a call. An empty body means `{}`.
    pub fn to_call(&self) -> Result<CallEnvelope, FrameError> {
        let params = match self.content_type {
            ContentType::Empty => serde_json::Value::Object(Default::default()),
            ContentType::Json if self.body.is_empty() => {
                serde_json::Value::Object(Default::default())
            }
            ContentType::Json => self.payload()?,
        };
        Ok(CallEnvelope::new(&self.object, &self.method, params))
    }

    /// Any received command except DISCONNECT proves the peer is alive
    pub fn indicates_liveness(&self) -> bool {
        self.command != Command::Disconnect
    }
}
