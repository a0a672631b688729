//! Message envelope carried inside every frame.
//!
//! On the wire the envelope is a flat postcard record
//! `{ kind, id, name?, buffer? }`. Decoding lifts it into [`Envelope`], a sum
//! type the channel dispatches on exhaustively.

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Wire discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Request,
    Response,
    ResponseCancel,
    ResponseFailed,
    ResponseNotImplemented,
    StreamRequest,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    kind: MessageKind,
    id: u32,
    name: Option<String>,
    buffer: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Unary call; exactly one response is owed for `id`.
    Request {
        id: u32,
        name: String,
        payload: Vec<u8>,
    },
    /// Fire-and-forget call; never answered.
    StreamRequest {
        id: u32,
        name: String,
        payload: Vec<u8>,
    },
    Response {
        id: u32,
        payload: Vec<u8>,
    },
    ResponseCancel {
        id: u32,
        reason: String,
    },
    ResponseFailed {
        id: u32,
        error: String,
    },
    ResponseNotImplemented {
        id: u32,
    },
}

impl Envelope {
    pub fn id(&self) -> u32 {
        match self {
            Self::Request { id, .. }
            | Self::StreamRequest { id, .. }
            | Self::Response { id, .. }
            | Self::ResponseCancel { id, .. }
            | Self::ResponseFailed { id, .. }
            | Self::ResponseNotImplemented { id } => *id,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Request { .. } => MessageKind::Request,
            Self::StreamRequest { .. } => MessageKind::StreamRequest,
            Self::Response { .. } => MessageKind::Response,
            Self::ResponseCancel { .. } => MessageKind::ResponseCancel,
            Self::ResponseFailed { .. } => MessageKind::ResponseFailed,
            Self::ResponseNotImplemented { .. } => MessageKind::ResponseNotImplemented,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let wire = match self {
            Self::Request { id, name, payload } => WireMessage {
                kind: MessageKind::Request,
                id: *id,
                name: Some(name.clone()),
                buffer: Some(payload.clone()),
            },
            Self::StreamRequest { id, name, payload } => WireMessage {
                kind: MessageKind::StreamRequest,
                id: *id,
                name: Some(name.clone()),
                buffer: Some(payload.clone()),
            },
            Self::Response { id, payload } => WireMessage {
                kind: MessageKind::Response,
                id: *id,
                name: None,
                buffer: Some(payload.clone()),
            },
            Self::ResponseCancel { id, reason } => WireMessage {
                kind: MessageKind::ResponseCancel,
                id: *id,
                name: None,
                buffer: Some(reason.clone().into_bytes()),
            },
            Self::ResponseFailed { id, error } => WireMessage {
                kind: MessageKind::ResponseFailed,
                id: *id,
                name: None,
                buffer: Some(error.clone().into_bytes()),
            },
            Self::ResponseNotImplemented { id } => WireMessage {
                kind: MessageKind::ResponseNotImplemented,
                id: *id,
                name: None,
                buffer: None,
            },
        };
        Ok(postcard::to_allocvec(&wire)?)
    }

    /// Decode an envelope. Trailing bytes after the record are rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let (wire, rest): (WireMessage, &[u8]) = postcard::take_from_bytes(bytes)?;
        if !rest.is_empty() {
            return Err(CodecError::Malformed("trailing bytes after envelope"));
        }

        let WireMessage {
            kind,
            id,
            name,
            buffer,
        } = wire;
        let buffer = buffer.unwrap_or_default();

        Ok(match kind {
            MessageKind::Request => Self::Request {
                id,
                name: name.unwrap_or_default(),
                payload: buffer,
            },
            MessageKind::StreamRequest => Self::StreamRequest {
                id,
                name: name.unwrap_or_default(),
                payload: buffer,
            },
            MessageKind::Response => Self::Response {
                id,
                payload: buffer,
            },
            MessageKind::ResponseCancel => Self::ResponseCancel {
                id,
                reason: lossy_text(&buffer),
            },
            MessageKind::ResponseFailed => Self::ResponseFailed {
                id,
                error: lossy_text(&buffer),
            },
            MessageKind::ResponseNotImplemented => Self::ResponseNotImplemented { id },
        })
    }
}

fn lossy_text(buffer: &[u8]) -> String {
    String::from_utf8_lossy(buffer).into_owned()
}
