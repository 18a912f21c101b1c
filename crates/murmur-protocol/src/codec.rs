//! Codec for encoding and decoding Murmur frames.
//!
//! Two encodings are supported and chosen per connection:
//!
//! - JSON, carried in WebSocket text messages.
//! - MessagePack with a 4 byte big-endian length prefix, carried in binary messages.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encoding spoken by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Json,
    MessagePack,
}

/// An encoded frame, ready to be written to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    Text(String),
    Binary(Bytes),
}

impl Encoded {
    /// Size of the encoded frame in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Encoded::Text(text) => text.len(),
            Encoded::Binary(data) => data.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encode a frame with the given encoding.
///
/// # Errors
///
/// Returns an error if the frame is too large or serialization fails.
pub fn encode<T: Serialize>(frame: &T, encoding: Encoding) -> Result<Encoded, ProtocolError> {
    match encoding {
        Encoding::Json => {
            let text = serde_json::to_string(frame)?;
            if text.len() > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge(text.len()));
            }
            Ok(Encoded::Text(text))
        }
        Encoding::MessagePack => encode_binary(frame).map(Encoded::Binary),
    }
}

/// Decode a single frame with the given encoding.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode<T: DeserializeOwned>(data: &[u8], encoding: Encoding) -> Result<T, ProtocolError> {
    match encoding {
        Encoding::Json => {
            if data.len() > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge(data.len()));
            }
            Ok(serde_json::from_slice(data)?)
        }
        Encoding::MessagePack => decode_binary(data),
    }
}

/// Encode a frame as length-prefixed MessagePack.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_binary<T: Serialize>(frame: &T) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

fn encode_into<T: Serialize>(frame: &T, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(frame)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a length-prefixed MessagePack frame.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode_binary<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{AckFrame, Action, ActionFrame, ConnectFrame, PushFrame, ServerFrame, TreeView};

    #[test]
    fn test_json_is_text() {
        let frame = ServerFrame::Ack(AckFrame::ok("connect", "connect OK"));
        let encoded = encode(&frame, Encoding::Json).unwrap();
        match encoded {
            Encoded::Text(text) => assert!(text.contains("\"status\":200")),
            Encoded::Binary(_) => panic!("JSON must be text"),
        }
    }

    #[test]
    fn test_binary_server_frames() {
        let frames = vec![
            ServerFrame::Ack(AckFrame::new("subscribeMessages", "already subscribed", 409)),
            ServerFrame::Push(PushFrame::message_count("/Proj/chat")),
            ServerFrame::Push(PushFrame::user("create", "carol")),
        ];

        for frame in frames {
            let Encoded::Binary(data) = encode(&frame, Encoding::MessagePack).unwrap() else {
                panic!("MessagePack must be binary");
            };
            let decoded: ServerFrame = decode(&data, Encoding::MessagePack).unwrap();
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn test_client_frames_json() {
        let connect: ConnectFrame =
            decode(br#"{"username":"alice","password":"pw"}"#, Encoding::Json).unwrap();
        assert_eq!(connect.username, "alice");

        let action = ActionFrame::new(Action::SubscribeMessages, ["all"]).with_tree_view(TreeView::Full);
        let Encoded::Text(text) = encode(&action, Encoding::Json).unwrap() else {
            panic!("JSON must be text");
        };
        assert!(text.contains("\"treeView\":\"fulltree\""));
    }

    #[test]
    fn test_decode_incomplete() {
        let frame = ConnectFrame::new("alice", "pw");
        let encoded = encode_binary(&frame).unwrap();

        match decode_binary::<ConnectFrame>(&encoded[..5]) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_json() {
        match decode::<ActionFrame>(b"{not json", Encoding::Json) {
            Err(ProtocolError::Json(_)) => {}
            other => panic!("Expected Json error, got {:?}", other),
        }
    }
}
