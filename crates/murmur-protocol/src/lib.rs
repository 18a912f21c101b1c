//! # murmur-protocol
//!
//! Wire types for the Murmur realtime engine.
//!
//! This crate defines what clients and servers exchange over a connection:
//! messages and presences as they are pushed, the connect/action/ack/push
//! frames, and the codec that turns frames into WebSocket payloads.
//!
//! ## Frame Types
//!
//! - `ConnectFrame` - Credentials, first frame of every connection
//! - `ActionFrame` - Subscribe/unsubscribe requests and presence writes
//! - `AckFrame` - Result of a request, with an HTTP-style status
//! - `PushFrame` - Message, message count, presence and user events
//!
//! ## Example
//!
//! ```rust
//! use murmur_protocol::{codec, Action, ActionFrame, Encoding, TreeView};
//!
//! let frame = ActionFrame::new(Action::SubscribeMessages, ["/Proj/chat"])
//!     .with_tree_view(TreeView::OneLevel);
//!
//! let encoded = codec::encode_binary(&frame).unwrap();
//! let decoded: ActionFrame = codec::decode(&encoded, Encoding::MessagePack).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod message;
pub mod presence;

pub use codec::{decode, encode, Encoded, Encoding, ProtocolError};
pub use frames::{
    AckFrame, Action, ActionFrame, ConnectFrame, MessageCountEvent, MessageEvent, PushFrame,
    ServerFrame, TreeView, UserEvent,
};
pub use message::{generate_message_id, now_millis, Author, Label, Message, MessageId};
pub use presence::{Presence, PresenceStatus, UserPresence};
