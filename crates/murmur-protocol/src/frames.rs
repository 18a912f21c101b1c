//! Frame types for the Murmur protocol.
//!
//! A client opens with a [`ConnectFrame`] and then sends [`ActionFrame`]s.
//! The server answers actions with [`AckFrame`]s and pushes events as
//! [`PushFrame`]s. Frames are JSON over text messages or length-prefixed
//! MessagePack over binary messages, see [`crate::codec`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::codec::ProtocolError;
use crate::message::Message;
use crate::presence::Presence;

/// Thread view a subscriber asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TreeView {
    /// Raw messages.
    #[default]
    #[serde(rename = "notree")]
    None,
    /// Every reply flattened under its root.
    #[serde(rename = "onetree")]
    OneLevel,
    /// Replies nested under their immediate parent.
    #[serde(rename = "fulltree")]
    Full,
}

impl TreeView {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TreeView::None => "notree",
            TreeView::OneLevel => "onetree",
            TreeView::Full => "fulltree",
        }
    }
}

impl fmt::Display for TreeView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TreeView {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "notree" => Ok(TreeView::None),
            "onetree" => Ok(TreeView::OneLevel),
            "fulltree" => Ok(TreeView::Full),
            other => Err(ProtocolError::Invalid(format!("Invalid treeView: {other}"))),
        }
    }
}

/// First frame of every connection.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectFrame {
    pub username: String,
    pub password: String,
}

impl ConnectFrame {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for ConnectFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectFrame")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Actions a connected client can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    SubscribeMessages,
    UnsubscribeMessages,
    SubscribeMessagesNew,
    UnsubscribeMessagesNew,
    SubscribePresences,
    UnsubscribePresences,
    SubscribeUsers,
    UnsubscribeUsers,
    WritePresence,
}

impl Action {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::SubscribeMessages => "subscribeMessages",
            Action::UnsubscribeMessages => "unsubscribeMessages",
            Action::SubscribeMessagesNew => "subscribeMessagesNew",
            Action::UnsubscribeMessagesNew => "unsubscribeMessagesNew",
            Action::SubscribePresences => "subscribePresences",
            Action::UnsubscribePresences => "unsubscribePresences",
            Action::SubscribeUsers => "subscribeUsers",
            Action::UnsubscribeUsers => "unsubscribeUsers",
            Action::WritePresence => "writePresence",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subscribeMessages" => Ok(Action::SubscribeMessages),
            "unsubscribeMessages" => Ok(Action::UnsubscribeMessages),
            "subscribeMessagesNew" => Ok(Action::SubscribeMessagesNew),
            "unsubscribeMessagesNew" => Ok(Action::UnsubscribeMessagesNew),
            "subscribePresences" => Ok(Action::SubscribePresences),
            "unsubscribePresences" => Ok(Action::UnsubscribePresences),
            "subscribeUsers" => Ok(Action::SubscribeUsers),
            "unsubscribeUsers" => Ok(Action::UnsubscribeUsers),
            "writePresence" => Ok(Action::WritePresence),
            other => Err(ProtocolError::Invalid(format!("Unknown action: {other}"))),
        }
    }
}

/// Request sent by a connected client.
///
/// `action` and `treeView` stay raw strings so an invalid value can still be
/// echoed back in the acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionFrame {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, rename = "treeView", skip_serializing_if = "Option::is_none")]
    pub tree_view: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
}

impl ActionFrame {
    /// Create an action frame for the given topics.
    #[must_use]
    pub fn new<I, S>(action: Action, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            action: action.as_str().to_string(),
            status: None,
            tree_view: None,
            topics: topics.into_iter().map(Into::into).collect(),
        }
    }

    /// Set the requested thread view.
    #[must_use]
    pub fn with_tree_view(mut self, tree_view: TreeView) -> Self {
        self.tree_view = Some(tree_view.as_str().to_string());
        self
    }

    /// Set the presence status.
    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Parse the requested action.
    ///
    /// # Errors
    ///
    /// Returns an error if the action is unknown.
    pub fn parse_action(&self) -> Result<Action, ProtocolError> {
        self.action.parse()
    }

    /// Parse the requested thread view, defaulting to [`TreeView::None`].
    ///
    /// # Errors
    ///
    /// Returns an error if the thread view is unknown.
    pub fn parse_tree_view(&self) -> Result<TreeView, ProtocolError> {
        self.tree_view.as_deref().unwrap_or_default().parse()
    }
}

/// Server acknowledgment of a connect or action frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckFrame {
    pub action: String,
    pub result: String,
    /// HTTP-style status code.
    pub status: u16,
}

impl AckFrame {
    #[must_use]
    pub fn new(action: impl Into<String>, result: impl Into<String>, status: u16) -> Self {
        Self {
            action: action.into(),
            result: result.into(),
            status,
        }
    }

    /// Create a 200 acknowledgment.
    #[must_use]
    pub fn ok(action: impl Into<String>, result: impl Into<String>) -> Self {
        Self::new(action, result, 200)
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// A message created, replied to or updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub action: String,
    pub username: String,
    pub message: Message,
}

/// New messages are available on a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCountEvent {
    pub topic: String,
}

/// A user account lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEvent {
    pub action: String,
    pub username: String,
}

/// Event pushed by the server to subscribed connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PushFrame {
    Message {
        #[serde(rename = "eventMsg")]
        event: MessageEvent,
        #[serde(rename = "oneTree", default, skip_serializing_if = "Option::is_none")]
        one_tree: Option<Message>,
        #[serde(rename = "fullTree", default, skip_serializing_if = "Option::is_none")]
        full_tree: Option<Message>,
    },
    MessageCount {
        #[serde(rename = "eventMsgNew")]
        event: MessageCountEvent,
    },
    Presence {
        #[serde(rename = "eventPresence")]
        presence: Presence,
    },
    User {
        #[serde(rename = "eventUser")]
        event: UserEvent,
    },
}

impl PushFrame {
    /// Create a raw message push.
    #[must_use]
    pub fn message(event: MessageEvent) -> Self {
        PushFrame::Message {
            event,
            one_tree: None,
            full_tree: None,
        }
    }

    /// Create a message push carrying a materialized thread.
    #[must_use]
    pub fn message_with_tree(event: MessageEvent, view: TreeView, tree: Message) -> Self {
        match view {
            TreeView::None => Self::message(event),
            TreeView::OneLevel => PushFrame::Message {
                event,
                one_tree: Some(tree),
                full_tree: None,
            },
            TreeView::Full => PushFrame::Message {
                event,
                one_tree: None,
                full_tree: Some(tree),
            },
        }
    }

    #[must_use]
    pub fn message_count(topic: impl Into<String>) -> Self {
        PushFrame::MessageCount {
            event: MessageCountEvent {
                topic: topic.into(),
            },
        }
    }

    #[must_use]
    pub fn presence(presence: Presence) -> Self {
        PushFrame::Presence { presence }
    }

    #[must_use]
    pub fn user(action: impl Into<String>, username: impl Into<String>) -> Self {
        PushFrame::User {
            event: UserEvent {
                action: action.into(),
                username: username.into(),
            },
        }
    }

    /// Short name of the event kind, for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            PushFrame::Message { .. } => "message",
            PushFrame::MessageCount { .. } => "message_count",
            PushFrame::Presence { .. } => "presence",
            PushFrame::User { .. } => "user",
        }
    }
}

/// Any frame sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Ack(AckFrame),
    Push(PushFrame),
}

impl From<AckFrame> for ServerFrame {
    fn from(ack: AckFrame) -> Self {
        ServerFrame::Ack(ack)
    }
}

impl From<PushFrame> for ServerFrame {
    fn from(push: PushFrame) -> Self {
        ServerFrame::Push(push)
    }
}
