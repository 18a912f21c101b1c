//! Messages as they travel on the wire.
//!
//! A message belongs to one or more topics and may be a reply to another
//! message. Replies carry both their immediate parent (`inReplyOfID`) and
//! the root of their thread (`inReplyOfIDRoot`); both are empty for a root.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A message identifier.
pub type MessageId = String;

/// Atomic counter for ensuring unique IDs even within the same millisecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Generate a unique, 24 hex digit message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    let timestamp = now_millis() as u64;
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:012x}{:012x}", timestamp & 0xffff_ffff_ffff, counter & 0xffff_ffff_ffff)
}

/// A colored label attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Label {
    pub text: String,
    #[serde(default)]
    pub color: String,
}

impl Label {
    #[must_use]
    pub fn new(text: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            color: color.into(),
        }
    }
}

/// Author of a message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Author {
    pub username: String,
    #[serde(default)]
    pub fullname: String,
}

/// A message, possibly carrying its materialized replies.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "_id")]
    pub id: MessageId,
    pub text: String,
    /// Topic paths this message belongs to.
    pub topics: Vec<String>,
    /// Immediate parent, empty for a root message.
    #[serde(rename = "inReplyOfID", skip_serializing_if = "String::is_empty")]
    pub in_reply_of_id: MessageId,
    /// Root of the thread, empty for a root message.
    #[serde(rename = "inReplyOfIDRoot", skip_serializing_if = "String::is_empty")]
    pub in_reply_of_id_root: MessageId,
    pub nb_replies: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub author: Author,
    /// Creation time in milliseconds since the Unix epoch.
    pub date_creation: i64,
    /// Last update time in milliseconds since the Unix epoch.
    pub date_update: i64,
    /// Materialized replies. Only populated by thread views.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub replies: Vec<Message>,
}

impl Message {
    /// Create a root message on a topic.
    #[must_use]
    pub fn new(id: impl Into<MessageId>, topic: impl Into<String>, text: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            text: text.into(),
            topics: vec![topic.into()],
            date_creation: now,
            date_update: now,
            ..Self::default()
        }
    }

    /// Turn this message into a reply to `parent`.
    ///
    /// The root is inherited from the parent, or is the parent itself when
    /// the parent is a root.
    #[must_use]
    pub fn in_reply_to(mut self, parent: &Message) -> Self {
        self.in_reply_of_id = parent.id.clone();
        self.in_reply_of_id_root = if parent.is_root() {
            parent.id.clone()
        } else {
            parent.in_reply_of_id_root.clone()
        };
        self
    }

    /// Set the author.
    #[must_use]
    pub fn with_author(mut self, username: impl Into<String>, fullname: impl Into<String>) -> Self {
        self.author = Author {
            username: username.into(),
            fullname: fullname.into(),
        };
        self
    }

    /// Set the creation and update timestamps.
    #[must_use]
    pub fn created_at(mut self, millis: i64) -> Self {
        self.date_creation = millis;
        self.date_update = millis;
        self
    }

    /// Add a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Add a label.
    #[must_use]
    pub fn with_label(mut self, text: impl Into<String>, color: impl Into<String>) -> Self {
        self.labels.push(Label::new(text, color));
        self
    }

    /// Whether this message starts a thread.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.in_reply_of_id.is_empty() && self.in_reply_of_id_root.is_empty()
    }

    /// ID of the thread root, which is the message itself for a root.
    #[must_use]
    pub fn root_id(&self) -> &str {
        if self.in_reply_of_id_root.is_empty() {
            &self.id
        } else {
            &self.in_reply_of_id_root
        }
    }

    #[must_use]
    pub fn has_label(&self, text: &str) -> bool {
        self.labels.iter().any(|l| l.text == text)
    }

    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Whether the message is posted on `topic`.
    #[must_use]
    pub fn is_on_topic(&self, topic: &str) -> bool {
        self.topics.iter().any(|t| t == topic)
    }
}
