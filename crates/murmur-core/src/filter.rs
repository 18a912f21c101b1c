//! Explicit message filters.
//!
//! A [`MessageFilter`] is a conjunction of [`Criterion`]s. Repositories may
//! translate it to their own query language; [`MessageFilter::matches`] is
//! the reference semantics and is what the in-memory store uses.

use murmur_protocol::{Message, MessageId};

/// One filtering dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Criterion {
    /// Message ID is one of these.
    Ids(Vec<MessageId>),
    /// Message ID, parent ID or root ID is one of these.
    Thread(Vec<MessageId>),
    /// Message is posted on this topic.
    Topic(String),
    /// Text contains this substring.
    Text(String),
    /// Message carries this label.
    Label(String),
    /// Message does not carry this label.
    NotLabel(String),
    /// Message carries this tag.
    Tag(String),
    /// Message does not carry this tag.
    NotTag(String),
    /// Created at or after this instant (ms).
    CreatedAfter(i64),
    /// Created at or before this instant (ms).
    CreatedBefore(i64),
}

impl Criterion {
    /// Whether `message` satisfies this criterion.
    #[must_use]
    pub fn matches(&self, message: &Message) -> bool {
        match self {
            Criterion::Ids(ids) => ids.iter().any(|id| *id == message.id),
            Criterion::Thread(ids) => ids.iter().any(|id| {
                *id == message.id
                    || *id == message.in_reply_of_id
                    || *id == message.in_reply_of_id_root
            }),
            Criterion::Topic(topic) => message.is_on_topic(topic),
            Criterion::Text(text) => message.text.contains(text.as_str()),
            Criterion::Label(label) => message.has_label(label),
            Criterion::NotLabel(label) => !message.has_label(label),
            Criterion::Tag(tag) => message.has_tag(tag),
            Criterion::NotTag(tag) => !message.has_tag(tag),
            Criterion::CreatedAfter(at) => message.date_creation >= *at,
            Criterion::CreatedBefore(at) => message.date_creation <= *at,
        }
    }

    /// Whether this criterion only excludes messages.
    #[must_use]
    pub fn is_exclusion(&self) -> bool {
        matches!(self, Criterion::NotLabel(_) | Criterion::NotTag(_))
    }
}

/// A conjunction of criteria with an optional result limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    pub criteria: Vec<Criterion>,
    pub limit: Option<usize>,
}

impl MessageFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages of the threads rooted at or passing through `ids`.
    #[must_use]
    pub fn thread<I: IntoIterator<Item = MessageId>>(ids: I) -> Self {
        Self::new().and(Criterion::Thread(ids.into_iter().collect()))
    }

    /// Add a criterion.
    #[must_use]
    pub fn and(mut self, criterion: Criterion) -> Self {
        self.criteria.push(criterion);
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// A filter keeping only the exclusion predicates of this one.
    #[must_use]
    pub fn exclusions(&self) -> Self {
        Self {
            criteria: self
                .criteria
                .iter()
                .filter(|c| c.is_exclusion())
                .cloned()
                .collect(),
            limit: None,
        }
    }

    /// Whether `message` satisfies every criterion.
    #[must_use]
    pub fn matches(&self, message: &Message) -> bool {
        self.criteria.iter().all(|c| c.matches(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_matches_self_parent_and_root() {
        let root = Message::new("r", "/Proj/chat", "root");
        let child = Message::new("c", "/Proj/chat", "child").in_reply_to(&root);
        let grandchild = Message::new("g", "/Proj/chat", "deep").in_reply_to(&child);
        let other = Message::new("o", "/Proj/chat", "other");

        let filter = MessageFilter::thread(["r".to_string()]);
        assert!(filter.matches(&root));
        assert!(filter.matches(&child));
        assert!(filter.matches(&grandchild));
        assert!(!filter.matches(&other));

        let by_parent = MessageFilter::thread(["c".to_string()]);
        assert!(by_parent.matches(&grandchild));
        assert!(!by_parent.matches(&root));
    }

    #[test]
    fn test_exclusions() {
        let filter = MessageFilter::new()
            .and(Criterion::Topic("/Proj/chat".into()))
            .and(Criterion::NotLabel("spam".into()))
            .and(Criterion::NotTag("hidden".into()))
            .with_limit(10);

        let exclusions = filter.exclusions();
        assert_eq!(exclusions.criteria.len(), 2);
        assert!(exclusions.limit.is_none());

        let spam = Message::new("s", "/Other", "buy").with_label("spam", "#f00");
        assert!(!exclusions.matches(&spam));
        assert!(exclusions.matches(&Message::new("ok", "/Other", "fine")));
    }

    #[test]
    fn test_date_range() {
        let msg = Message::new("m", "/Proj/chat", "t").created_at(1_000);
        assert!(MessageFilter::new()
            .and(Criterion::CreatedAfter(500))
            .and(Criterion::CreatedBefore(1_000))
            .matches(&msg));
        assert!(!MessageFilter::new().and(Criterion::CreatedAfter(1_001)).matches(&msg));
    }
}
