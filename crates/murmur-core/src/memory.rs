//! In-memory implementation of every collaborator.
//!
//! Used by the server binary when it runs without an external store, and
//! by tests.

use async_trait::async_trait;
use murmur_protocol::{generate_message_id, Message, Presence, PresenceStatus};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use tracing::debug;

use crate::acl;
use crate::directory::{MessageRepository, PresenceRepository, StoreError, TopicDirectory, UserDirectory};
use crate::filter::MessageFilter;
use crate::locks;
use crate::topic::{is_within, normalize_topic_path, parent_path, Topic};
use crate::user::{Group, User};

/// An entry to add to a topic ACL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grant {
    ReadUser(String),
    WriteUser(String),
    AdminUser(String),
    ReadGroup(String),
    WriteGroup(String),
    AdminGroup(String),
    /// Anyone may read.
    PublicRead,
}

impl Grant {
    fn apply(&self, topic: &mut Topic) {
        let (list, name) = match self {
            Grant::PublicRead => {
                topic.is_public_ro = true;
                return;
            }
            Grant::ReadUser(n) => (&mut topic.ro_users, n),
            Grant::WriteUser(n) => (&mut topic.rw_users, n),
            Grant::AdminUser(n) => (&mut topic.admin_users, n),
            Grant::ReadGroup(n) => (&mut topic.ro_groups, n),
            Grant::WriteGroup(n) => (&mut topic.rw_groups, n),
            Grant::AdminGroup(n) => (&mut topic.admin_groups, n),
        };
        if !list.contains(name) {
            list.push(name.clone());
        }
    }
}

struct Account {
    user: User,
    password: String,
}

/// Users, groups, topics, messages and presences held in process memory.
#[derive(Default)]
pub struct MemoryStore {
    accounts: RwLock<HashMap<String, Account>>,
    groups: RwLock<HashMap<String, Group>>,
    topics: RwLock<BTreeMap<String, Topic>>,
    messages: RwLock<Vec<Message>>,
    presences: RwLock<HashMap<(String, String), Presence>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a user account.
    pub fn add_user(&self, user: User, password: impl Into<String>) {
        debug!(user = %user.username, "Adding user");
        locks::write(&self.accounts).insert(
            user.username.clone(),
            Account {
                user,
                password: password.into(),
            },
        );
    }

    /// Look up a user.
    #[must_use]
    pub fn user(&self, username: &str) -> Option<User> {
        locks::read(&self.accounts).get(username).map(|a| a.user.clone())
    }

    /// Add or replace a group.
    pub fn add_group(&self, group: Group) {
        locks::write(&self.groups).insert(group.name.clone(), group);
    }

    /// Insert a fully built topic, replacing any topic at the same path.
    pub fn put_topic(&self, topic: Topic) {
        locks::write(&self.topics).insert(topic.path.clone(), topic);
    }

    /// Create a topic.
    ///
    /// A sub-topic starts with a copy of its parent's ACL and parameters.
    /// A top-level topic starts empty, with `creator` as its admin.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is invalid or already taken.
    pub fn create_topic(&self, path: &str, creator: Option<&User>) -> Result<Topic, StoreError> {
        let path = normalize_topic_path(path).map_err(|e| StoreError::Invalid(e.to_string()))?;
        let mut topics = locks::write(&self.topics);
        if topics.contains_key(&path) {
            return Err(StoreError::Invalid(format!("Topic already exists: {path}")));
        }

        let parent = parent_path(&path).and_then(|p| topics.get(p));
        let mut topic = match parent {
            Some(parent) => Topic::child_of(parent, &path),
            None => Topic::new(&path),
        }
        .map_err(|e| StoreError::Invalid(e.to_string()))?;

        if parent.is_none() {
            if let Some(creator) = creator {
                Grant::AdminUser(creator.username.clone()).apply(&mut topic);
            }
        }

        debug!(topic = %path, "Created topic");
        topics.insert(path, topic.clone());
        Ok(topic)
    }

    /// Add an ACL entry to a topic, and to all its sub-topics when `recursive`.
    ///
    /// Returns the number of topics updated.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic does not exist.
    pub fn grant(&self, path: &str, grant: Grant, recursive: bool) -> Result<usize, StoreError> {
        let mut topics = locks::write(&self.topics);
        if !topics.contains_key(path) {
            return Err(StoreError::NotFound(path.to_string()));
        }

        let mut updated = 0;
        for (topic_path, topic) in topics.iter_mut() {
            let target = topic_path == path || (recursive && is_within(topic_path, path));
            if target {
                grant.apply(topic);
                updated += 1;
            }
        }
        debug!(topic = %path, ?grant, recursive, updated, "Granted access");
        Ok(updated)
    }

    /// Store a message, assigning an ID if it has none.
    ///
    /// The parent's reply count is incremented for replies.
    pub fn insert_message(&self, mut message: Message) -> Message {
        if message.id.is_empty() {
            message.id = generate_message_id();
        }
        let mut messages = locks::write(&self.messages);
        if !message.in_reply_of_id.is_empty() {
            if let Some(parent) = messages.iter_mut().find(|m| m.id == message.in_reply_of_id) {
                parent.nb_replies += 1;
            }
        }
        messages.retain(|m| m.id != message.id);
        messages.push(message.clone());
        message
    }

    /// Current presences on a topic.
    #[must_use]
    pub fn presences_on(&self, topic: &str) -> Vec<Presence> {
        locks::read(&self.presences)
            .values()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn authenticate(&self, username: &str, password: &str) -> Result<Option<User>, StoreError> {
        Ok(locks::read(&self.accounts)
            .get(username)
            .filter(|a| a.password == password)
            .map(|a| a.user.clone()))
    }

    async fn groups_of(&self, username: &str) -> Result<Vec<String>, StoreError> {
        Ok(locks::read(&self.groups)
            .values()
            .filter(|g| g.has_member(username))
            .map(|g| g.name.clone())
            .collect())
    }
}

#[async_trait]
impl TopicDirectory for MemoryStore {
    async fn find_by_path(&self, path: &str) -> Result<Option<Topic>, StoreError> {
        Ok(locks::read(&self.topics).get(path).cloned())
    }

    async fn list_readable_by(&self, user: &User) -> Result<Vec<Topic>, StoreError> {
        let groups = self.groups_of(&user.username).await?;
        Ok(locks::read(&self.topics)
            .values()
            .filter(|t| acl::evaluate(t, user, &groups).can_read())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn find(&self, filter: &MessageFilter) -> Result<Vec<Message>, StoreError> {
        let mut found: Vec<Message> = locks::read(&self.messages)
            .iter()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.date_creation.cmp(&a.date_creation));
        if let Some(limit) = filter.limit {
            found.truncate(limit);
        }
        Ok(found)
    }
}

#[async_trait]
impl PresenceRepository for MemoryStore {
    async fn upsert(
        &self,
        user: &User,
        topic: &Topic,
        status: PresenceStatus,
    ) -> Result<Presence, StoreError> {
        let presence = Presence::new(&topic.path, &user.username, &user.fullname, status);
        locks::write(&self.presences).insert(
            (topic.path.clone(), user.username.clone()),
            presence.clone(),
        );
        Ok(presence)
    }
}
