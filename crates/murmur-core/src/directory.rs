//! Collaborator interfaces.
//!
//! The engine never talks to a database directly. Identities, topics,
//! messages and presences are reached through these traits, which the
//! persistence layer implements. [`crate::memory::MemoryStore`] is an
//! in-process implementation of all of them.

use async_trait::async_trait;
use murmur_protocol::{Message, Presence, PresenceStatus};
use std::sync::Arc;
use thiserror::Error;

use crate::filter::MessageFilter;
use crate::topic::Topic;
use crate::user::User;

/// Collaborator errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store failed.
    #[error("Store error: {0}")]
    Backend(String),

    /// A referenced record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request was rejected by the store.
    #[error("Invalid request: {0}")]
    Invalid(String),
}

/// User identities and group memberships.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Check credentials, returning the user when they are valid.
    async fn authenticate(&self, username: &str, password: &str) -> Result<Option<User>, StoreError>;

    /// Names of the groups `username` belongs to.
    async fn groups_of(&self, username: &str) -> Result<Vec<String>, StoreError>;
}

/// Topic lookup.
#[async_trait]
pub trait TopicDirectory: Send + Sync {
    /// Find a topic with its full ACL record.
    async fn find_by_path(&self, path: &str) -> Result<Option<Topic>, StoreError>;

    /// Every topic `user` can read.
    async fn list_readable_by(&self, user: &User) -> Result<Vec<Topic>, StoreError>;
}

/// Message lookup.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn find(&self, filter: &MessageFilter) -> Result<Vec<Message>, StoreError>;
}

/// Presence storage.
#[async_trait]
pub trait PresenceRepository: Send + Sync {
    /// Insert or update the presence of `user` on `topic`.
    async fn upsert(
        &self,
        user: &User,
        topic: &Topic,
        status: PresenceStatus,
    ) -> Result<Presence, StoreError>;
}

/// The set of collaborators the engine is wired to.
#[derive(Clone)]
pub struct Directories {
    pub users: Arc<dyn UserDirectory>,
    pub topics: Arc<dyn TopicDirectory>,
    pub messages: Arc<dyn MessageRepository>,
    pub presences: Arc<dyn PresenceRepository>,
}

impl Directories {
    /// Use one store for every collaborator.
    #[must_use]
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: UserDirectory + TopicDirectory + MessageRepository + PresenceRepository + 'static,
    {
        Self {
            users: store.clone(),
            topics: store.clone(),
            messages: store.clone(),
            presences: store,
        }
    }
}
