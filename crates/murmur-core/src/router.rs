//! Subscription routing.
//!
//! Three topic-keyed tables record which connections want which events:
//! message events, new-message counts and presences. A fourth, flat set
//! holds the admin connections that follow user lifecycle events.
//!
//! Every subscribe is checked against the topic's ACL. Tables never hold a
//! guard across an await point.

use dashmap::{DashMap, DashSet};
use murmur_protocol::TreeView;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

use crate::acl::AccessResolver;
use crate::directory::{StoreError, TopicDirectory};
use crate::registry::Instance;
use crate::topic::normalize_topic_path;
use crate::user::User;

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The user cannot read the topic.
    #[error("No read access to topic {0}")]
    Unauthorized(String),

    /// Topic does not exist.
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    /// Invalid topic path.
    #[error("Invalid topic: {0}")]
    InvalidTopic(&'static str),

    /// Already subscribed to the topic in this table.
    #[error("Already subscribed to {0}")]
    AlreadySubscribed(String),

    /// Only admin connections may follow user events.
    #[error("Admin only")]
    AdminOnly,

    /// Topic or group lookup failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RouterError {
    /// HTTP-style status for acknowledgements.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            RouterError::Unauthorized(_) | RouterError::AdminOnly => 403,
            RouterError::TopicNotFound(_) => 404,
            RouterError::InvalidTopic(_) => 400,
            RouterError::AlreadySubscribed(_) => 409,
            RouterError::Store(_) => 500,
        }
    }
}

/// The topic-keyed subscription tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Messages,
    MessagesNew,
    Presences,
}

impl Table {
    pub const ALL: [Table; 3] = [Table::Messages, Table::MessagesNew, Table::Presences];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Messages => "messages",
            Table::MessagesNew => "messagesNew",
            Table::Presences => "presences",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One connection subscribed to one topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionEntry {
    pub instance: Instance,
    #[serde(rename = "treeView")]
    pub tree_view: TreeView,
}

type TopicTable = DashMap<String, Vec<SubscriptionEntry>>;

/// Snapshot of every table.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterSnapshot {
    pub messages: BTreeMap<String, Vec<SubscriptionEntry>>,
    pub messages_new: BTreeMap<String, Vec<SubscriptionEntry>>,
    pub presences: BTreeMap<String, Vec<SubscriptionEntry>>,
    pub users: Vec<Instance>,
}

/// Router statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouterStats {
    /// Topics with at least one subscriber, across tables.
    pub topic_count: usize,
    /// Topic subscriptions, across tables.
    pub total_subscriptions: usize,
    /// Connections following user events.
    pub user_subscribers: usize,
}

/// Routes subscriptions, checking access on every subscribe.
pub struct SubscriptionRouter {
    messages: TopicTable,
    messages_new: TopicTable,
    presences: TopicTable,
    users: DashSet<Instance>,
    topics: Arc<dyn TopicDirectory>,
    access: AccessResolver,
}

impl SubscriptionRouter {
    #[must_use]
    pub fn new(topics: Arc<dyn TopicDirectory>, access: AccessResolver) -> Self {
        Self {
            messages: DashMap::new(),
            messages_new: DashMap::new(),
            presences: DashMap::new(),
            users: DashSet::new(),
            topics,
            access,
        }
    }

    fn table(&self, table: Table) -> &TopicTable {
        match table {
            Table::Messages => &self.messages,
            Table::MessagesNew => &self.messages_new,
            Table::Presences => &self.presences,
        }
    }

    /// Subscribe a connection to a topic.
    ///
    /// Returns the normalized topic path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is invalid, the topic does not exist,
    /// `user` cannot read it, or the connection is already subscribed.
    pub async fn subscribe(
        &self,
        table: Table,
        path: &str,
        user: &User,
        instance: &Instance,
        tree_view: TreeView,
    ) -> Result<String, RouterError> {
        let path = normalize_topic_path(path).map_err(RouterError::InvalidTopic)?;
        let topic = self
            .topics
            .find_by_path(&path)
            .await?
            .ok_or_else(|| RouterError::TopicNotFound(path.clone()))?;

        if !self.access.can_read(&topic, user).await? {
            return Err(RouterError::Unauthorized(path));
        }

        self.insert(table, &path, instance, tree_view)?;
        Ok(path)
    }

    /// Subscribe a connection to every topic `user` can read right now.
    ///
    /// Topics created later are not included. Returns the outcome per topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the readable topics cannot be listed.
    pub async fn subscribe_readable(
        &self,
        table: Table,
        user: &User,
        instance: &Instance,
        tree_view: TreeView,
    ) -> Result<Vec<(String, Result<(), RouterError>)>, RouterError> {
        let topics = self.topics.list_readable_by(user).await?;
        debug!(table = %table, connection = %instance, topics = topics.len(), "Subscribing to all readable topics");
        Ok(topics
            .into_iter()
            .map(|topic| {
                let result = self.insert(table, &topic.path, instance, tree_view);
                (topic.path, result)
            })
            .collect())
    }

    fn insert(
        &self,
        table: Table,
        path: &str,
        instance: &Instance,
        tree_view: TreeView,
    ) -> Result<(), RouterError> {
        let mut entries = self.table(table).entry(path.to_string()).or_default();
        if entries.iter().any(|e| e.instance == *instance) {
            return Err(RouterError::AlreadySubscribed(path.to_string()));
        }
        entries.push(SubscriptionEntry {
            instance: instance.clone(),
            tree_view,
        });
        debug!(
            table = %table,
            topic = %path,
            connection = %instance,
            tree_view = %tree_view,
            subscribers = entries.len(),
            "Subscribed"
        );
        Ok(())
    }

    /// Remove a connection's subscription to a topic.
    ///
    /// Returns whether an entry was removed; removing nothing is not an error.
    pub fn unsubscribe(&self, table: Table, path: &str, instance: &Instance) -> bool {
        let path = normalize_topic_path(path).unwrap_or_else(|_| path.to_string());
        let tbl = self.table(table);

        let removed = tbl.get_mut(&path).map_or(false, |mut entries| {
            let before = entries.len();
            entries.retain(|e| e.instance != *instance);
            before != entries.len()
        });
        tbl.remove_if(&path, |_, entries| entries.is_empty());

        if removed {
            debug!(table = %table, topic = %path, connection = %instance, "Unsubscribed");
        }
        removed
    }

    /// Remove a connection from every topic of a table.
    ///
    /// Returns the number of entries removed.
    pub fn unsubscribe_all(&self, table: Table, instance: &Instance) -> usize {
        let tbl = self.table(table);
        let mut removed = 0;
        for mut entries in tbl.iter_mut() {
            let before = entries.len();
            entries.retain(|e| e.instance != *instance);
            removed += before - entries.len();
        }
        tbl.retain(|_, entries| !entries.is_empty());
        trace!(table = %table, connection = %instance, removed, "Unsubscribed from all topics");
        removed
    }

    /// Follow user lifecycle events.
    ///
    /// # Errors
    ///
    /// Returns an error for non-admin users or duplicate subscriptions.
    pub fn subscribe_users(&self, user: &User, instance: &Instance) -> Result<(), RouterError> {
        if !user.is_admin {
            return Err(RouterError::AdminOnly);
        }
        if !self.users.insert(instance.clone()) {
            return Err(RouterError::AlreadySubscribed("users".to_string()));
        }
        debug!(connection = %instance, "Subscribed to user events");
        Ok(())
    }

    /// Stop following user lifecycle events.
    pub fn unsubscribe_users(&self, instance: &Instance) -> bool {
        self.users.remove(instance).is_some()
    }

    /// Remove a connection from every table and the users set.
    pub fn remove_connection(&self, instance: &Instance) {
        let removed: usize = Table::ALL
            .iter()
            .map(|table| self.unsubscribe_all(*table, instance))
            .sum();
        let users = self.unsubscribe_users(instance);
        debug!(connection = %instance, removed, users, "Removed connection from router");
    }

    /// Current subscribers of a topic.
    #[must_use]
    pub fn entries(&self, table: Table, path: &str) -> Vec<SubscriptionEntry> {
        self.table(table)
            .get(path)
            .map(|entries| entries.value().clone())
            .unwrap_or_default()
    }

    /// Current followers of user events.
    #[must_use]
    pub fn user_subscribers(&self) -> Vec<Instance> {
        self.users.iter().map(|i| i.key().clone()).collect()
    }

    /// Whether a connection appears anywhere in the router.
    #[must_use]
    pub fn is_subscribed_anywhere(&self, instance: &Instance) -> bool {
        self.users.contains(instance)
            || Table::ALL.iter().any(|table| {
                self.table(*table)
                    .iter()
                    .any(|entries| entries.iter().any(|e| e.instance == *instance))
            })
    }

    #[must_use]
    pub fn stats(&self) -> RouterStats {
        let tables = Table::ALL.iter().map(|t| self.table(*t));
        let mut stats = RouterStats {
            user_subscribers: self.users.len(),
            ..RouterStats::default()
        };
        for table in tables {
            stats.topic_count += table.len();
            stats.total_subscriptions += table.iter().map(|e| e.len()).sum::<usize>();
        }
        stats
    }

    /// Copy of every table, ordered by topic.
    #[must_use]
    pub fn snapshot(&self) -> RouterSnapshot {
        let copy = |table: &TopicTable| {
            table
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect::<BTreeMap<_, _>>()
        };
        let mut users = self.user_subscribers();
        users.sort();
        RouterSnapshot {
            messages: copy(&self.messages),
            messages_new: copy(&self.messages_new),
            presences: copy(&self.presences),
            users,
        }
    }
}
