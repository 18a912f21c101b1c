//! Topic access control.
//!
//! A user's access to a topic is the highest of:
//!
//! - **Admin**: platform admin, listed in the topic's admin users or groups,
//!   or owner of the private namespace the topic lives in.
//! - **Write**: listed in the read-write users or groups.
//! - **Read**: listed in the read-only users or groups, or the topic is
//!   publicly readable.
//!
//! Group memberships are fetched from the [`UserDirectory`] for every
//! decision that needs them and never cached here.

use std::sync::Arc;
use tracing::trace;

use crate::directory::{StoreError, UserDirectory};
use crate::topic::Topic;
use crate::user::User;

/// Access a user has on a topic, ordered from none to admin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AccessLevel {
    None,
    Read,
    Write,
    Admin,
}

impl AccessLevel {
    #[must_use]
    pub fn can_read(self) -> bool {
        self >= AccessLevel::Read
    }

    #[must_use]
    pub fn can_write(self) -> bool {
        self >= AccessLevel::Write
    }

    #[must_use]
    pub fn is_admin(self) -> bool {
        self == AccessLevel::Admin
    }
}

fn contains(list: &[String], name: &str) -> bool {
    list.iter().any(|entry| entry == name)
}

fn intersects(list: &[String], groups: &[String]) -> bool {
    groups.iter().any(|g| contains(list, g))
}

/// Access granted without looking at groups.
fn direct_level(topic: &Topic, user: &User) -> AccessLevel {
    if user.is_admin || contains(&topic.admin_users, &user.username) || topic.is_private_to(&user.username) {
        AccessLevel::Admin
    } else if contains(&topic.rw_users, &user.username) {
        AccessLevel::Write
    } else if contains(&topic.ro_users, &user.username) || topic.is_public_ro {
        AccessLevel::Read
    } else {
        AccessLevel::None
    }
}

/// Access granted through group memberships alone.
fn group_level(topic: &Topic, groups: &[String]) -> AccessLevel {
    if intersects(&topic.admin_groups, groups) {
        AccessLevel::Admin
    } else if intersects(&topic.rw_groups, groups) {
        AccessLevel::Write
    } else if intersects(&topic.ro_groups, groups) {
        AccessLevel::Read
    } else {
        AccessLevel::None
    }
}

/// Evaluate the access `user`, member of `groups`, has on `topic`.
#[must_use]
pub fn evaluate(topic: &Topic, user: &User, groups: &[String]) -> AccessLevel {
    direct_level(topic, user).max(group_level(topic, groups))
}

/// Resolves access decisions, fetching group memberships on demand.
#[derive(Clone)]
pub struct AccessResolver {
    users: Arc<dyn UserDirectory>,
}

impl AccessResolver {
    #[must_use]
    pub fn new(users: Arc<dyn UserDirectory>) -> Self {
        Self { users }
    }

    /// Full access level of `user` on `topic`.
    ///
    /// # Errors
    ///
    /// Returns an error if group memberships cannot be fetched.
    pub async fn level(&self, topic: &Topic, user: &User) -> Result<AccessLevel, StoreError> {
        let direct = direct_level(topic, user);
        if direct == AccessLevel::Admin {
            return Ok(direct);
        }
        let groups = self.users.groups_of(&user.username).await?;
        let level = direct.max(group_level(topic, &groups));
        trace!(topic = %topic.path, user = %user.username, ?level, "Resolved access");
        Ok(level)
    }

    /// Whether `user` may read `topic`.
    ///
    /// # Errors
    ///
    /// Returns an error if group memberships cannot be fetched.
    pub async fn can_read(&self, topic: &Topic, user: &User) -> Result<bool, StoreError> {
        self.at_least(topic, user, AccessLevel::Read).await
    }

    /// Whether `user` may write to `topic`.
    ///
    /// # Errors
    ///
    /// Returns an error if group memberships cannot be fetched.
    pub async fn can_write(&self, topic: &Topic, user: &User) -> Result<bool, StoreError> {
        self.at_least(topic, user, AccessLevel::Write).await
    }

    /// Whether `user` administers `topic`.
    ///
    /// # Errors
    ///
    /// Returns an error if group memberships cannot be fetched.
    pub async fn is_admin(&self, topic: &Topic, user: &User) -> Result<bool, StoreError> {
        self.at_least(topic, user, AccessLevel::Admin).await
    }

    async fn at_least(&self, topic: &Topic, user: &User, wanted: AccessLevel) -> Result<bool, StoreError> {
        if direct_level(topic, user) >= wanted {
            return Ok(true);
        }
        let groups = self.users.groups_of(&user.username).await?;
        Ok(group_level(topic, &groups) >= wanted)
    }
}
