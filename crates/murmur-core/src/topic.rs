//! Topics and their access lists.
//!
//! Topics are hierarchical, `/`-separated channels. Each topic carries its
//! own ACL and a set of parameters that sub-topics inherit when they are
//! created.

use serde::{Deserialize, Serialize};

/// Minimum topic path length, leading slash included.
pub const MIN_TOPIC_PATH_LENGTH: usize = 4;

/// Maximum topic path length.
pub const MAX_TOPIC_PATH_LENGTH: usize = 100;

/// Root of the per-user private namespace.
pub const PRIVATE_ROOT: &str = "/Private";

/// Default maximum message length for new topics.
pub const DEFAULT_MAX_LENGTH: usize = 140;

/// Normalize a topic path.
///
/// Surrounding whitespace is trimmed, duplicate slashes are collapsed, a
/// leading slash is added and a trailing slash removed.
///
/// # Errors
///
/// Returns an error message if the normalized path is too short, too long
/// or contains control characters.
pub fn normalize_topic_path(raw: &str) -> Result<String, &'static str> {
    let segments: Vec<&str> = raw.trim().split('/').filter(|s| !s.is_empty()).collect();
    let path = format!("/{}", segments.join("/"));

    if path.len() < MIN_TOPIC_PATH_LENGTH {
        return Err("Topic path too short");
    }
    if path.len() > MAX_TOPIC_PATH_LENGTH {
        return Err("Topic path too long");
    }
    if path.chars().any(char::is_control) {
        return Err("Topic path contains invalid characters");
    }
    Ok(path)
}

/// Whether `path` is `ancestor` itself or lies below it.
#[must_use]
pub fn is_within(path: &str, ancestor: &str) -> bool {
    match path.strip_prefix(ancestor) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Path of the parent topic, `None` for a top-level topic.
#[must_use]
pub fn parent_path(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}

/// Private namespace owned by `username`.
#[must_use]
pub fn private_path(username: &str) -> String {
    format!("{PRIVATE_ROOT}/{username}")
}

/// Parameters inherited by sub-topics at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicParameters {
    pub max_length: usize,
    pub can_force_date: bool,
    pub can_update_msg: bool,
    pub can_delete_msg: bool,
    pub can_update_all_msg: bool,
    pub can_delete_all_msg: bool,
    pub admin_can_update_all_msg: bool,
    pub admin_can_delete_all_msg: bool,
}

impl Default for TopicParameters {
    fn default() -> Self {
        Self {
            max_length: DEFAULT_MAX_LENGTH,
            can_force_date: false,
            can_update_msg: false,
            can_delete_msg: false,
            can_update_all_msg: false,
            can_delete_all_msg: false,
            admin_can_update_all_msg: false,
            admin_can_delete_all_msg: false,
        }
    }
}

/// A topic with its complete ACL record.
///
/// Access decisions must always be made against this full record, never
/// against a projection of it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Topic {
    #[serde(rename = "topic")]
    pub path: String,
    pub description: String,
    pub ro_users: Vec<String>,
    pub rw_users: Vec<String>,
    pub admin_users: Vec<String>,
    pub ro_groups: Vec<String>,
    pub rw_groups: Vec<String>,
    pub admin_groups: Vec<String>,
    #[serde(rename = "isROPublic")]
    pub is_public_ro: bool,
    pub parameters: TopicParameters,
}

impl Topic {
    /// Create a topic with an empty ACL.
    ///
    /// # Errors
    ///
    /// Returns an error message if the path is invalid.
    pub fn new(path: &str) -> Result<Self, &'static str> {
        Ok(Self {
            path: normalize_topic_path(path)?,
            ..Self::default()
        })
    }

    /// Create a sub-topic of `parent`.
    ///
    /// ACL lists and parameters are copied from the parent as they are now.
    /// Later changes to the parent are not reflected in the child.
    ///
    /// # Errors
    ///
    /// Returns an error message if the path is invalid.
    pub fn child_of(parent: &Topic, path: &str) -> Result<Self, &'static str> {
        Ok(Self {
            path: normalize_topic_path(path)?,
            description: String::new(),
            ro_users: parent.ro_users.clone(),
            rw_users: parent.rw_users.clone(),
            admin_users: parent.admin_users.clone(),
            ro_groups: parent.ro_groups.clone(),
            rw_groups: parent.rw_groups.clone(),
            admin_groups: parent.admin_groups.clone(),
            is_public_ro: parent.is_public_ro,
            parameters: parent.parameters.clone(),
        })
    }

    #[must_use]
    pub fn with_ro_users<I: IntoIterator<Item = S>, S: Into<String>>(mut self, users: I) -> Self {
        self.ro_users.extend(users.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_rw_users<I: IntoIterator<Item = S>, S: Into<String>>(mut self, users: I) -> Self {
        self.rw_users.extend(users.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_admin_users<I: IntoIterator<Item = S>, S: Into<String>>(mut self, users: I) -> Self {
        self.admin_users.extend(users.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_ro_groups<I: IntoIterator<Item = S>, S: Into<String>>(mut self, groups: I) -> Self {
        self.ro_groups.extend(groups.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_rw_groups<I: IntoIterator<Item = S>, S: Into<String>>(mut self, groups: I) -> Self {
        self.rw_groups.extend(groups.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_admin_groups<I: IntoIterator<Item = S>, S: Into<String>>(mut self, groups: I) -> Self {
        self.admin_groups.extend(groups.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn public_ro(mut self) -> Self {
        self.is_public_ro = true;
        self
    }

    /// Whether this topic lies in `username`'s private namespace.
    #[must_use]
    pub fn is_private_to(&self, username: &str) -> bool {
        !username.is_empty() && is_within(&self.path, &private_path(username))
    }
}
