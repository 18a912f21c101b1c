//! Users and groups, as far as access control needs them.

use serde::{Deserialize, Serialize};

/// A user identity.
///
/// Group memberships are not carried here: they are looked up through
/// [`crate::directory::UserDirectory::groups_of`] on each decision.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct User {
    pub username: String,
    pub fullname: String,
    pub is_admin: bool,
    pub is_system: bool,
}

impl User {
    #[must_use]
    pub fn new(username: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            fullname: username.clone(),
            username,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_fullname(mut self, fullname: impl Into<String>) -> Self {
        self.fullname = fullname.into();
        self
    }

    #[must_use]
    pub fn admin(mut self) -> Self {
        self.is_admin = true;
        self
    }

    #[must_use]
    pub fn system(mut self) -> Self {
        self.is_system = true;
        self
    }
}

/// A named set of users.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Group {
    pub name: String,
    pub users: Vec<String>,
    pub admin_users: Vec<String>,
}

impl Group {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_users<I: IntoIterator<Item = S>, S: Into<String>>(mut self, users: I) -> Self {
        self.users.extend(users.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_admins<I: IntoIterator<Item = S>, S: Into<String>>(mut self, admins: I) -> Self {
        self.admin_users.extend(admins.into_iter().map(Into::into));
        self
    }

    /// Whether `username` is a member, group admins included.
    #[must_use]
    pub fn has_member(&self, username: &str) -> bool {
        self.users.iter().chain(&self.admin_users).any(|u| u == username)
    }
}
