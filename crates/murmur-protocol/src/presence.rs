//! Presence of a user on a topic.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::message::now_millis;

/// Presence status a user can announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
    Busy,
}

impl PresenceStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Offline => "offline",
            PresenceStatus::Busy => "busy",
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PresenceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(PresenceStatus::Online),
            "offline" => Ok(PresenceStatus::Offline),
            "busy" => Ok(PresenceStatus::Busy),
            other => Err(format!("Invalid presence status: {other}")),
        }
    }
}

/// The user a presence belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserPresence {
    pub username: String,
    #[serde(default)]
    pub fullname: String,
}

/// Presence of one user on one topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub status: PresenceStatus,
    pub topic: String,
    /// Milliseconds since the Unix epoch.
    pub date_presence: i64,
    pub user_presence: UserPresence,
}

impl Presence {
    /// Create a presence stamped with the current time.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        username: impl Into<String>,
        fullname: impl Into<String>,
        status: PresenceStatus,
    ) -> Self {
        Self {
            status,
            topic: topic.into(),
            date_presence: now_millis(),
            user_presence: UserPresence {
                username: username.into(),
                fullname: fullname.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse() {
        assert_eq!("busy".parse::<PresenceStatus>(), Ok(PresenceStatus::Busy));
        assert!("away".parse::<PresenceStatus>().is_err());
        assert_eq!(PresenceStatus::Online.to_string(), "online");
    }

    #[test]
    fn test_presence_json() {
        let presence = Presence::new("/Proj/chat", "alice", "Alice", PresenceStatus::Online);
        let json = serde_json::to_value(&presence).unwrap();
        assert_eq!(json["status"], "online");
        assert_eq!(json["userPresence"]["username"], "alice");
    }
}
