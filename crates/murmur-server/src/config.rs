//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file
//! - Environment variables (`MURMUR__*` for any key, `MURMUR_HOST` and
//!   `MURMUR_PORT` for the listen address defaults)

use anyhow::{Context, Result};
use murmur_core::{Grant, Group, MemoryStore, User};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Files tried in order by [`Config::load`].
const CONFIG_PATHS: [&str; 3] = [
    "murmur.toml",
    "/etc/murmur/murmur.toml",
    "~/.config/murmur/murmur.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Keepalive configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Diagnostics endpoints.
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,

    /// Records loaded into the in-memory store at startup.
    #[serde(default)]
    pub seed: SeedConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Frames a connection may have queued before pushes to it are dropped.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// Time allowed for the connect frame, in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

/// Keepalive configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Time allowed between pongs, in milliseconds.
    #[serde(default = "default_pong_wait")]
    pub pong_wait_ms: u64,

    /// Time allowed to write one frame, in milliseconds.
    #[serde(default = "default_write_wait")]
    pub write_wait_ms: u64,
}

impl HeartbeatConfig {
    #[must_use]
    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms)
    }

    #[must_use]
    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }

    /// Pings go out at 90% of the pong wait.
    #[must_use]
    pub fn ping_period(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms * 9 / 10)
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Diagnostics configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    /// Serve `GET /state`.
    #[serde(default)]
    pub enabled: bool,
}

/// Initial users, groups and topics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedConfig {
    #[serde(default)]
    pub users: Vec<SeedUser>,
    #[serde(default)]
    pub groups: Vec<SeedGroup>,
    #[serde(default)]
    pub topics: Vec<SeedTopic>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedUser {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub fullname: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub system: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedGroup {
    pub name: String,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub admins: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedTopic {
    pub path: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub ro_users: Vec<String>,
    #[serde(default)]
    pub rw_users: Vec<String>,
    #[serde(default)]
    pub admin_users: Vec<String>,
    #[serde(default)]
    pub ro_groups: Vec<String>,
    #[serde(default)]
    pub rw_groups: Vec<String>,
    #[serde(default)]
    pub admin_groups: Vec<String>,
}

impl SeedTopic {
    fn grants(&self) -> Vec<Grant> {
        let mut grants = Vec::new();
        grants.extend(self.ro_users.iter().cloned().map(Grant::ReadUser));
        grants.extend(self.rw_users.iter().cloned().map(Grant::WriteUser));
        grants.extend(self.admin_users.iter().cloned().map(Grant::AdminUser));
        grants.extend(self.ro_groups.iter().cloned().map(Grant::ReadGroup));
        grants.extend(self.rw_groups.iter().cloned().map(Grant::WriteGroup));
        grants.extend(self.admin_groups.iter().cloned().map(Grant::AdminGroup));
        if self.public {
            grants.push(Grant::PublicRead);
        }
        grants
    }
}

impl SeedConfig {
    /// Load the seed records into a store.
    ///
    /// Topics are created parents first, so a sub-topic starts from its
    /// parent's ACL before its own grants are added.
    ///
    /// # Errors
    ///
    /// Returns an error if a topic path is invalid or listed twice.
    pub fn apply(&self, store: &MemoryStore) -> Result<()> {
        for seed in &self.users {
            let mut user = User::new(&seed.username).with_fullname(&seed.fullname);
            if seed.admin {
                user = user.admin();
            }
            if seed.system {
                user = user.system();
            }
            store.add_user(user, &seed.password);
        }

        for seed in &self.groups {
            store.add_group(
                Group::new(&seed.name)
                    .with_users(seed.users.iter().cloned())
                    .with_admins(seed.admins.iter().cloned()),
            );
        }

        let mut topics: Vec<&SeedTopic> = self.topics.iter().collect();
        topics.sort_by_key(|t| t.path.matches('/').count());
        for seed in topics {
            let topic = store
                .create_topic(&seed.path, None)
                .with_context(|| format!("Failed to create seed topic {}", seed.path))?;
            for grant in seed.grants() {
                store.grant(&topic.path, grant, false)?;
            }
            debug!(topic = %topic.path, "Seeded topic");
        }

        info!(
            users = self.users.len(),
            groups = self.groups.len(),
            topics = self.topics.len(),
            "Seeded store"
        );
        Ok(())
    }
}

// Default value functions
fn default_host() -> String {
    std::env::var("MURMUR_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("MURMUR_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/socket/ws".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_outbound_capacity() -> usize {
    murmur_core::OUTBOUND_CAPACITY
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_pong_wait() -> u64 {
    60_000
}

fn default_write_wait() -> u64 {
    10_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            seed: SeedConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            max_message_size: default_max_message_size(),
            outbound_capacity: default_outbound_capacity(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            pong_wait_ms: default_pong_wait(),
            write_wait_ms: default_write_wait(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, with
    /// `MURMUR__*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let file = CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists());

        let mut builder = config::Config::builder();
        if let Some(path) = &file {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(
                config::File::from(path.as_path()).format(config::FileFormat::Toml),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("MURMUR")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(config::Config::try_deserialize)
            .context("Failed to load configuration")
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_core::{TopicDirectory, UserDirectory};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transport.websocket_path, "/socket/ws");
        assert_eq!(config.heartbeat.pong_wait(), Duration::from_secs(60));
        assert_eq!(config.heartbeat.write_wait(), Duration::from_secs(10));
        assert_eq!(config.heartbeat.ping_period(), Duration::from_secs(54));
        assert!(!config.diagnostics.enabled);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config {
            host: "127.0.0.1".into(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [heartbeat]
            pong_wait_ms = 1000

            [diagnostics]
            enabled = true

            [[seed.users]]
            username = "alice"
            password = "secret"

            [[seed.topics]]
            path = "/Lobby"
            public = true
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.heartbeat.ping_period(), Duration::from_millis(900));
        assert_eq!(config.heartbeat.write_wait_ms, 10_000);
        assert!(config.diagnostics.enabled);
        assert_eq!(config.seed.users[0].username, "alice");
        assert!(config.seed.topics[0].public);
    }

    #[tokio::test]
    async fn test_seed_apply() {
        let seed = SeedConfig {
            users: vec![SeedUser {
                username: "alice".into(),
                password: "pw".into(),
                fullname: "Alice".into(),
                admin: false,
                system: false,
            }],
            groups: vec![SeedGroup {
                name: "devs".into(),
                users: vec!["alice".into()],
                admins: vec![],
            }],
            topics: vec![
                SeedTopic {
                    path: "/Proj/chat".into(),
                    rw_users: vec!["bob".into()],
                    ..SeedTopic::default()
                },
                SeedTopic {
                    path: "/Proj".into(),
                    ro_groups: vec!["devs".into()],
                    ..SeedTopic::default()
                },
            ],
        };
        let store = MemoryStore::new();
        seed.apply(&store).unwrap();

        let alice = store.authenticate("alice", "pw").await.unwrap().unwrap();
        assert_eq!(alice.fullname, "Alice");

        let chat = store.find_by_path("/Proj/chat").await.unwrap().unwrap();
        assert_eq!(chat.ro_groups, vec!["devs".to_string()]);
        assert_eq!(chat.rw_users, vec!["bob".to_string()]);
    }
}
