//! Live connection registry.
//!
//! Every authenticated connection is registered under an [`Instance`] key
//! with the sending half of its outbound queue. A single writer task per
//! connection drains that queue, so frames reach a socket in the order they
//! were queued and never interleave.
//!
//! The registry is one map behind one reader/writer lock. Registration and
//! removal take it exclusively; a fan-out holds the shared lock for the
//! whole delivery loop, so no connection disappears mid-broadcast.

use murmur_protocol::{codec, now_millis, AckFrame, Encoded, Encoding, ProtocolError, PushFrame};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::locks;
use crate::user::User;

/// Default capacity of a connection's outbound queue.
pub const OUTBOUND_CAPACITY: usize = 256;

/// Separates the username from the salt in an [`Instance`].
const SALT_SEPARATOR: char = '$';

/// Identifier of one live connection: `username$salt`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Instance(String);

impl Instance {
    /// A fresh instance for a new session of `username`.
    #[must_use]
    pub fn generate(username: &str) -> Self {
        Self(format!(
            "{username}{SALT_SEPARATOR}{}",
            uuid::Uuid::new_v4().simple()
        ))
    }

    /// The user this connection belongs to.
    #[must_use]
    pub fn username(&self) -> &str {
        self.0
            .rsplit_once(SALT_SEPARATOR)
            .map_or(self.0.as_str(), |(username, _)| username)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Instance {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A frame waiting in a connection's outbound queue.
///
/// Pushes are shared between every recipient of a broadcast.
#[derive(Debug, Clone)]
pub enum Outbound {
    Ack(AckFrame),
    Push(Arc<PushFrame>),
}

impl Outbound {
    /// Encode for the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be serialized.
    pub fn encode(&self, encoding: Encoding) -> Result<Encoded, ProtocolError> {
        match self {
            Outbound::Ack(ack) => codec::encode(ack, encoding),
            Outbound::Push(push) => codec::encode(push.as_ref(), encoding),
        }
    }

    /// Short name of the frame kind, for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::Ack(_) => "ack",
            Outbound::Push(push) => push.kind(),
        }
    }
}

pub type OutboundSender = mpsc::Sender<Outbound>;
pub type OutboundReceiver = mpsc::Receiver<Outbound>;

/// Create an outbound queue.
#[must_use]
pub fn outbound_queue(capacity: usize) -> (OutboundSender, OutboundReceiver) {
    mpsc::channel(capacity)
}

/// Delivery errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No live connection under this instance.
    #[error("Connection not registered: {0}")]
    NotRegistered(Instance),

    /// The outbound queue is full.
    #[error("Outbound queue full: {0}")]
    QueueFull(Instance),

    /// The writer has stopped.
    #[error("Outbound queue closed: {0}")]
    QueueClosed(Instance),
}

struct Entry {
    user: User,
    outbound: OutboundSender,
    connected_at: i64,
    last_pong: AtomicI64,
}

/// Diagnostic view of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub instance: Instance,
    pub username: String,
    pub is_admin: bool,
    pub connected_at: i64,
    pub last_pong: i64,
}

/// Registry of live connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Instance, Entry>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authenticated connection under a fresh instance.
    pub fn register(&self, user: User, outbound: OutboundSender) -> Instance {
        let instance = Instance::generate(&user.username);
        let now = now_millis();
        let mut connections = locks::write(&self.connections);
        connections.insert(
            instance.clone(),
            Entry {
                user,
                outbound,
                connected_at: now,
                last_pong: AtomicI64::new(now),
            },
        );
        debug!(connection = %instance, total = connections.len(), "Registered connection");
        instance
    }

    /// Remove a connection. Dropping its queue stops its writer.
    pub fn unregister(&self, instance: &Instance) -> bool {
        let removed = locks::write(&self.connections).remove(instance).is_some();
        if removed {
            debug!(connection = %instance, "Unregistered connection");
        }
        removed
    }

    /// Remove every connection of `username`, returning their instances.
    pub fn close_for_user(&self, username: &str) -> Vec<Instance> {
        let mut connections = locks::write(&self.connections);
        let closed: Vec<Instance> = connections
            .iter()
            .filter(|(_, entry)| entry.user.username == username)
            .map(|(instance, _)| instance.clone())
            .collect();
        for instance in &closed {
            connections.remove(instance);
        }
        debug!(user = %username, closed = closed.len(), "Closed connections for user");
        closed
    }

    /// Queue a frame for one connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is gone or its queue is full.
    pub fn send(&self, instance: &Instance, frame: Outbound) -> Result<(), TransportError> {
        let connections = locks::read(&self.connections);
        Self::deliver(&connections, instance, frame)
    }

    /// Queue frames for many connections under one read lock.
    ///
    /// Failures are logged and leave the connection registered. Returns the
    /// number of frames queued.
    pub fn fan_out<I>(&self, deliveries: I) -> usize
    where
        I: IntoIterator<Item = (Instance, Outbound)>,
    {
        let connections = locks::read(&self.connections);
        let mut delivered = 0;
        for (instance, frame) in deliveries {
            match Self::deliver(&connections, &instance, frame) {
                Ok(()) => delivered += 1,
                Err(TransportError::NotRegistered(_)) => {
                    trace!(connection = %instance, "Skipping departed connection");
                }
                Err(e) => warn!(connection = %instance, error = %e, "Broadcast delivery failed"),
            }
        }
        delivered
    }

    fn deliver(
        connections: &HashMap<Instance, Entry>,
        instance: &Instance,
        frame: Outbound,
    ) -> Result<(), TransportError> {
        let entry = connections
            .get(instance)
            .ok_or_else(|| TransportError::NotRegistered(instance.clone()))?;
        entry.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull(instance.clone()),
            mpsc::error::TrySendError::Closed(_) => TransportError::QueueClosed(instance.clone()),
        })
    }

    /// Record a pong.
    pub fn touch(&self, instance: &Instance) -> bool {
        let connections = locks::read(&self.connections);
        match connections.get(instance) {
            Some(entry) => {
                entry.last_pong.store(now_millis(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// The user behind a connection.
    #[must_use]
    pub fn user(&self, instance: &Instance) -> Option<User> {
        locks::read(&self.connections)
            .get(instance)
            .map(|entry| entry.user.clone())
    }

    #[must_use]
    pub fn contains(&self, instance: &Instance) -> bool {
        locks::read(&self.connections).contains_key(instance)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        locks::read(&self.connections).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every connection, ordered by instance.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = locks::read(&self.connections)
            .iter()
            .map(|(instance, entry)| ConnectionInfo {
                instance: instance.clone(),
                username: entry.user.username.clone(),
                is_admin: entry.user.is_admin,
                connected_at: entry.connected_at,
                last_pong: entry.last_pong.load(Ordering::Relaxed),
            })
            .collect();
        infos.sort_by(|a, b| a.instance.cmp(&b.instance));
        infos
    }
}
