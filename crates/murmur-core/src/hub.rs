//! The engine facade.
//!
//! A [`Hub`] owns the registry, router and dispatcher, wired to one set of
//! [`Directories`]. Transports call [`Hub::connect`], [`Hub::handle_action`],
//! [`Hub::pong`] and [`Hub::disconnect`]; the write side calls the
//! `broadcast_*` methods and [`Hub::close_connections_for_user`].

use murmur_protocol::{
    AckFrame, Action, ActionFrame, ConnectFrame, MessageEvent, Presence, PresenceStatus, TreeView,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::acl::AccessResolver;
use crate::broadcast::{Delivery, Dispatcher};
use crate::directory::Directories;
use crate::error::HubError;
use crate::registry::{
    ConnectionInfo, ConnectionRegistry, Instance, Outbound, OutboundSender, TransportError,
};
use crate::router::{RouterSnapshot, SubscriptionRouter, Table};
use crate::topic::normalize_topic_path;
use crate::tree::Materializer;
use crate::user::User;

/// Topic keyword expanding to every topic the user can read.
pub const ALL_TOPICS: &str = "all";

/// Action name of the connect acknowledgement.
pub const CONNECT_ACTION: &str = "connect";

/// Diagnostic snapshot of the live state.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub connections: Vec<ConnectionInfo>,
    pub subscriptions: RouterSnapshot,
}

/// The realtime engine.
pub struct Hub {
    directories: Directories,
    access: AccessResolver,
    registry: Arc<ConnectionRegistry>,
    router: Arc<SubscriptionRouter>,
    dispatcher: Dispatcher,
}

impl Hub {
    #[must_use]
    pub fn new(directories: Directories) -> Self {
        let access = AccessResolver::new(directories.users.clone());
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(SubscriptionRouter::new(
            directories.topics.clone(),
            access.clone(),
        ));
        let dispatcher = Dispatcher::new(
            registry.clone(),
            router.clone(),
            Materializer::new(directories.messages.clone()),
        );
        info!("Creating hub");
        Self {
            directories,
            access,
            registry,
            router,
            dispatcher,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    #[must_use]
    pub fn router(&self) -> &SubscriptionRouter {
        &self.router
    }

    /// Authenticate a new connection and register it.
    ///
    /// The connect acknowledgement is queued before anything else can be.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Authentication`] on bad credentials; the
    /// connection is then never registered.
    pub async fn connect(&self, frame: &ConnectFrame, outbound: OutboundSender) -> Result<Instance, HubError> {
        let user = self
            .directories
            .users
            .authenticate(&frame.username, &frame.password)
            .await?
            .ok_or_else(|| {
                warn!(user = %frame.username, "Authentication failed");
                HubError::Authentication(frame.username.clone())
            })?;

        let instance = self.registry.register(user, outbound);
        let ack = AckFrame::ok(CONNECT_ACTION, "connect OK");
        if let Err(e) = self.registry.send(&instance, Outbound::Ack(ack)) {
            self.registry.unregister(&instance);
            return Err(e.into());
        }

        info!(connection = %instance, "Connection authenticated");
        Ok(instance)
    }

    /// Record a pong from a connection.
    pub fn pong(&self, instance: &Instance) -> bool {
        self.registry.touch(instance)
    }

    /// Remove a connection from the registry and every subscription.
    pub fn disconnect(&self, instance: &Instance) {
        self.registry.unregister(instance);
        self.router.remove_connection(instance);
        info!(connection = %instance, "Connection closed");
    }

    /// Close every connection of a user. Returns how many were closed.
    pub fn close_connections_for_user(&self, username: &str) -> usize {
        let closed = self.registry.close_for_user(username);
        for instance in &closed {
            self.router.remove_connection(instance);
        }
        info!(user = %username, closed = closed.len(), "Closed connections for user");
        closed.len()
    }

    /// Handle an action frame, returning one acknowledgement per topic.
    pub async fn handle_action(&self, instance: &Instance, frame: &ActionFrame) -> Vec<AckFrame> {
        let Some(user) = self.registry.user(instance) else {
            return vec![nack(&frame.action, "", &HubError::BadRequest("connection not registered".into()))];
        };
        let action = match frame.parse_action() {
            Ok(action) => action,
            Err(e) => return vec![nack(&frame.action, "", &HubError::BadRequest(e.to_string()))],
        };
        debug!(connection = %instance, action = %action, topics = frame.topics.len(), "Handling action");

        let acks = match action {
            Action::SubscribeMessages => self.subscribe(Table::Messages, action, frame, &user, instance).await,
            Action::SubscribeMessagesNew => self.subscribe(Table::MessagesNew, action, frame, &user, instance).await,
            Action::SubscribePresences => self.subscribe(Table::Presences, action, frame, &user, instance).await,
            Action::UnsubscribeMessages => self.unsubscribe(Table::Messages, action, frame, instance),
            Action::UnsubscribeMessagesNew => self.unsubscribe(Table::MessagesNew, action, frame, instance),
            Action::UnsubscribePresences => self.unsubscribe(Table::Presences, action, frame, instance),
            Action::SubscribeUsers => {
                let result = self.router.subscribe_users(&user, instance).map_err(HubError::from);
                vec![ack(action.as_str(), "users", result)]
            }
            Action::UnsubscribeUsers => {
                self.router.unsubscribe_users(instance);
                vec![AckFrame::ok(action.as_str(), "users OK")]
            }
            Action::WritePresence => return self.write_presence_action(action, frame, &user).await,
        };

        // The connection may have been closed while the subscription awaited
        // the directories. Its removal from the router has then already run.
        if !self.registry.contains(instance) {
            self.router.remove_connection(instance);
            debug!(connection = %instance, action = %action, "Connection closed during action");
            let error = HubError::from(TransportError::NotRegistered(instance.clone()));
            return vec![nack(action.as_str(), "", &error)];
        }
        acks
    }

    async fn subscribe(
        &self,
        table: Table,
        action: Action,
        frame: &ActionFrame,
        user: &User,
        instance: &Instance,
    ) -> Vec<AckFrame> {
        if frame.topics.is_empty() {
            return vec![nack(action.as_str(), "", &HubError::BadRequest("no topic given".into()))];
        }
        let tree_view = match table {
            Table::Messages => match frame.parse_tree_view() {
                Ok(view) => view,
                Err(e) => return vec![nack(action.as_str(), "", &HubError::BadRequest(e.to_string()))],
            },
            Table::MessagesNew | Table::Presences => TreeView::None,
        };

        let mut acks = Vec::with_capacity(frame.topics.len());
        for topic in &frame.topics {
            if topic == ALL_TOPICS {
                match self.router.subscribe_readable(table, user, instance, tree_view).await {
                    Ok(results) => acks.extend(
                        results
                            .into_iter()
                            .map(|(path, result)| ack(action.as_str(), &path, result.map_err(HubError::from))),
                    ),
                    Err(e) => acks.push(nack(action.as_str(), topic, &HubError::from(e))),
                }
            } else {
                let result = self
                    .router
                    .subscribe(table, topic, user, instance, tree_view)
                    .await
                    .map(|_| ())
                    .map_err(HubError::from);
                acks.push(ack(action.as_str(), topic, result));
            }
        }
        acks
    }

    fn unsubscribe(&self, table: Table, action: Action, frame: &ActionFrame, instance: &Instance) -> Vec<AckFrame> {
        if frame.topics.is_empty() {
            return vec![nack(action.as_str(), "", &HubError::BadRequest("no topic given".into()))];
        }
        frame
            .topics
            .iter()
            .map(|topic| {
                if topic == ALL_TOPICS {
                    self.router.unsubscribe_all(table, instance);
                } else {
                    self.router.unsubscribe(table, topic, instance);
                }
                ack(action.as_str(), topic, Ok(()))
            })
            .collect()
    }

    async fn write_presence_action(&self, action: Action, frame: &ActionFrame, user: &User) -> Vec<AckFrame> {
        let status = match frame.status.as_deref().unwrap_or_default().parse::<PresenceStatus>() {
            Ok(status) => status,
            Err(e) => return vec![nack(action.as_str(), "", &HubError::BadRequest(e))],
        };
        if frame.topics.is_empty() {
            return vec![nack(action.as_str(), "", &HubError::BadRequest("no topic given".into()))];
        }

        let mut acks = Vec::with_capacity(frame.topics.len());
        for topic in &frame.topics {
            let result = self.write_presence(user, topic, status).await.map(|_| ());
            acks.push(ack(action.as_str(), topic, result));
        }
        acks
    }

    /// Store a user's presence on a topic and push it to subscribers.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is invalid or unknown, the user cannot
    /// read it, or the presence cannot be stored.
    pub async fn write_presence(&self, user: &User, topic: &str, status: PresenceStatus) -> Result<Delivery, HubError> {
        let path = normalize_topic_path(topic).map_err(|e| HubError::BadRequest(e.to_string()))?;
        let topic = self
            .directories
            .topics
            .find_by_path(&path)
            .await?
            .ok_or_else(|| HubError::TopicNotFound(path.clone()))?;
        if !self.access.can_read(&topic, user).await? {
            return Err(HubError::Forbidden(path));
        }

        let presence = self.directories.presences.upsert(user, &topic, status).await?;
        Ok(self.dispatcher.broadcast_presence(presence))
    }

    /// Push a created or updated message to its subscribers.
    ///
    /// # Errors
    ///
    /// Returns an error if a requested thread view cannot be materialized;
    /// nothing is delivered in that case.
    pub async fn broadcast_message(&self, event: MessageEvent) -> Result<Delivery, HubError> {
        Ok(self.dispatcher.broadcast_message(event).await?)
    }

    pub fn broadcast_message_count(&self, topic: &str) -> Delivery {
        self.dispatcher.broadcast_message_count(topic)
    }

    pub fn broadcast_presence(&self, presence: Presence) -> Delivery {
        self.dispatcher.broadcast_presence(presence)
    }

    pub fn broadcast_user_event(&self, action: &str, username: &str) -> Delivery {
        self.dispatcher.broadcast_user_event(action, username)
    }

    /// Snapshot of connections and subscription tables.
    #[must_use]
    pub fn dump_state(&self) -> StateSnapshot {
        StateSnapshot {
            connections: self.registry.snapshot(),
            subscriptions: self.router.snapshot(),
        }
    }
}

fn ack(action: &str, topic: &str, result: Result<(), HubError>) -> AckFrame {
    match result {
        Ok(()) => AckFrame::ok(action, format!("{topic} OK")),
        Err(e) => nack(action, topic, &e),
    }
}

fn nack(action: &str, topic: &str, error: &HubError) -> AckFrame {
    debug!(action, topic, status = error.status(), error = %error, "Action rejected");
    let result = if topic.is_empty() {
        error.to_string()
    } else {
        format!("{topic}: {error}")
    };
    AckFrame::new(action, result, error.status())
}
