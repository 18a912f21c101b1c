//! Broadcast dispatch.
//!
//! Write-side events are fanned out to the connections subscribed to them.
//! Message events are view-sensitive: a subscriber asking for a thread view
//! receives the whole thread the message belongs to. Each thread view is
//! materialized at most once per broadcast and shared by every subscriber
//! asking for it.

use murmur_protocol::{MessageEvent, Presence, PushFrame, TreeView};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, trace};

use crate::registry::{ConnectionRegistry, Instance, Outbound};
use crate::router::{SubscriptionEntry, SubscriptionRouter, Table};
use crate::tree::{Materializer, TreeError};

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Connections the event was addressed to.
    pub targeted: usize,
    /// Frames queued.
    pub delivered: usize,
}

impl Delivery {
    #[must_use]
    pub fn failed(&self) -> usize {
        self.targeted - self.delivered
    }
}

/// Fans events out from the router to the registry.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    router: Arc<SubscriptionRouter>,
    tree: Materializer,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        router: Arc<SubscriptionRouter>,
        tree: Materializer,
    ) -> Self {
        Self {
            registry,
            router,
            tree,
        }
    }

    /// Push a created or updated message to subscribers of its topics.
    ///
    /// A connection subscribed to several of the message's topics receives
    /// it once, in the view of its first matching subscription.
    ///
    /// # Errors
    ///
    /// Returns an error, before anything is delivered, if a thread view
    /// cannot be materialized.
    pub async fn broadcast_message(&self, event: MessageEvent) -> Result<Delivery, TreeError> {
        let mut seen = HashSet::new();
        let targets: Vec<SubscriptionEntry> = event
            .message
            .topics
            .iter()
            .flat_map(|topic| self.router.entries(Table::Messages, topic))
            .filter(|entry| seen.insert(entry.instance.clone()))
            .collect();

        if targets.is_empty() {
            trace!(message = %event.message.id, "No subscribers for message");
            return Ok(Delivery::default());
        }

        let wants = |view: TreeView| targets.iter().any(|e| e.tree_view == view);
        let one_level = self.thread_frame(&event, TreeView::OneLevel, wants(TreeView::OneLevel)).await?;
        let full = self.thread_frame(&event, TreeView::Full, wants(TreeView::Full)).await?;
        let raw = Arc::new(PushFrame::message(event));

        let targeted = targets.len();
        let deliveries = targets.into_iter().map(|entry| {
            let frame = match entry.tree_view {
                TreeView::OneLevel => one_level.as_ref().unwrap_or(&raw),
                TreeView::Full => full.as_ref().unwrap_or(&raw),
                TreeView::None => &raw,
            };
            (entry.instance, Outbound::Push(Arc::clone(frame)))
        });
        let delivered = self.registry.fan_out(deliveries);

        debug!(targeted, delivered, "Broadcast message");
        Ok(Delivery { targeted, delivered })
    }

    /// The push frame carrying the message's thread in `view`.
    ///
    /// `None` when not wanted, or when the thread root is not stored, in
    /// which case subscribers fall back to the raw message.
    async fn thread_frame(
        &self,
        event: &MessageEvent,
        view: TreeView,
        wanted: bool,
    ) -> Result<Option<Arc<PushFrame>>, TreeError> {
        if !wanted {
            return Ok(None);
        }

        let root_id = event.message.root_id();
        let started = Instant::now();
        let thread = self.tree.thread(root_id, view).await.map_err(|e| {
            error!(message = %event.message.id, view = %view, error = %e, "Thread materialization failed");
            e
        })?;
        trace!(root = %root_id, view = %view, elapsed = ?started.elapsed(), "Materialized thread for broadcast");

        Ok(thread.map(|tree| Arc::new(PushFrame::message_with_tree(event.clone(), view, tree))))
    }

    /// Tell subscribers of a topic that new messages are available.
    pub fn broadcast_message_count(&self, topic: &str) -> Delivery {
        let frame = Arc::new(PushFrame::message_count(topic));
        let targets = self.router.entries(Table::MessagesNew, topic);
        self.plain(frame, targets.into_iter().map(|e| e.instance).collect())
    }

    /// Push a presence to subscribers of its topic.
    pub fn broadcast_presence(&self, presence: Presence) -> Delivery {
        let targets = self.router.entries(Table::Presences, &presence.topic);
        let frame = Arc::new(PushFrame::presence(presence));
        self.plain(frame, targets.into_iter().map(|e| e.instance).collect())
    }

    /// Push a user lifecycle event to every follower of user events.
    pub fn broadcast_user_event(&self, action: &str, username: &str) -> Delivery {
        let frame = Arc::new(PushFrame::user(action, username));
        self.plain(frame, self.router.user_subscribers())
    }

    fn plain(&self, frame: Arc<PushFrame>, targets: Vec<Instance>) -> Delivery {
        let kind = frame.kind();
        let targeted = targets.len();
        let delivered = self
            .registry
            .fan_out(targets.into_iter().map(|i| (i, Outbound::Push(Arc::clone(&frame)))));
        trace!(kind, targeted, delivered, "Broadcast event");
        Delivery { targeted, delivered }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::AccessResolver;
    use crate::directory::{MessageRepository, StoreError};
    use crate::filter::MessageFilter;
    use crate::memory::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Message lookups that count how often they are made.
    struct CountingMessages {
        store: Arc<MemoryStore>,
        finds: AtomicUsize,
    }

    #[async_trait]
    impl MessageRepository for CountingMessages {
        async fn find(&self, filter: &MessageFilter) -> Result<Vec<Message>, StoreError> {
            self.finds.fetch_add(1, Ordering::SeqCst);
            self.store.find(filter).await
        }
    }
    use crate::registry::{outbound_queue, OutboundReceiver};
    use crate::topic::Topic;
    use crate::user::User;
    use murmur_protocol::{Message, PresenceStatus};

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: Arc<ConnectionRegistry>,
        router: Arc<SubscriptionRouter>,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.put_topic(Topic::new("/Proj/chat").unwrap().public_ro());
        store.put_topic(Topic::new("/Proj/ops").unwrap().public_ro());
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(SubscriptionRouter::new(
            store.clone(),
            AccessResolver::new(store.clone()),
        ));
        let dispatcher = Dispatcher::new(
            registry.clone(),
            router.clone(),
            Materializer::new(store.clone()),
        );
        Fixture {
            store,
            registry,
            router,
            dispatcher,
        }
    }

    impl Fixture {
        async fn connect(&self, username: &str, table: Table, topics: &[&str], view: TreeView) -> (Instance, OutboundReceiver) {
            let (tx, rx) = outbound_queue(16);
            let user = User::new(username);
            let instance = self.registry.register(user.clone(), tx);
            for topic in topics {
                self.router
                    .subscribe(table, topic, &user, &instance, view)
                    .await
                    .unwrap();
            }
            (instance, rx)
        }
    }

    fn pushed(rx: &mut OutboundReceiver) -> Vec<Arc<PushFrame>> {
        let mut frames = Vec::new();
        while let Ok(Outbound::Push(frame)) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn event(message: Message) -> MessageEvent {
        MessageEvent {
            action: "create".into(),
            username: "alice".into(),
            message,
        }
    }

    #[tokio::test]
    async fn test_thread_fetched_once_per_view() {
        let fx = fixture();
        let messages = Arc::new(CountingMessages {
            store: fx.store.clone(),
            finds: AtomicUsize::new(0),
        });
        let dispatcher = Dispatcher::new(
            fx.registry.clone(),
            fx.router.clone(),
            Materializer::new(messages.clone()),
        );
        let root = fx.store.insert_message(Message::new("r", "/Proj/chat", "root").created_at(1));
        let a = fx
            .store
            .insert_message(Message::new("a", "/Proj/chat", "a").in_reply_to(&root).created_at(2));
        let b = fx
            .store
            .insert_message(Message::new("b", "/Proj/chat", "b").in_reply_to(&a).created_at(3));

        let mut one_level = Vec::new();
        let mut full = Vec::new();
        for i in 0..4 {
            let (_, rx) = fx.connect(&format!("one{i}"), Table::Messages, &["/Proj/chat"], TreeView::OneLevel).await;
            one_level.push(rx);
            let (_, rx) = fx.connect(&format!("full{i}"), Table::Messages, &["/Proj/chat"], TreeView::Full).await;
            full.push(rx);
        }

        let delivery = dispatcher.broadcast_message(event(b)).await.unwrap();
        assert_eq!(delivery, Delivery { targeted: 8, delivered: 8 });
        assert_eq!(messages.finds.load(Ordering::SeqCst), 2);

        for receivers in [&mut one_level, &mut full] {
            let frames: Vec<_> = receivers.iter_mut().map(|rx| pushed(rx).remove(0)).collect();
            assert!(frames.iter().all(|f| Arc::ptr_eq(f, &frames[0])));
        }
    }

    #[tokio::test]
    async fn test_message_views() {
        let fx = fixture();
        let root = fx.store.insert_message(Message::new("r", "/Proj/chat", "root").created_at(1));
        let reply = fx
            .store
            .insert_message(Message::new("m", "/Proj/chat", "reply").in_reply_to(&root).created_at(2));

        let (_, mut raw_rx) = fx.connect("raw", Table::Messages, &["/Proj/chat"], TreeView::None).await;
        let (_, mut one_rx) = fx.connect("one", Table::Messages, &["/Proj/chat"], TreeView::OneLevel).await;
        let (_, mut full_rx) = fx.connect("full", Table::Messages, &["/Proj/chat"], TreeView::Full).await;

        let delivery = fx.dispatcher.broadcast_message(event(reply)).await.unwrap();
        assert_eq!(delivery, Delivery { targeted: 3, delivered: 3 });

        match pushed(&mut raw_rx)[0].as_ref() {
            PushFrame::Message { event, one_tree, full_tree } => {
                assert_eq!(event.message.id, "m");
                assert!(one_tree.is_none() && full_tree.is_none());
            }
            other => panic!("Unexpected frame {:?}", other),
        }
        match pushed(&mut one_rx)[0].as_ref() {
            PushFrame::Message { one_tree: Some(tree), .. } => {
                assert_eq!(tree.id, "r");
                assert_eq!(tree.replies.len(), 1);
                assert_eq!(tree.replies[0].id, "m");
            }
            other => panic!("Unexpected frame {:?}", other),
        }
        assert!(matches!(
            pushed(&mut full_rx)[0].as_ref(),
            PushFrame::Message { full_tree: Some(_), .. }
        ));
    }

    #[tokio::test]
    async fn test_multi_topic_message_delivered_once() {
        let fx = fixture();
        let (_, mut rx) = fx
            .connect("alice", Table::Messages, &["/Proj/chat", "/Proj/ops"], TreeView::None)
            .await;

        let mut message = Message::new("x", "/Proj/chat", "both");
        message.topics.push("/Proj/ops".into());
        let delivery = fx.dispatcher.broadcast_message(event(message)).await.unwrap();

        assert_eq!(delivery.targeted, 1);
        assert_eq!(pushed(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_cycle_fails_before_any_delivery() {
        let fx = fixture();
        let mut a = Message::new("a", "/Proj/chat", "a");
        let mut b = Message::new("b", "/Proj/chat", "b");
        a.in_reply_of_id_root = "b".into();
        b.in_reply_of_id_root = "a".into();
        fx.store.insert_message(a.clone());
        fx.store.insert_message(b);

        let (_, mut raw_rx) = fx.connect("raw", Table::Messages, &["/Proj/chat"], TreeView::None).await;
        let (_, mut one_rx) = fx.connect("one", Table::Messages, &["/Proj/chat"], TreeView::OneLevel).await;

        let result = fx.dispatcher.broadcast_message(event(a)).await;
        assert!(matches!(result, Err(TreeError::CycleDetected { .. })));
        assert!(pushed(&mut raw_rx).is_empty());
        assert!(pushed(&mut one_rx).is_empty());
    }

    #[tokio::test]
    async fn test_plain_fan_outs() {
        let fx = fixture();
        let (_, mut count_rx) = fx.connect("c", Table::MessagesNew, &["/Proj/chat"], TreeView::None).await;
        let (_, mut presence_rx) = fx.connect("p", Table::Presences, &["/Proj/chat"], TreeView::None).await;

        assert_eq!(fx.dispatcher.broadcast_message_count("/Proj/chat").delivered, 1);
        assert_eq!(fx.dispatcher.broadcast_message_count("/Proj/ops").targeted, 0);
        assert_eq!(pushed(&mut count_rx)[0].kind(), "message_count");

        let presence = Presence::new("/Proj/chat", "p", "P", PresenceStatus::Busy);
        assert_eq!(fx.dispatcher.broadcast_presence(presence).delivered, 1);
        assert_eq!(pushed(&mut presence_rx)[0].kind(), "presence");

        let (tx, mut admin_rx) = outbound_queue(4);
        let admin = User::new("root").admin();
        let instance = fx.registry.register(admin.clone(), tx);
        fx.router.subscribe_users(&admin, &instance).unwrap();
        assert_eq!(fx.dispatcher.broadcast_user_event("create", "newbie").delivered, 1);
        assert_eq!(pushed(&mut admin_rx)[0].kind(), "user");
    }

    #[tokio::test]
    async fn test_departed_connection_is_skipped() {
        let fx = fixture();
        let (gone, _rx) = fx.connect("gone", Table::MessagesNew, &["/Proj/chat"], TreeView::None).await;
        fx.registry.unregister(&gone);

        let delivery = fx.dispatcher.broadcast_message_count("/Proj/chat");
        assert_eq!(delivery.targeted, 1);
        assert_eq!(delivery.failed(), 1);
    }
}
