//! Reply tree materialization.
//!
//! Turns a flat list of messages into threads:
//!
//! - [`TreeView::OneLevel`] groups replies by thread root and flattens every
//!   reply, however deep, into its root's `replies`.
//! - [`TreeView::Full`] nests each reply under its immediate parent.
//!
//! Replies whose ancestor is not in the working set are resolved by
//! refetching the missing ancestors, together with the thread roots their
//! replies name, under the exclusion predicates of the original filter. An
//! ancestor that is gone or excluded takes its whole subtree with it.
//!
//! Resolution runs in passes, each pass refetching what the previous one
//! could not place. A pass limit bounds chains that keep growing through
//! refetches; a chain that loops back on itself inside the working set is
//! reported at once. Both surface as [`TreeError::CycleDetected`], never as
//! a partial tree.

use murmur_protocol::{Message, MessageId, TreeView};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

use crate::directory::{MessageRepository, StoreError};
use crate::filter::{Criterion, MessageFilter};

/// Maximum resolution passes for [`TreeView::OneLevel`].
pub const ONE_LEVEL_MAX_ROUNDS: usize = 25;

/// Maximum resolution passes for [`TreeView::Full`].
pub const FULL_MAX_ROUNDS: usize = 10;

/// Materialization errors.
#[derive(Debug, Error)]
pub enum TreeError {
    /// Replies could not be attached to a root within the pass limit.
    #[error("Reply cycle detected after {rounds} rounds, messages: {}", ids.join(","))]
    CycleDetected { rounds: usize, ids: Vec<MessageId> },

    /// Refetching ancestors failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Pass limit for a view.
#[must_use]
pub fn max_rounds(view: TreeView) -> usize {
    match view {
        TreeView::Full => FULL_MAX_ROUNDS,
        TreeView::None | TreeView::OneLevel => ONE_LEVEL_MAX_ROUNDS,
    }
}

/// The message a reply hangs from in the given view, empty for a root.
fn link(message: &Message, view: TreeView) -> &str {
    let (primary, fallback) = match view {
        TreeView::Full => (&message.in_reply_of_id, &message.in_reply_of_id_root),
        TreeView::None | TreeView::OneLevel => (&message.in_reply_of_id_root, &message.in_reply_of_id),
    };
    if primary.is_empty() {
        fallback
    } else {
        primary
    }
}

fn newest_first(a: &Message, b: &Message) -> std::cmp::Ordering {
    b.date_creation
        .cmp(&a.date_creation)
        .then_with(|| a.id.cmp(&b.id))
}

enum Resolution {
    Root(MessageId),
    /// The missing ancestor, and the thread root named by its child.
    Missing { ancestor: MessageId, root: MessageId },
    Cycle,
}

/// Follow links from `id` until a root, a missing ancestor or a loop.
fn resolve(working: &HashMap<MessageId, Message>, id: &str, view: TreeView) -> Resolution {
    let mut seen = HashSet::new();
    let mut current = id;
    let mut root = "";
    loop {
        let Some(message) = working.get(current) else {
            return Resolution::Missing {
                ancestor: current.to_string(),
                root: root.to_string(),
            };
        };
        root = message.in_reply_of_id_root.as_str();
        let next = link(message, view);
        if next.is_empty() {
            return Resolution::Root(current.to_string());
        }
        seen.insert(current);
        if seen.contains(next) {
            return Resolution::Cycle;
        }
        current = next;
    }
}

fn all_ids(working: &HashMap<MessageId, Message>) -> Vec<MessageId> {
    let mut ids: Vec<MessageId> = working.keys().cloned().collect();
    ids.sort();
    ids
}

/// Builds reply trees, refetching ancestors from a [`MessageRepository`].
#[derive(Clone)]
pub struct Materializer {
    messages: Arc<dyn MessageRepository>,
}

impl Materializer {
    #[must_use]
    pub fn new(messages: Arc<dyn MessageRepository>) -> Self {
        Self { messages }
    }

    /// Materialize `messages` in the given view.
    ///
    /// `filter` is the filter `messages` were selected with; only its
    /// exclusion predicates apply to refetched ancestors. Roots come out
    /// newest first, and so do replies at every level.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::CycleDetected`] if replies cannot be attached
    /// within the pass limit, or a store error if refetching fails.
    pub async fn materialize(
        &self,
        messages: Vec<Message>,
        filter: &MessageFilter,
        view: TreeView,
    ) -> Result<Vec<Message>, TreeError> {
        if view == TreeView::None || messages.is_empty() {
            return Ok(messages);
        }

        let limit = max_rounds(view);
        let exclusions = filter.exclusions();
        let mut working: HashMap<MessageId, Message> =
            messages.into_iter().map(|m| (m.id.clone(), m)).collect();
        let mut gone: HashSet<MessageId> = HashSet::new();
        let mut round = 1;

        let roots = loop {
            let mut roots: HashMap<MessageId, MessageId> = HashMap::new();
            let mut unresolved: BTreeSet<MessageId> = BTreeSet::new();
            let mut thread_roots: BTreeSet<MessageId> = BTreeSet::new();
            let mut orphans = Vec::new();

            for id in working.keys() {
                match resolve(&working, id, view) {
                    Resolution::Root(root) => {
                        roots.insert(id.clone(), root);
                    }
                    Resolution::Missing { ancestor, .. } if gone.contains(&ancestor) => {
                        orphans.push(id.clone());
                    }
                    Resolution::Missing { ancestor, root } => {
                        if !root.is_empty() && !working.contains_key(&root) && !gone.contains(&root) {
                            thread_roots.insert(root);
                        }
                        unresolved.insert(ancestor);
                    }
                    Resolution::Cycle => {
                        return Err(TreeError::CycleDetected {
                            rounds: round,
                            ids: all_ids(&working),
                        });
                    }
                }
            }

            for id in &orphans {
                working.remove(id);
            }
            if !orphans.is_empty() {
                trace!(round, dropped = orphans.len(), "Dropped replies of excluded ancestors");
            }

            if unresolved.is_empty() {
                break roots;
            }
            if round >= limit {
                return Err(TreeError::CycleDetected {
                    rounds: round,
                    ids: all_ids(&working),
                });
            }

            round += 1;
            trace!(round, missing = unresolved.len(), "Refetching ancestors");
            // Asking for the thread roots too brings a deep thread in at once.
            let wanted = unresolved.iter().chain(thread_roots.difference(&unresolved)).cloned();
            let refetch = exclusions.clone().and(Criterion::Thread(wanted.collect()));
            let fetched = self.messages.find(&refetch).await?;

            for ancestor in unresolved {
                if !fetched.iter().any(|m| m.id == ancestor) {
                    gone.insert(ancestor);
                }
            }
            for message in fetched {
                working.insert(message.id.clone(), message);
            }
        };

        debug!(view = %view, rounds = round, messages = working.len(), "Materialized threads");

        let mut trees = match view {
            TreeView::Full => build_full(working, view),
            TreeView::None | TreeView::OneLevel => build_one_level(working, &roots),
        };
        trees.sort_by(newest_first);
        Ok(trees)
    }

    /// Materialize the whole thread rooted at `root_id`.
    ///
    /// Returns `None` if the root does not exist.
    ///
    /// # Errors
    ///
    /// Same as [`Materializer::materialize`].
    pub async fn thread(&self, root_id: &str, view: TreeView) -> Result<Option<Message>, TreeError> {
        let filter = MessageFilter::thread([root_id.to_string()]);
        let messages = self.messages.find(&filter).await?;
        let trees = self.materialize(messages, &MessageFilter::new(), view).await?;
        Ok(trees.into_iter().find(|m| m.id == root_id))
    }
}

fn build_one_level(
    mut working: HashMap<MessageId, Message>,
    roots: &HashMap<MessageId, MessageId>,
) -> Vec<Message> {
    let mut replies: HashMap<MessageId, Vec<Message>> = HashMap::new();
    let mut trees = Vec::new();

    for (id, mut message) in working.drain() {
        message.replies.clear();
        match roots.get(&id) {
            Some(root) if *root == id => trees.push(message),
            Some(root) => replies.entry(root.clone()).or_default().push(message),
            None => {}
        }
    }

    for tree in &mut trees {
        if let Some(mut children) = replies.remove(&tree.id) {
            children.sort_by(newest_first);
            tree.replies = children;
        }
    }
    trees
}

fn build_full(mut working: HashMap<MessageId, Message>, view: TreeView) -> Vec<Message> {
    let mut children: HashMap<MessageId, Vec<Message>> = HashMap::new();
    let mut trees = Vec::new();

    for (_, mut message) in working.drain() {
        message.replies.clear();
        let parent = link(&message, view).to_string();
        if parent.is_empty() {
            trees.push(message);
        } else {
            children.entry(parent).or_default().push(message);
        }
    }

    for tree in &mut trees {
        attach(tree, &mut children);
    }
    trees
}

fn attach(node: &mut Message, children: &mut HashMap<MessageId, Vec<Message>>) {
    if let Some(mut direct) = children.remove(&node.id) {
        for child in &mut direct {
            attach(child, children);
        }
        direct.sort_by(newest_first);
        node.replies = direct;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    const TOPIC: &str = "/Proj/chat";

    fn msg(id: &str, at: i64) -> Message {
        Message::new(id, TOPIC, id).created_at(at)
    }

    fn setup(messages: &[Message]) -> Materializer {
        let store = Arc::new(MemoryStore::new());
        for m in messages {
            store.insert_message(m.clone());
        }
        Materializer::new(store)
    }

    fn reply_ids(message: &Message) -> Vec<&str> {
        message.replies.iter().map(|m| m.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_none_is_passthrough() {
        let root = msg("r", 1);
        let reply = msg("m", 2).in_reply_to(&root);
        let tree = setup(&[]);

        let out = tree
            .materialize(vec![reply.clone()], &MessageFilter::new(), TreeView::None)
            .await
            .unwrap();
        assert_eq!(out, vec![reply]);
    }

    #[tokio::test]
    async fn test_one_level_any_order() {
        let root = msg("r", 1);
        let reply = msg("m", 2).in_reply_to(&root);
        let tree = setup(&[root.clone(), reply.clone()]);

        for input in [vec![root.clone(), reply.clone()], vec![reply.clone(), root.clone()]] {
            let out = tree
                .materialize(input, &MessageFilter::new(), TreeView::OneLevel)
                .await
                .unwrap();
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].id, "r");
            assert_eq!(reply_ids(&out[0]), vec!["m"]);
        }
    }

    #[tokio::test]
    async fn test_one_level_flattens_deep_replies() {
        let root = msg("r", 1);
        let a = msg("a", 2).in_reply_to(&root);
        let b = msg("b", 3).in_reply_to(&a);
        let tree = setup(&[root.clone(), a.clone(), b.clone()]);

        let out = tree
            .materialize(vec![root, a, b], &MessageFilter::new(), TreeView::OneLevel)
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(reply_ids(&out[0]), vec!["b", "a"]);
        assert!(out[0].replies.iter().all(|m| m.replies.is_empty()));
    }

    #[tokio::test]
    async fn test_full_nests_by_parent() {
        let root = msg("r", 1);
        let a = msg("a", 2).in_reply_to(&root);
        let b = msg("b", 3).in_reply_to(&a);
        let c = msg("c", 4).in_reply_to(&root);
        let tree = setup(&[root.clone(), a.clone(), b.clone(), c.clone()]);

        let out = tree
            .materialize(vec![b, c, a, root], &MessageFilter::new(), TreeView::Full)
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(reply_ids(&out[0]), vec!["c", "a"]);
        assert_eq!(reply_ids(&out[0].replies[1]), vec!["b"]);
    }

    #[tokio::test]
    async fn test_missing_root_is_refetched_with_siblings() {
        let root = msg("r", 1);
        let reply = msg("m", 2).in_reply_to(&root);
        let sibling = msg("s", 3).in_reply_to(&root);
        let tree = setup(&[root.clone(), reply.clone(), sibling]);

        let out = tree
            .materialize(vec![reply], &MessageFilter::new(), TreeView::OneLevel)
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "r");
        assert_eq!(reply_ids(&out[0]), vec!["s", "m"]);
    }

    #[tokio::test]
    async fn test_excluded_root_drops_subtree() {
        let root = msg("r", 1).with_label("spam", "#f00");
        let reply = msg("m", 2).in_reply_to(&root);
        let other = msg("o", 3);
        let tree = setup(&[root, reply.clone(), other.clone()]);

        let filter = MessageFilter::new().and(Criterion::NotLabel("spam".into()));
        let out = tree
            .materialize(vec![reply, other], &filter, TreeView::OneLevel)
            .await
            .unwrap();
        let ids: Vec<_> = out.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["o"]);
    }

    #[tokio::test]
    async fn test_excluded_parent_drops_nested_subtree() {
        let root = msg("r", 1);
        let a = msg("a", 2).in_reply_to(&root).with_tag("hidden");
        let b = msg("b", 3).in_reply_to(&a);
        let tree = setup(&[root.clone(), a, b.clone()]);

        let filter = MessageFilter::new().and(Criterion::NotTag("hidden".into()));
        let out = tree
            .materialize(vec![root, b], &filter, TreeView::Full)
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].replies.is_empty());
    }

    #[tokio::test]
    async fn test_cycle_in_working_set() {
        let mut a = msg("a", 1);
        let mut b = msg("b", 2);
        a.in_reply_of_id_root = "b".into();
        a.in_reply_of_id = "b".into();
        b.in_reply_of_id_root = "a".into();
        b.in_reply_of_id = "a".into();
        let tree = setup(&[a.clone(), b.clone()]);

        for view in [TreeView::OneLevel, TreeView::Full] {
            match tree.materialize(vec![a.clone(), b.clone()], &MessageFilter::new(), view).await {
                Err(TreeError::CycleDetected { ids, .. }) => assert_eq!(ids, vec!["a", "b"]),
                other => panic!("Expected CycleDetected, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_cycle_found_through_refetch() {
        let mut a = msg("a", 1);
        let mut b = msg("b", 2);
        a.in_reply_of_id_root = "b".into();
        b.in_reply_of_id_root = "a".into();
        let tree = setup(&[a.clone(), b]);

        let result = tree
            .materialize(vec![a], &MessageFilter::new(), TreeView::OneLevel)
            .await;
        assert!(matches!(result, Err(TreeError::CycleDetected { rounds: 2, .. })));
    }

    /// `replies` messages, each pointing at the next as its root, ending
    /// at a real root. Resolving from the first takes `replies + 1` passes.
    fn root_chain(replies: usize) -> Vec<Message> {
        let mut chain: Vec<Message> = (0..=replies).map(|i| msg(&format!("m{i:02}"), i as i64)).collect();
        for i in 0..replies {
            let next = chain[i + 1].id.clone();
            chain[i].in_reply_of_id = next.clone();
            chain[i].in_reply_of_id_root = next;
        }
        chain
    }

    #[tokio::test]
    async fn test_one_level_resolves_in_exactly_25_passes() {
        let chain = root_chain(24);
        let tree = setup(&chain);

        let out = tree
            .materialize(vec![chain[0].clone()], &MessageFilter::new(), TreeView::OneLevel)
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "m24");
        assert_eq!(out[0].replies.len(), 24);
    }

    #[tokio::test]
    async fn test_one_level_needing_26_passes_fails_without_cycle() {
        let chain = root_chain(25);
        let tree = setup(&chain);

        match tree
            .materialize(vec![chain[0].clone()], &MessageFilter::new(), TreeView::OneLevel)
            .await
        {
            Err(TreeError::CycleDetected { rounds, ids }) => {
                assert_eq!(rounds, ONE_LEVEL_MAX_ROUNDS);
                assert_eq!(ids.len(), 25);
            }
            other => panic!("Expected CycleDetected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_full_pass_limit() {
        let ok = root_chain(9);
        let tree = setup(&ok);
        let out = tree
            .materialize(vec![ok[0].clone()], &MessageFilter::new(), TreeView::Full)
            .await
            .unwrap();
        assert_eq!(out[0].id, "m09");

        let too_deep = root_chain(10);
        let tree = setup(&too_deep);
        let result = tree
            .materialize(vec![too_deep[0].clone()], &MessageFilter::new(), TreeView::Full)
            .await;
        assert!(matches!(result, Err(TreeError::CycleDetected { rounds: FULL_MAX_ROUNDS, .. })));
    }

    #[tokio::test]
    async fn test_full_deep_thread_from_its_deepest_reply() {
        let root = msg("r", 0);
        let mut thread = vec![root.clone()];
        for i in 1..=11 {
            let parent = thread[i - 1].clone();
            thread.push(msg(&format!("a{i:02}"), i as i64).in_reply_to(&parent));
        }
        let tree = setup(&thread);

        let out = tree
            .materialize(vec![thread[11].clone()], &MessageFilter::new(), TreeView::Full)
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "r");
        let mut depth = 0;
        let mut node = &out[0];
        while let Some(child) = node.replies.first() {
            assert_eq!(node.replies.len(), 1);
            depth += 1;
            node = child;
        }
        assert_eq!(depth, 11);
        assert_eq!(node.id, "a11");
    }

    #[tokio::test]
    async fn test_thread_of_reply_root() {
        let root = msg("r", 1);
        let a = msg("a", 2).in_reply_to(&root);
        let b = msg("b", 3).in_reply_to(&a);
        let tree = setup(&[root, a, b, msg("x", 4)]);

        let one = tree.thread("r", TreeView::OneLevel).await.unwrap().unwrap();
        assert_eq!(reply_ids(&one), vec!["b", "a"]);

        let full = tree.thread("r", TreeView::Full).await.unwrap().unwrap();
        assert_eq!(reply_ids(&full), vec!["a"]);
        assert_eq!(reply_ids(&full.replies[0]), vec!["b"]);

        assert!(tree.thread("missing", TreeView::Full).await.unwrap().is_none());
    }
}
