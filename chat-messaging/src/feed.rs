//! Change feed: full-snapshot subscriptions over conversation lists and message logs.

use chat_core::{Conversation, ConversationId, Message, UserId};
use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// A lazy sequence of full snapshots.
///
/// The first `next()` yields the current snapshot; later calls wait for the
/// next change. Intermediate snapshots may be skipped, never reordered.
/// Dropping or cancelling releases the underlying listener.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: watch::Receiver<T>,
    primed: bool,
}

impl<T: Clone> Subscription<T> {
    pub(crate) fn new(rx: watch::Receiver<T>) -> Self {
        Self { rx, primed: false }
    }

    /// Latest snapshot without waiting.
    pub fn current(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Next snapshot, or `None` once the publisher is gone.
    pub async fn next(&mut self) -> Option<T> {
        if !self.primed {
            self.primed = true;
            return Some(self.rx.borrow_and_update().clone());
        }
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    pub fn cancel(self) {}
}

struct Topic<T> {
    tx: watch::Sender<T>,
    /// Held across load-and-send so snapshots reach the channel in load order.
    loading: Mutex<()>,
}

struct Topics<K, T> {
    topics: DashMap<K, Arc<Topic<T>>>,
}

impl<K: Eq + Hash + Clone, T: Clone + Default> Topics<K, T> {
    fn new() -> Self {
        Self {
            topics: DashMap::new(),
        }
    }

    /// Registers a listener before loading, so a change that lands after the
    /// load is refreshed into the channel by its publisher.
    async fn subscribe<F, Fut, E>(&self, key: &K, load: F) -> Result<Subscription<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let (topic, rx) = {
            let entry = self.topics.entry(key.clone()).or_insert_with(|| {
                Arc::new(Topic {
                    tx: watch::channel(T::default()).0,
                    loading: Mutex::new(()),
                })
            });
            let rx = entry.tx.subscribe();
            (Arc::clone(&entry), rx)
        };

        let _loading = topic.loading.lock().await;
        let snapshot = load().await?;
        topic.tx.send_replace(snapshot);
        Ok(Subscription::new(rx))
    }

    fn is_watched(&self, key: &K) -> bool {
        self.topics
            .get(key)
            .map(|t| t.tx.receiver_count() > 0)
            .unwrap_or(false)
    }

    /// Loads a fresh snapshot and sends it when anyone listens.
    async fn refresh<F, Fut, E>(&self, key: &K, load: F) -> Result<bool, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(topic) = self.topics.get(key).map(|t| Arc::clone(&t)) else {
            return Ok(false);
        };
        if topic.tx.receiver_count() == 0 {
            self.topics.remove_if(key, |_, t| t.tx.receiver_count() == 0);
            return Ok(false);
        }

        let _loading = topic.loading.lock().await;
        let snapshot = load().await?;
        topic.tx.send_replace(snapshot);
        Ok(true)
    }

    fn watched_keys(&self) -> usize {
        self.topics.iter().filter(|t| t.tx.receiver_count() > 0).count()
    }
}

/// Per-user conversation lists and per-conversation message logs.
///
/// Callers hand in a loader rather than a snapshot: loads for one topic are
/// serialized with their sends, so listeners never observe an older snapshot
/// after a newer one.
pub struct ChangeFeed {
    conversations: Topics<UserId, Vec<Conversation>>,
    messages: Topics<ConversationId, Vec<Message>>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self {
            conversations: Topics::new(),
            messages: Topics::new(),
        }
    }

    pub async fn subscribe_conversations<F, Fut, E>(
        &self,
        user_id: &UserId,
        load: F,
    ) -> Result<Subscription<Vec<Conversation>>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Conversation>, E>>,
    {
        self.conversations.subscribe(user_id, load).await
    }

    pub async fn subscribe_messages<F, Fut, E>(
        &self,
        conversation_id: &ConversationId,
        load: F,
    ) -> Result<Subscription<Vec<Message>>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Message>, E>>,
    {
        self.messages.subscribe(conversation_id, load).await
    }

    pub fn watches_conversations(&self, user_id: &UserId) -> bool {
        self.conversations.is_watched(user_id)
    }

    pub fn watches_messages(&self, conversation_id: &ConversationId) -> bool {
        self.messages.is_watched(conversation_id)
    }

    pub async fn refresh_conversations<F, Fut, E>(&self, user_id: &UserId, load: F) -> Result<bool, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Conversation>, E>>,
    {
        self.conversations.refresh(user_id, load).await
    }

    pub async fn refresh_messages<F, Fut, E>(
        &self,
        conversation_id: &ConversationId,
        load: F,
    ) -> Result<bool, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Message>, E>>,
    {
        self.messages.refresh(conversation_id, load).await
    }

    /// Number of live listeners across both topic kinds.
    pub fn active_topics(&self) -> usize {
        self.conversations.watched_keys() + self.messages.watched_keys()
    }
}
