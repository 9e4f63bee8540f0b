//! Per-user online presence with disconnect cleanup.
//!
//! A user is online while at least one connection holds a [`PresenceGuard`].
//! Dropping the last guard marks them offline even when the connection died
//! without an explicit close.

use chat_core::redis::{get_connection, write_presence};
use chat_core::{PresenceRecord, PresenceState, RedisPool, UserId};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::events::ChatEvent;
use crate::feed::Subscription;
use crate::transport::Transport;

struct PresenceEntry {
    connections: usize,
    record: watch::Sender<PresenceRecord>,
}

pub struct PresenceTracker {
    entries: DashMap<UserId, PresenceEntry>,
    transport: Arc<dyn Transport>,
    mirror: Option<mpsc::UnboundedSender<PresenceRecord>>,
}

impl PresenceTracker {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            entries: DashMap::new(),
            transport,
            mirror: None,
        }
    }

    /// Also forwards every transition to `mirror`, typically [`spawn_redis_mirror`].
    pub fn with_mirror(mut self, mirror: mpsc::UnboundedSender<PresenceRecord>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Marks the user online for the lifetime of the returned guard.
    pub fn setup_presence(self: &Arc<Self>, user_id: &UserId) -> PresenceGuard {
        let came_online = {
            let mut entry = self
                .entries
                .entry(user_id.clone())
                .or_insert_with(|| PresenceEntry {
                    connections: 0,
                    record: watch::channel(offline(user_id)).0,
                });
            entry.connections += 1;
            if entry.connections == 1 {
                let record = PresenceRecord {
                    user_id: user_id.clone(),
                    state: PresenceState::Online,
                    last_changed: Utc::now(),
                };
                entry.record.send_replace(record.clone());
                Some(record)
            } else {
                None
            }
        };

        if let Some(record) = came_online {
            tracing::info!("User {} is online", user_id);
            self.announce(record);
        }

        PresenceGuard {
            tracker: Arc::clone(self),
            user_id: user_id.clone(),
            released: false,
        }
    }

    fn release(&self, user_id: &UserId) -> Option<PresenceRecord> {
        let went_offline = {
            let mut entry = self.entries.get_mut(user_id)?;
            entry.connections = entry.connections.saturating_sub(1);
            if entry.connections == 0 {
                let record = offline(user_id);
                entry.record.send_replace(record.clone());
                Some(record)
            } else {
                None
            }
        };

        if let Some(record) = &went_offline {
            tracing::info!("User {} is offline", user_id);
            self.entries
                .remove_if(user_id, |_, e| e.connections == 0 && e.record.receiver_count() == 0);
            self.announce(record.clone());
        }
        went_offline
    }

    fn announce(&self, record: PresenceRecord) {
        let event = match record.state {
            PresenceState::Online => ChatEvent::UserOnline {
                user_id: record.user_id.clone(),
            },
            PresenceState::Offline => ChatEvent::UserOffline {
                user_id: record.user_id.clone(),
            },
        };
        self.transport.broadcast(&event, &record.user_id);

        if let Some(mirror) = &self.mirror {
            if mirror.send(record).is_err() {
                tracing::warn!("Presence mirror has stopped; dropping update");
            }
        }
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.entries
            .get(user_id)
            .map(|e| e.connections > 0)
            .unwrap_or(false)
    }

    pub fn record(&self, user_id: &UserId) -> Option<PresenceRecord> {
        self.entries.get(user_id).map(|e| e.record.borrow().clone())
    }

    pub fn subscribe_to_presence(&self, user_id: &UserId) -> Subscription<PresenceRecord> {
        let entry = self
            .entries
            .entry(user_id.clone())
            .or_insert_with(|| PresenceEntry {
                connections: 0,
                record: watch::channel(offline(user_id)).0,
            });
        Subscription::new(entry.record.subscribe())
    }
}

fn offline(user_id: &UserId) -> PresenceRecord {
    PresenceRecord {
        user_id: user_id.clone(),
        state: PresenceState::Offline,
        last_changed: Utc::now(),
    }
}

/// Keeps its user online until closed or dropped.
pub struct PresenceGuard {
    tracker: Arc<PresenceTracker>,
    user_id: UserId,
    released: bool,
}

impl PresenceGuard {
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Releases this connection's hold. Returns the offline record when it was the last one.
    pub fn close(mut self) -> Option<PresenceRecord> {
        self.released = true;
        self.tracker.release(&self.user_id)
    }
}

impl Drop for PresenceGuard {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            tracing::debug!("Presence guard for {} dropped without close", self.user_id);
            self.tracker.release(&self.user_id);
        }
    }
}

/// Spawns a task that writes presence transitions to Redis under `PRESENCE:{user_id}`.
pub fn spawn_redis_mirror(pool: RedisPool) -> mpsc::UnboundedSender<PresenceRecord> {
    let (tx, mut rx) = mpsc::unbounded_channel::<PresenceRecord>();

    tokio::spawn(async move {
        tracing::info!("Starting presence mirror");
        while let Some(record) = rx.recv().await {
            let result = async {
                let mut conn = get_connection(&pool).await?;
                write_presence(&mut conn, &record).await
            }
            .await;

            if let Err(e) = result {
                tracing::warn!("Failed to mirror presence for {}: {}", record.user_id, e);
            }
        }
        tracing::info!("Presence mirror stopped");
    });

    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ConnectionHub;

    fn tracker() -> (Arc<PresenceTracker>, Arc<ConnectionHub>) {
        let hub = Arc::new(ConnectionHub::new());
        (Arc::new(PresenceTracker::new(hub.clone())), hub)
    }

    #[tokio::test]
    async fn test_online_until_last_connection_closes() {
        let (tracker, _) = tracker();
        let user = UserId::from("1");

        let first = tracker.setup_presence(&user);
        let second = tracker.setup_presence(&user);
        assert!(tracker.is_online(&user));

        assert!(first.close().is_none());
        assert!(tracker.is_online(&user));

        let record = second.close().expect("last close reports offline");
        assert_eq!(record.state, PresenceState::Offline);
        assert!(!tracker.is_online(&user));
    }

    #[tokio::test]
    async fn test_drop_marks_offline() {
        let (tracker, _) = tracker();
        let user = UserId::from("1");
        let mut sub = tracker.subscribe_to_presence(&user);
        assert_eq!(sub.next().await.map(|r| r.state), Some(PresenceState::Offline));

        let guard = tracker.setup_presence(&user);
        assert_eq!(sub.next().await.map(|r| r.state), Some(PresenceState::Online));

        drop(guard);
        assert_eq!(sub.next().await.map(|r| r.state), Some(PresenceState::Offline));
        assert_eq!(tracker.record(&user).map(|r| r.state), Some(PresenceState::Offline));
    }

    #[tokio::test]
    async fn test_transitions_are_broadcast_to_others() {
        let (tracker, hub) = tracker();
        let (_, mut watcher) = hub.register(&UserId::from("2"));

        let guard = tracker.setup_presence(&UserId::from("1"));
        assert_eq!(
            watcher.recv().await,
            Some(ChatEvent::UserOnline { user_id: UserId::from("1") })
        );

        guard.close();
        assert_eq!(
            watcher.recv().await,
            Some(ChatEvent::UserOffline { user_id: UserId::from("1") })
        );
    }

    #[tokio::test]
    async fn test_mirror_receives_transitions() {
        let hub = Arc::new(ConnectionHub::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = Arc::new(PresenceTracker::new(hub).with_mirror(tx));

        let guard = tracker.setup_presence(&UserId::from("5"));
        assert!(rx.recv().await.map(|r| r.is_online()).unwrap_or(false));
        drop(guard);
        assert!(!rx.recv().await.map(|r| r.is_online()).unwrap_or(true));
    }
}
