//! Ephemeral typing indicators.
//!
//! Typing state is never persisted. A consumer treats a `true` flag as stale
//! once it is older than the configured expiry, so a writer that vanished
//! without clearing its flag stops showing as typing on its own.

use chat_core::{ConversationId, TypingSignal, UserId};
use chrono::Utc;
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct TypingSlot {
    signal: Option<TypingSignal>,
    set_at: Instant,
}

impl TypingSlot {
    fn idle() -> Self {
        Self {
            signal: None,
            set_at: Instant::now(),
        }
    }

    fn is_typing(&self, expiry: Duration) -> bool {
        matches!(&self.signal, Some(s) if s.typing) && self.set_at.elapsed() < expiry
    }
}

pub struct TypingChannel {
    slots: DashMap<(ConversationId, UserId), watch::Sender<TypingSlot>>,
    expiry: Duration,
}

impl TypingChannel {
    pub fn new(expiry: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            expiry,
        }
    }

    /// Records the writer's flag. Returns true when the effective state changed.
    pub fn set_typing(&self, conversation_id: &ConversationId, user_id: &UserId, typing: bool) -> bool {
        let key = (conversation_id.clone(), user_id.clone());
        let slot = TypingSlot {
            signal: Some(TypingSignal {
                conversation_id: conversation_id.clone(),
                user_id: user_id.clone(),
                typing,
                timestamp: Utc::now(),
            }),
            set_at: Instant::now(),
        };

        let changed = {
            let sender = self
                .slots
                .entry(key.clone())
                .or_insert_with(|| watch::channel(TypingSlot::idle()).0);
            let was_typing = sender.borrow().is_typing(self.expiry);
            sender.send_replace(slot);
            was_typing != typing
        };

        if !typing {
            self.slots.remove_if(&key, |_, s| s.receiver_count() == 0);
        }
        changed
    }

    pub fn is_typing(&self, conversation_id: &ConversationId, user_id: &UserId) -> bool {
        self.slots
            .get(&(conversation_id.clone(), user_id.clone()))
            .map(|s| s.borrow().is_typing(self.expiry))
            .unwrap_or(false)
    }

    /// Clears every flag the user holds. Returns the conversations where they showed as typing.
    pub fn clear_user(&self, user_id: &UserId) -> Vec<ConversationId> {
        let held: Vec<ConversationId> = self
            .slots
            .iter()
            .filter(|slot| &slot.key().1 == user_id)
            .map(|slot| slot.key().0.clone())
            .collect();

        held.into_iter()
            .filter(|conversation_id| self.set_typing(conversation_id, user_id, false))
            .collect()
    }

    /// Drops unwatched slots whose flag is no longer effective. Returns how many went.
    pub fn prune(&self) -> usize {
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| slot.receiver_count() > 0 || slot.borrow().is_typing(self.expiry));
        before.saturating_sub(self.slots.len())
    }

    pub fn tracked(&self) -> usize {
        self.slots.len()
    }

    /// Watches one participant's flag in one conversation.
    pub fn subscribe(&self, conversation_id: &ConversationId, user_id: &UserId) -> TypingSubscription {
        let sender = self
            .slots
            .entry((conversation_id.clone(), user_id.clone()))
            .or_insert_with(|| watch::channel(TypingSlot::idle()).0);
        TypingSubscription {
            rx: sender.subscribe(),
            expiry: self.expiry,
            last: None,
        }
    }
}

pub struct TypingSubscription {
    rx: watch::Receiver<TypingSlot>,
    expiry: Duration,
    last: Option<bool>,
}

impl TypingSubscription {
    /// Yields the effective flag each time it changes, starting with the current one.
    /// A `true` older than the expiry is reported as `false` without any new write.
    pub async fn next(&mut self) -> Option<bool> {
        loop {
            let slot = self.rx.borrow_and_update().clone();
            let typing = slot.is_typing(self.expiry);
            if self.last != Some(typing) {
                self.last = Some(typing);
                return Some(typing);
            }

            if typing {
                tokio::select! {
                    changed = self.rx.changed() => changed.ok()?,
                    _ = tokio::time::sleep_until(slot.set_at + self.expiry) => {}
                }
            } else {
                self.rx.changed().await.ok()?;
            }
        }
    }

    pub fn cancel(self) {}
}
