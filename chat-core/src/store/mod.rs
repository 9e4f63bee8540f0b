//! Persistence port for conversations, messages and the participant directory.
//!
//! Two backends implement it: Postgres for deployments and an in-memory store
//! used by tests and single-node development.

mod memory;
mod postgres;

pub use memory::MemoryChatStore;
pub use postgres::PgChatStore;

use async_trait::async_trait;

use crate::error::{ChatError, ChatResult};
use crate::types::{
    Conversation, ConversationId, Message, MessageId, NewMessage, Page, Participant,
    ParticipantProfile, UserId,
};

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Records the latest profile snapshot of a user.
    async fn upsert_profile(&self, participant: &Participant) -> ChatResult<()>;

    async fn find_profile(&self, user_id: &UserId) -> ChatResult<Option<ParticipantProfile>>;

    /// Returns the conversation for the unordered pair, inserting it when missing.
    /// The boolean is true when this call created it. At most one row exists per pair.
    async fn get_or_create_conversation(
        &self,
        a: &Participant,
        b: &Participant,
    ) -> ChatResult<(Conversation, bool)>;

    async fn find_conversation(&self, id: &ConversationId) -> ChatResult<Option<Conversation>>;

    /// All conversations containing the user, most recent first.
    async fn conversations_for(&self, user_id: &UserId) -> ChatResult<Vec<Conversation>>;

    /// Re-snapshots a participant's details into every conversation they belong to.
    async fn refresh_participant(&self, participant: &Participant) -> ChatResult<Vec<Conversation>>;

    /// Appends a message with status `sent` and a store-assigned timestamp.
    async fn insert_message(&self, message: NewMessage) -> ChatResult<Message>;

    /// Denormalizes an appended message into its conversation and increments the recipient's unread counter.
    async fn apply_send(&self, message: &Message) -> ChatResult<Conversation>;

    /// Appends a message and applies it to its conversation as one write.
    ///
    /// The default runs `insert_message` then `apply_send` for stores without
    /// transactions. An `Err` in `Appended::conversation` means the message
    /// is durable but the conversation metadata lags behind it.
    async fn append_message(&self, message: NewMessage) -> ChatResult<Appended> {
        let message = self.insert_message(message).await?;
        let conversation = self.apply_send(&message).await;
        Ok(Appended {
            message,
            conversation,
        })
    }

    /// Messages in ascending store order.
    async fn messages_in(&self, id: &ConversationId, page: Option<Page>) -> ChatResult<Vec<Message>>;

    async fn find_message(&self, id: MessageId) -> ChatResult<Option<Message>>;

    /// Moves a message from `sent` to `delivered`. Returns the message only when it transitioned.
    async fn mark_delivered(&self, id: MessageId) -> ChatResult<Option<Message>>;

    /// Marks every message addressed to `reader` as read and resets their unread counter.
    /// Returns how many messages transitioned.
    async fn mark_read(&self, id: &ConversationId, reader: &UserId) -> ChatResult<u64>;

    /// Recomputes preview fields and unread counters from the message log.
    async fn reconcile_conversation(&self, id: &ConversationId) -> ChatResult<Option<Conversation>>;

    async fn conversation_ids(&self) -> ChatResult<Vec<ConversationId>>;
}

/// Outcome of [`ChatStore::append_message`].
#[derive(Debug)]
pub struct Appended {
    pub message: Message,
    pub conversation: ChatResult<Conversation>,
}

/// Rejects a pair-derived conversation that belongs to another pair.
pub fn ensure_pair(conversation: Conversation, a: &UserId, b: &UserId) -> ChatResult<Conversation> {
    if !conversation.is_between(a, b) {
        return Err(ChatError::InvalidParticipants(format!(
            "conversation {} does not belong to {} and {}",
            conversation.id, a, b
        )));
    }
    Ok(conversation)
}

pub fn sort_by_recency(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| {
        b.last_message_time
            .cmp(&a.last_message_time)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Ascending by timestamp, ties broken by the store-assigned id.
pub fn sort_chronologically(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
}

fn apply_page(messages: Vec<Message>, page: Option<Page>) -> Vec<Message> {
    match page {
        Some(page) => messages
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect(),
        None => messages,
    }
}
