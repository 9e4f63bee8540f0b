//! Store doubles shared by the unit tests.

use async_trait::async_trait;
use chat_core::store::MemoryChatStore;
use chat_core::{
    ChatError, ChatResult, ChatStore, Conversation, ConversationId, Message, MessageId,
    NewMessage, Page, Participant, ParticipantProfile, UserId,
};
use std::sync::atomic::{AtomicBool, Ordering};

/// Memory store whose metadata update can be made to fail.
pub(crate) struct FlakyStore {
    inner: MemoryChatStore,
    pub fail_apply: AtomicBool,
    pub fail_reconcile: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryChatStore::new(),
            fail_apply: AtomicBool::new(false),
            fail_reconcile: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ChatStore for FlakyStore {
    async fn upsert_profile(&self, participant: &Participant) -> ChatResult<()> {
        self.inner.upsert_profile(participant).await
    }
    async fn find_profile(&self, user_id: &UserId) -> ChatResult<Option<ParticipantProfile>> {
        self.inner.find_profile(user_id).await
    }
    async fn get_or_create_conversation(
        &self,
        a: &Participant,
        b: &Participant,
    ) -> ChatResult<(Conversation, bool)> {
        self.inner.get_or_create_conversation(a, b).await
    }
    async fn find_conversation(&self, id: &ConversationId) -> ChatResult<Option<Conversation>> {
        self.inner.find_conversation(id).await
    }
    async fn conversations_for(&self, user_id: &UserId) -> ChatResult<Vec<Conversation>> {
        self.inner.conversations_for(user_id).await
    }
    async fn refresh_participant(&self, participant: &Participant) -> ChatResult<Vec<Conversation>> {
        self.inner.refresh_participant(participant).await
    }
    async fn insert_message(&self, message: NewMessage) -> ChatResult<Message> {
        self.inner.insert_message(message).await
    }
    async fn apply_send(&self, message: &Message) -> ChatResult<Conversation> {
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(ChatError::TransportUnavailable("conversation write dropped".to_string()));
        }
        self.inner.apply_send(message).await
    }
    async fn messages_in(&self, id: &ConversationId, page: Option<Page>) -> ChatResult<Vec<Message>> {
        self.inner.messages_in(id, page).await
    }
    async fn find_message(&self, id: MessageId) -> ChatResult<Option<Message>> {
        self.inner.find_message(id).await
    }
    async fn mark_delivered(&self, id: MessageId) -> ChatResult<Option<Message>> {
        self.inner.mark_delivered(id).await
    }
    async fn mark_read(&self, id: &ConversationId, reader: &UserId) -> ChatResult<u64> {
        self.inner.mark_read(id, reader).await
    }
    async fn reconcile_conversation(&self, id: &ConversationId) -> ChatResult<Option<Conversation>> {
        if self.fail_reconcile.load(Ordering::SeqCst) {
            return Err(ChatError::TransportUnavailable("store offline".to_string()));
        }
        self.inner.reconcile_conversation(id).await
    }
    async fn conversation_ids(&self) -> ChatResult<Vec<ConversationId>> {
        self.inner.conversation_ids().await
    }
}
