use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{apply_page, ensure_pair, sort_by_recency, Appended, ChatStore};
use crate::error::{ChatError, ChatResult};
use crate::types::{
    Conversation, ConversationId, Message, MessageId, MessageStatus, NewMessage, Page,
    Participant, ParticipantProfile, UserId,
};

#[derive(Default)]
struct MemoryState {
    profiles: HashMap<UserId, ParticipantProfile>,
    conversations: HashMap<ConversationId, Conversation>,
    /// Per-conversation log in append order.
    messages: HashMap<ConversationId, Vec<Message>>,
    message_index: HashMap<MessageId, ConversationId>,
    next_message_id: i64,
}

impl MemoryState {
    fn message_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        let conversation_id = self.message_index.get(&id)?;
        self.messages
            .get_mut(conversation_id)?
            .iter_mut()
            .find(|m| m.id == id)
    }

    fn append(&mut self, message: NewMessage) -> ChatResult<Message> {
        if !self.conversations.contains_key(&message.conversation_id) {
            return Err(ChatError::NotFound(format!("Conversation {}", message.conversation_id)));
        }

        self.next_message_id += 1;
        let id = MessageId(self.next_message_id);

        let log = self.messages.entry(message.conversation_id.clone()).or_default();
        // Store sequencing defines order: never hand out a timestamp older than the tail.
        let now = Utc::now();
        let timestamp = log.last().map_or(now, |tail| tail.timestamp.max(now));

        let stored = Message {
            id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            sender_name: message.sender_name,
            recipient_id: message.recipient_id,
            content: message.content,
            kind: message.kind,
            attachment: message.attachment,
            status: MessageStatus::Sent,
            timestamp,
            delivered_at: None,
            read_at: None,
        };
        log.push(stored.clone());
        self.message_index.insert(id, stored.conversation_id.clone());

        Ok(stored)
    }

    fn apply(&mut self, message: &Message) -> ChatResult<Conversation> {
        let conversation = self
            .conversations
            .get_mut(&message.conversation_id)
            .ok_or_else(|| ChatError::NotFound(format!("Conversation {}", message.conversation_id)))?;
        conversation.record_send(message);
        Ok(conversation.clone())
    }
}

/// Single-lock store: every operation is atomic with respect to the others.
#[derive(Default)]
pub struct MemoryChatStore {
    state: RwLock<MemoryState>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn upsert_profile(&self, participant: &Participant) -> ChatResult<()> {
        let mut state = self.state.write().await;
        state
            .profiles
            .insert(participant.id.clone(), participant.profile.clone());
        Ok(())
    }

    async fn find_profile(&self, user_id: &UserId) -> ChatResult<Option<ParticipantProfile>> {
        Ok(self.state.read().await.profiles.get(user_id).cloned())
    }

    async fn get_or_create_conversation(
        &self,
        a: &Participant,
        b: &Participant,
    ) -> ChatResult<(Conversation, bool)> {
        let conversation = Conversation::between(a, b, Utc::now())?;

        let mut state = self.state.write().await;
        if let Some(existing) = state.conversations.get(&conversation.id) {
            return Ok((ensure_pair(existing.clone(), &a.id, &b.id)?, false));
        }

        state
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        state.messages.entry(conversation.id.clone()).or_default();
        Ok((conversation, true))
    }

    async fn find_conversation(&self, id: &ConversationId) -> ChatResult<Option<Conversation>> {
        Ok(self.state.read().await.conversations.get(id).cloned())
    }

    async fn conversations_for(&self, user_id: &UserId) -> ChatResult<Vec<Conversation>> {
        let state = self.state.read().await;
        let mut conversations: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|c| c.has_participant(user_id))
            .cloned()
            .collect();
        sort_by_recency(&mut conversations);
        Ok(conversations)
    }

    async fn refresh_participant(&self, participant: &Participant) -> ChatResult<Vec<Conversation>> {
        let mut state = self.state.write().await;
        state
            .profiles
            .insert(participant.id.clone(), participant.profile.clone());

        let mut updated = Vec::new();
        for conversation in state.conversations.values_mut() {
            if conversation.has_participant(&participant.id) {
                conversation
                    .participant_details
                    .insert(participant.id.clone(), participant.profile.clone());
                updated.push(conversation.clone());
            }
        }
        Ok(updated)
    }

    async fn insert_message(&self, message: NewMessage) -> ChatResult<Message> {
        message.validate()?;
        self.state.write().await.append(message)
    }

    async fn apply_send(&self, message: &Message) -> ChatResult<Conversation> {
        self.state.write().await.apply(message)
    }

    async fn append_message(&self, message: NewMessage) -> ChatResult<Appended> {
        message.validate()?;
        let mut state = self.state.write().await;
        let message = state.append(message)?;
        let conversation = state.apply(&message);
        Ok(Appended {
            message,
            conversation,
        })
    }

    async fn messages_in(&self, id: &ConversationId, page: Option<Page>) -> ChatResult<Vec<Message>> {
        let state = self.state.read().await;
        let messages = state.messages.get(id).cloned().unwrap_or_default();
        Ok(apply_page(messages, page))
    }

    async fn find_message(&self, id: MessageId) -> ChatResult<Option<Message>> {
        let state = self.state.read().await;
        Ok(state
            .message_index
            .get(&id)
            .and_then(|conversation_id| state.messages.get(conversation_id))
            .and_then(|log| log.iter().find(|m| m.id == id))
            .cloned())
    }

    async fn mark_delivered(&self, id: MessageId) -> ChatResult<Option<Message>> {
        let mut state = self.state.write().await;
        let Some(message) = state.message_mut(id) else {
            return Err(ChatError::NotFound(format!("Message {}", id)));
        };

        if !message.status.can_advance_to(MessageStatus::Delivered) {
            return Ok(None);
        }
        message.status = MessageStatus::Delivered;
        message.delivered_at = Some(Utc::now());
        Ok(Some(message.clone()))
    }

    async fn mark_read(&self, id: &ConversationId, reader: &UserId) -> ChatResult<u64> {
        let mut state = self.state.write().await;
        let conversation = state
            .conversations
            .get_mut(id)
            .ok_or_else(|| ChatError::NotFound(format!("Conversation {}", id)))?;
        conversation.reset_unread(reader);

        let now = Utc::now();
        let mut transitioned = 0;
        if let Some(log) = state.messages.get_mut(id) {
            for message in log
                .iter_mut()
                .filter(|m| &m.recipient_id == reader && m.status != MessageStatus::Read)
            {
                message.status = MessageStatus::Read;
                message.read_at = Some(now);
                transitioned += 1;
            }
        }
        Ok(transitioned)
    }

    async fn reconcile_conversation(&self, id: &ConversationId) -> ChatResult<Option<Conversation>> {
        let mut state = self.state.write().await;
        let messages = state.messages.get(id).cloned().unwrap_or_default();
        let Some(conversation) = state.conversations.get_mut(id) else {
            return Ok(None);
        };
        conversation.reconcile_with(&messages);
        Ok(Some(conversation.clone()))
    }

    async fn conversation_ids(&self) -> ChatResult<Vec<ConversationId>> {
        let mut ids: Vec<ConversationId> = self.state.read().await.conversations.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageKind, UserIdentity, UserRole};
    use std::sync::Arc;

    fn alice() -> Participant {
        Participant::from(&UserIdentity::new("1", "Alice", "alice@example.com", UserRole::User))
    }

    fn bob() -> Participant {
        Participant::from(&UserIdentity::new("2", "Bob", "bob@example.com", UserRole::Employer))
    }

    fn text(conversation: &Conversation, from: &Participant, to: &Participant, content: &str) -> NewMessage {
        NewMessage {
            conversation_id: conversation.id.clone(),
            sender_id: from.id.clone(),
            sender_name: from.profile.name.clone(),
            recipient_id: to.id.clone(),
            content: content.to_string(),
            kind: MessageKind::Text,
            attachment: None,
        }
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let store = MemoryChatStore::new();
        let (first, created) = store.get_or_create_conversation(&alice(), &bob()).await.unwrap();
        let (second, created_again) = store.get_or_create_conversation(&bob(), &alice()).await.unwrap();

        assert!(created);
        assert!(!created_again);
        assert_eq!(first.id, second.id);
        assert_eq!(store.conversation_ids().await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create_converges() {
        let store = Arc::new(MemoryChatStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let (a, b) = if i % 2 == 0 { (alice(), bob()) } else { (bob(), alice()) };
                store.get_or_create_conversation(&a, &b).await.unwrap()
            }));
        }

        let mut created = 0;
        let mut ids = Vec::new();
        for handle in handles {
            let (conversation, was_created) = handle.await.unwrap();
            created += was_created as usize;
            ids.push(conversation.id);
        }

        assert_eq!(created, 1);
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.conversation_ids().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_insert_and_apply_send_denormalizes() {
        let store = MemoryChatStore::new();
        let (conversation, _) = store.get_or_create_conversation(&alice(), &bob()).await.unwrap();

        let message = store.insert_message(text(&conversation, &alice(), &bob(), "Hi Bob")).await.unwrap();
        assert_eq!(message.status, MessageStatus::Sent);

        let updated = store.apply_send(&message).await.unwrap();
        assert_eq!(updated.last_message, "Hi Bob");
        assert_eq!(updated.last_message_sender_id, Some(alice().id));
        assert_eq!(updated.unread_for(&bob().id), 1);
        assert_eq!(updated.unread_for(&alice().id), 0);
    }

    #[tokio::test]
    async fn test_get_or_create_refuses_conversation_of_another_pair() {
        let store = MemoryChatStore::new();
        let carol = Participant::from(&UserIdentity::new("3", "Carol", "carol@example.com", UserRole::User));
        let mut foreign = Conversation::between(&alice(), &carol, Utc::now()).unwrap();
        foreign.id = ConversationId::for_pair(&alice().id, &bob().id);
        store
            .state
            .write()
            .await
            .conversations
            .insert(foreign.id.clone(), foreign);

        let err = store.get_or_create_conversation(&alice(), &bob()).await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidParticipants(_)));
    }

    #[tokio::test]
    async fn test_append_message_applies_send_in_one_write() {
        let store = MemoryChatStore::new();
        let (conversation, _) = store.get_or_create_conversation(&alice(), &bob()).await.unwrap();

        let appended = store.append_message(text(&conversation, &alice(), &bob(), "Hi Bob")).await.unwrap();
        let updated = appended.conversation.unwrap();
        assert_eq!(appended.message.status, MessageStatus::Sent);
        assert_eq!(updated.last_message, "Hi Bob");
        assert_eq!(updated.unread_for(&bob().id), 1);

        let reconciled = store.reconcile_conversation(&conversation.id).await.unwrap().unwrap();
        assert_eq!(reconciled, updated);
    }

    #[tokio::test]
    async fn test_late_apply_keeps_newest_preview() {
        let store = MemoryChatStore::new();
        let (conversation, _) = store.get_or_create_conversation(&alice(), &bob()).await.unwrap();
        let first = store.insert_message(text(&conversation, &alice(), &bob(), "first")).await.unwrap();
        let mut second = store.insert_message(text(&conversation, &alice(), &bob(), "second")).await.unwrap();
        second.timestamp = second.timestamp.max(first.timestamp + chrono::Duration::milliseconds(1));

        store.apply_send(&second).await.unwrap();
        let updated = store.apply_send(&first).await.unwrap();

        assert_eq!(updated.last_message, "second");
        assert_eq!(updated.unread_for(&bob().id), 2);
    }

    #[tokio::test]
    async fn test_insert_into_unknown_conversation_fails() {
        let store = MemoryChatStore::new();
        let ghost = Conversation::between(&alice(), &bob(), Utc::now()).unwrap();
        let err = store.insert_message(text(&ghost, &alice(), &bob(), "hello")).await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_messages_are_ordered_and_paged() {
        let store = MemoryChatStore::new();
        let (conversation, _) = store.get_or_create_conversation(&alice(), &bob()).await.unwrap();
        for i in 0..5 {
            store
                .insert_message(text(&conversation, &alice(), &bob(), &format!("m{}", i)))
                .await
                .unwrap();
        }

        let all = store.messages_in(&conversation.id, None).await.unwrap();
        assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp && w[0].id < w[1].id));

        let page = store
            .messages_in(&conversation.id, Some(Page { limit: 2, offset: 1 }))
            .await
            .unwrap();
        let contents: Vec<&str> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn test_mark_read_is_idempotent_and_never_regresses() {
        let store = MemoryChatStore::new();
        let (conversation, _) = store.get_or_create_conversation(&alice(), &bob()).await.unwrap();
        let first = store.insert_message(text(&conversation, &alice(), &bob(), "one")).await.unwrap();
        store.apply_send(&first).await.unwrap();
        let reply = store.insert_message(text(&conversation, &bob(), &alice(), "two")).await.unwrap();
        store.apply_send(&reply).await.unwrap();

        assert_eq!(store.mark_read(&conversation.id, &bob().id).await.unwrap(), 1);
        assert_eq!(store.mark_read(&conversation.id, &bob().id).await.unwrap(), 0);

        let messages = store.messages_in(&conversation.id, None).await.unwrap();
        assert_eq!(messages[0].status, MessageStatus::Read);
        assert_eq!(messages[1].status, MessageStatus::Sent);

        // read never moves back to delivered
        assert!(store.mark_delivered(first.id).await.unwrap().is_none());
        let conversation = store.find_conversation(&conversation.id).await.unwrap().unwrap();
        assert_eq!(conversation.unread_for(&bob().id), 0);
        assert_eq!(conversation.unread_for(&alice().id), 1);
    }

    #[tokio::test]
    async fn test_reconcile_repairs_skipped_metadata() {
        let store = MemoryChatStore::new();
        let (conversation, _) = store.get_or_create_conversation(&alice(), &bob()).await.unwrap();
        store.insert_message(text(&conversation, &alice(), &bob(), "lost update")).await.unwrap();

        let stale = store.find_conversation(&conversation.id).await.unwrap().unwrap();
        assert_eq!(stale.last_message, "");

        let repaired = store.reconcile_conversation(&conversation.id).await.unwrap().unwrap();
        assert_eq!(repaired.last_message, "lost update");
        assert_eq!(repaired.unread_for(&bob().id), 1);
    }

    #[tokio::test]
    async fn test_refresh_participant_updates_details() {
        let store = MemoryChatStore::new();
        store.get_or_create_conversation(&alice(), &bob()).await.unwrap();

        let mut renamed = bob();
        renamed.profile.name = "Robert".to_string();
        renamed.profile.company_name = Some("Acme".to_string());
        let updated = store.refresh_participant(&renamed).await.unwrap();

        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].participant_details[&bob().id].name, "Robert");
        assert_eq!(store.find_profile(&bob().id).await.unwrap().unwrap().name, "Robert");
    }
}
