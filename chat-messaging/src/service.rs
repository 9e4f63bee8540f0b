use chat_core::{
    Attachment, ChatContext, ChatError, ChatResult, ChatStore, Conversation, ConversationId,
    Message, MessageId, MessageKind, MessagingConfig, NewMessage, Page, Participant,
    ParticipantProfile, PresenceRecord, UserId, UserIdentity,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use crate::events::ChatEvent;
use crate::feed::{ChangeFeed, Subscription};
use crate::presence::{spawn_redis_mirror, PresenceGuard, PresenceTracker};
use crate::transport::{Delivery, Transport};
use crate::typing::{TypingChannel, TypingSubscription};

pub const MAX_PAGE_LIMIT: u32 = 200;

/// Body of an outgoing message before it is addressed to a conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDraft {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub attachment: Option<Attachment>,
}

impl MessageDraft {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> ChatResult<()> {
        if self.content.trim().is_empty() && self.attachment.is_none() {
            return Err(ChatError::InvalidMessage);
        }
        Ok(())
    }
}

/// Orchestrates the stores, the live transport, typing and presence.
///
/// Every operation is keyed by the caller's own identity and checks that the
/// caller participates in the conversation it touches. Cloning is cheap.
#[derive(Clone)]
pub struct MessagingService {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: ChatContext,
    transport: Arc<dyn Transport>,
    feed: ChangeFeed,
    typing: TypingChannel,
    presence: Arc<PresenceTracker>,
}

impl MessagingService {
    pub fn new(ctx: ChatContext, transport: Arc<dyn Transport>) -> Self {
        let mut presence = PresenceTracker::new(Arc::clone(&transport));
        if let Some(pool) = &ctx.redis_pool {
            presence = presence.with_mirror(spawn_redis_mirror(Arc::clone(pool)));
        }
        let typing = TypingChannel::new(ctx.config.messaging.typing_expiry());

        Self {
            inner: Arc::new(Inner {
                ctx,
                transport,
                feed: ChangeFeed::new(),
                typing,
                presence: Arc::new(presence),
            }),
        }
    }

    pub fn context(&self) -> &ChatContext {
        &self.inner.ctx
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.inner.ctx.config.messaging
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.inner.feed
    }

    fn store(&self) -> &dyn ChatStore {
        self.inner.ctx.store.as_ref()
    }

    /// Bounds a store call by the configured operation timeout.
    async fn guarded<T, F>(&self, op: &'static str, fut: F) -> ChatResult<T>
    where
        F: Future<Output = ChatResult<T>>,
    {
        let limit = self.config().operation_timeout();
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("{} timed out after {:?}", op, limit);
                Err(ChatError::Timeout(limit))
            }
        }
    }

    /// Refreshes the caller's directory entry and marks them online until the guard is released.
    pub async fn connect(&self, user: &UserIdentity) -> ChatResult<PresenceGuard> {
        self.sync_profile(user).await?;
        Ok(self.inner.presence.setup_presence(&user.id))
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.inner.presence.is_online(user_id)
    }

    pub fn presence_of(&self, user_id: &UserId) -> Option<PresenceRecord> {
        self.inner.presence.record(user_id)
    }

    pub fn subscribe_to_presence(&self, user_id: &UserId) -> Subscription<PresenceRecord> {
        self.inner.presence.subscribe_to_presence(user_id)
    }

    async fn sync_profile(&self, user: &UserIdentity) -> ChatResult<()> {
        let stored = self
            .guarded("find_profile", self.store().find_profile(&user.id))
            .await?;

        match stored {
            None => {
                self.guarded(
                    "upsert_profile",
                    self.store().upsert_profile(&Participant::from(user)),
                )
                .await
            }
            Some(profile)
                if profile.name != user.name
                    || profile.email != user.email
                    || profile.role != user.role =>
            {
                let mut refreshed = profile;
                refreshed.name = user.name.clone();
                refreshed.email = user.email.clone();
                refreshed.role = user.role;
                self.update_profile(&Participant {
                    id: user.id.clone(),
                    profile: refreshed,
                })
                .await
                .map(|_| ())
            }
            Some(_) => Ok(()),
        }
    }

    pub async fn profile(&self, user_id: &UserId) -> ChatResult<Option<ParticipantProfile>> {
        self.guarded("find_profile", self.store().find_profile(user_id))
            .await
    }

    /// Stores a new profile snapshot and copies it into every conversation the user is in.
    pub async fn update_profile(&self, participant: &Participant) -> ChatResult<usize> {
        self.guarded("upsert_profile", self.store().upsert_profile(participant))
            .await?;
        let updated = self
            .guarded(
                "refresh_participant",
                self.store().refresh_participant(participant),
            )
            .await?;

        let mut affected = BTreeSet::new();
        affected.insert(participant.id.clone());
        for conversation in &updated {
            affected.extend(conversation.participant_ids.iter().cloned());
            self.push_previews(conversation);
        }
        self.publish_lists(affected.iter()).await;

        tracing::debug!(
            "Refreshed profile of {} in {} conversations",
            participant.id,
            updated.len()
        );
        Ok(updated.len())
    }

    pub async fn get_or_create_conversation(
        &self,
        caller: &Participant,
        other: &Participant,
    ) -> ChatResult<Conversation> {
        if caller.id == other.id {
            return Err(ChatError::InvalidParticipants(
                "cannot start a conversation with yourself".to_string(),
            ));
        }

        let (conversation, created) = self
            .guarded(
                "get_or_create_conversation",
                self.store().get_or_create_conversation(caller, other),
            )
            .await?;

        if !conversation.is_between(&caller.id, &other.id) {
            tracing::error!(
                "Conversation {} resolved for {} and {} belongs to another pair",
                conversation.id,
                caller.id,
                other.id
            );
            return Err(ChatError::InvalidParticipants(format!(
                "conversation {} belongs to another pair",
                conversation.id
            )));
        }

        if created {
            tracing::info!(
                "Created conversation {} between {} and {}",
                conversation.id,
                caller.id,
                other.id
            );
            self.publish_lists(conversation.participant_ids.iter()).await;
            self.push_previews(&conversation);
        }
        Ok(conversation)
    }

    /// Resolves the other user from the directory and gets or creates the pair's conversation.
    pub async fn start_conversation_with(
        &self,
        caller: &UserIdentity,
        other_id: &UserId,
    ) -> ChatResult<Conversation> {
        if &caller.id == other_id {
            return Err(ChatError::InvalidParticipants(
                "cannot start a conversation with yourself".to_string(),
            ));
        }

        let other = self
            .guarded("find_profile", self.store().find_profile(other_id))
            .await?
            .map(|profile| Participant {
                id: other_id.clone(),
                profile,
            })
            .ok_or_else(|| ChatError::NotFound(format!("User {}", other_id)))?;

        let me = match self
            .guarded("find_profile", self.store().find_profile(&caller.id))
            .await?
        {
            Some(profile) => Participant {
                id: caller.id.clone(),
                profile,
            },
            None => Participant::from(caller),
        };

        self.get_or_create_conversation(&me, &other).await
    }

    /// Loads a conversation the caller participates in.
    pub async fn conversation_for(
        &self,
        caller: &UserId,
        id: &ConversationId,
    ) -> ChatResult<Conversation> {
        let conversation = self
            .guarded("find_conversation", self.store().find_conversation(id))
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("Conversation {}", id)))?;

        if !conversation.has_participant(caller) {
            tracing::warn!("User {} denied access to conversation {}", caller, id);
            return Err(ChatError::ParticipantMismatch {
                conversation: id.clone(),
                user: caller.clone(),
            });
        }
        Ok(conversation)
    }

    pub async fn list_conversations(&self, user_id: &UserId) -> ChatResult<Vec<Conversation>> {
        self.guarded("conversations_for", self.store().conversations_for(user_id))
            .await
    }

    /// The caller's conversation list as previews, with the partner's online flag.
    pub async fn conversation_previews(
        &self,
        user_id: &UserId,
    ) -> ChatResult<Vec<chat_core::ConversationPreview>> {
        let conversations = self.list_conversations(user_id).await?;
        Ok(conversations
            .iter()
            .filter_map(|c| {
                let other = c.other_participant(user_id)?;
                c.preview_for(user_id, self.is_online(other))
            })
            .collect())
    }

    pub async fn subscribe_conversations(
        &self,
        user_id: &UserId,
    ) -> ChatResult<Subscription<Vec<Conversation>>> {
        self.inner
            .feed
            .subscribe_conversations(user_id, || self.list_conversations(user_id))
            .await
    }

    pub async fn list_messages(
        &self,
        caller: &UserId,
        id: &ConversationId,
        page: Option<Page>,
    ) -> ChatResult<Vec<Message>> {
        self.conversation_for(caller, id).await?;
        let page = page.map(|p| Page {
            limit: p.limit.clamp(1, MAX_PAGE_LIMIT),
            offset: p.offset,
        });
        self.guarded("messages_in", self.store().messages_in(id, page))
            .await
    }

    /// Marks the conversation read for the caller, then returns its messages.
    pub async fn open_conversation(
        &self,
        caller: &UserId,
        id: &ConversationId,
        page: Option<Page>,
    ) -> ChatResult<Vec<Message>> {
        self.mark_read(caller, id).await?;
        self.list_messages(caller, id, page).await
    }

    pub async fn subscribe_messages(
        &self,
        caller: &UserId,
        id: &ConversationId,
    ) -> ChatResult<Subscription<Vec<Message>>> {
        self.conversation_for(caller, id).await?;
        self.inner
            .feed
            .subscribe_messages(id, || {
                self.guarded("messages_in", self.store().messages_in(id, None))
            })
            .await
    }

    /// Appends a message from `caller` to the other participant of `id`.
    pub async fn send_message(
        &self,
        caller: &UserIdentity,
        id: &ConversationId,
        draft: MessageDraft,
    ) -> ChatResult<Message> {
        draft.validate()?;

        let conversation = self.conversation_for(&caller.id, id).await?;
        let recipient = conversation
            .other_participant(&caller.id)
            .cloned()
            .ok_or_else(|| ChatError::InvalidParticipants(format!("conversation {} has no partner", id)))?;

        let new_message = NewMessage {
            conversation_id: id.clone(),
            sender_id: caller.id.clone(),
            sender_name: caller.name.clone(),
            recipient_id: recipient.clone(),
            content: draft.content,
            kind: draft.kind,
            attachment: draft.attachment,
        };
        new_message.validate()?;

        let appended = self
            .guarded("append_message", self.store().append_message(new_message))
            .await?;
        let mut message = appended.message;

        let conversation = match appended.conversation {
            Ok(conversation) => conversation,
            Err(e) => self.repair_after_send(id, message.id, e).await?,
        };

        self.clear_typing(&caller.id, id, &recipient);

        self.inner
            .transport
            .push(&caller.id, &ChatEvent::MessageSent(message.clone()));
        let delivery = self
            .inner
            .transport
            .push(&recipient, &ChatEvent::NewMessage(message.clone()));

        if delivery == Delivery::Live && self.inner.transport.acknowledges_delivery() {
            match self.acknowledge_delivery(message.id).await {
                Ok(Some(delivered)) => message = delivered,
                Ok(None) => {}
                Err(e) => tracing::warn!("Failed to mark message {} delivered: {}", message.id, e),
            }
        }

        self.publish_messages(id).await;
        self.publish_lists(conversation.participant_ids.iter()).await;
        self.push_previews(&conversation);

        tracing::debug!("Message {} sent in conversation {}", message.id, id);
        Ok(message)
    }

    /// Sends to a user by id, creating the conversation when needed.
    pub async fn send_to_user(
        &self,
        caller: &UserIdentity,
        recipient_id: &UserId,
        draft: MessageDraft,
    ) -> ChatResult<Message> {
        draft.validate()?;
        let conversation = self.start_conversation_with(caller, recipient_id).await?;
        self.send_message(caller, &conversation.id, draft).await
    }

    async fn repair_after_send(
        &self,
        id: &ConversationId,
        message_id: MessageId,
        cause: ChatError,
    ) -> ChatResult<Conversation> {
        tracing::warn!(
            "Message {} stored but conversation {} was not updated: {}; reconciling",
            message_id,
            id,
            cause
        );
        match self
            .guarded("reconcile_conversation", self.store().reconcile_conversation(id))
            .await
        {
            Ok(Some(conversation)) => Ok(conversation),
            Ok(None) | Err(_) => {
                tracing::error!(
                    "Conversation {} is inconsistent with message {} until the next sweep",
                    id,
                    message_id
                );
                self.publish_messages(id).await;
                Err(ChatError::PartialWriteInconsistency {
                    conversation: id.clone(),
                    message_id,
                })
            }
        }
    }

    async fn acknowledge_delivery(&self, message_id: MessageId) -> ChatResult<Option<Message>> {
        let delivered = self
            .guarded("mark_delivered", self.store().mark_delivered(message_id))
            .await?;
        if let Some(message) = &delivered {
            self.inner.transport.push(
                &message.sender_id,
                &ChatEvent::MessageDelivered {
                    conversation_id: message.conversation_id.clone(),
                    message_id: message.id,
                },
            );
        }
        Ok(delivered)
    }

    /// Explicit delivery acknowledgment from the recipient's client.
    pub async fn mark_delivered(
        &self,
        caller: &UserId,
        message_id: MessageId,
    ) -> ChatResult<Option<Message>> {
        let message = self
            .guarded("find_message", self.store().find_message(message_id))
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("Message {}", message_id)))?;
        if &message.recipient_id != caller {
            return Err(ChatError::ParticipantMismatch {
                conversation: message.conversation_id,
                user: caller.clone(),
            });
        }

        let delivered = self.acknowledge_delivery(message_id).await?;
        if delivered.is_some() {
            self.publish_messages(&message.conversation_id).await;
        }
        Ok(delivered)
    }

    /// Marks everything addressed to the caller as read and zeroes their unread counter.
    pub async fn mark_read(&self, caller: &UserId, id: &ConversationId) -> ChatResult<u64> {
        let conversation = self.conversation_for(caller, id).await?;
        let had_unread = conversation.unread_for(caller) > 0;

        let transitioned = self
            .guarded("mark_read", self.store().mark_read(id, caller))
            .await?;

        if transitioned > 0 || had_unread {
            self.publish_messages(id).await;
            self.publish_lists(conversation.participant_ids.iter()).await;

            if let Some(partner) = conversation.other_participant(caller) {
                self.inner.transport.push(
                    partner,
                    &ChatEvent::MessagesRead {
                        conversation_id: id.clone(),
                        read_by: caller.clone(),
                    },
                );
                let mut read = conversation.clone();
                read.reset_unread(caller);
                if let Some(preview) = read.preview_for(caller, self.is_online(partner)) {
                    self.inner
                        .transport
                        .push(caller, &ChatEvent::ConversationUpdated(preview));
                }
            }
            tracing::debug!("User {} read {} messages in {}", caller, transitioned, id);
        }
        Ok(transitioned)
    }

    pub async fn set_typing(
        &self,
        caller: &UserId,
        id: &ConversationId,
        typing: bool,
    ) -> ChatResult<()> {
        let conversation = self.conversation_for(caller, id).await?;
        if self.inner.typing.set_typing(id, caller, typing) {
            if let Some(partner) = conversation.other_participant(caller) {
                self.inner
                    .transport
                    .push(partner, &ChatEvent::typing(id, caller, typing));
            }
        }
        Ok(())
    }

    fn clear_typing(&self, caller: &UserId, id: &ConversationId, partner: &UserId) {
        if self.inner.typing.set_typing(id, caller, false) {
            self.inner
                .transport
                .push(partner, &ChatEvent::typing(id, caller, false));
        }
    }

    /// Clears whatever the user left flagged as typing and tells each partner.
    /// Called when the user's last connection goes away.
    pub async fn clear_typing_of(&self, user_id: &UserId) {
        for id in self.inner.typing.clear_user(user_id) {
            match self
                .guarded("find_conversation", self.store().find_conversation(&id))
                .await
            {
                Ok(Some(conversation)) => {
                    if let Some(partner) = conversation.other_participant(user_id) {
                        self.inner
                            .transport
                            .push(partner, &ChatEvent::typing(&id, user_id, false));
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::debug!("Failed to announce typing stop in {}: {}", id, e),
            }
        }
    }

    /// Forgets typing slots nobody watches and nobody is flagged in.
    pub fn prune_typing(&self) -> usize {
        self.inner.typing.prune()
    }

    pub fn is_typing(&self, id: &ConversationId, user_id: &UserId) -> bool {
        self.inner.typing.is_typing(id, user_id)
    }

    /// Watches the other participant's typing flag.
    pub async fn subscribe_typing(
        &self,
        caller: &UserId,
        id: &ConversationId,
    ) -> ChatResult<TypingSubscription> {
        let conversation = self.conversation_for(caller, id).await?;
        let partner = conversation.other_participant(caller).cloned().ok_or_else(|| {
            ChatError::InvalidParticipants(format!("conversation {} has no partner", id))
        })?;
        Ok(self.inner.typing.subscribe(id, &partner))
    }

    /// Recomputes one conversation's preview and counters from its messages.
    pub async fn reconcile(&self, id: &ConversationId) -> ChatResult<Option<Conversation>> {
        Ok(self.reconcile_one(id).await?.map(|(conversation, _)| conversation))
    }

    async fn reconcile_one(&self, id: &ConversationId) -> ChatResult<Option<(Conversation, bool)>> {
        let before = self
            .guarded("find_conversation", self.store().find_conversation(id))
            .await?;
        let after = self
            .guarded("reconcile_conversation", self.store().reconcile_conversation(id))
            .await?;

        match after {
            Some(conversation) => {
                let changed = before.as_ref() != Some(&conversation);
                if changed {
                    tracing::info!("Reconciled conversation {}", id);
                    self.publish_lists(conversation.participant_ids.iter()).await;
                }
                Ok(Some((conversation, changed)))
            }
            None => Ok(None),
        }
    }

    /// Sweeps every conversation. Returns how many needed repair.
    pub async fn reconcile_all(&self) -> ChatResult<usize> {
        let ids = self
            .guarded("conversation_ids", self.store().conversation_ids())
            .await?;

        let mut repaired = 0;
        for id in &ids {
            match self.reconcile_one(id).await {
                Ok(Some((_, true))) => repaired += 1,
                Ok(_) => {}
                Err(e) => tracing::warn!("Failed to reconcile conversation {}: {}", id, e),
            }
        }
        Ok(repaired)
    }

    async fn publish_lists<'a>(&self, users: impl IntoIterator<Item = &'a UserId>) {
        for user in users {
            let refreshed = self
                .inner
                .feed
                .refresh_conversations(user, || {
                    self.guarded("conversations_for", self.store().conversations_for(user))
                })
                .await;
            if let Err(e) = refreshed {
                tracing::warn!("Failed to refresh conversations of {}: {}", user, e);
            }
        }
    }

    async fn publish_messages(&self, id: &ConversationId) {
        let refreshed = self
            .inner
            .feed
            .refresh_messages(id, || {
                self.guarded("messages_in", self.store().messages_in(id, None))
            })
            .await;
        if let Err(e) = refreshed {
            tracing::warn!("Failed to refresh messages of {}: {}", id, e);
        }
    }

    fn push_previews(&self, conversation: &Conversation) {
        for viewer in &conversation.participant_ids {
            let Some(other) = conversation.other_participant(viewer) else {
                continue;
            };
            if let Some(preview) = conversation.preview_for(viewer, self.is_online(other)) {
                self.inner
                    .transport
                    .push(viewer, &ChatEvent::ConversationUpdated(preview));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FlakyStore;
    use crate::transport::{ConnectionHub, FeedTransport};
    use async_trait::async_trait;
    use chat_core::store::MemoryChatStore;
    use chat_core::{Config, MessageStatus, UserRole};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn alice() -> UserIdentity {
        UserIdentity::new("1", "Alice", "alice@example.com", UserRole::User)
    }

    fn bob() -> UserIdentity {
        UserIdentity::new("2", "Bob", "bob@example.com", UserRole::Employer)
    }

    fn carol() -> UserIdentity {
        UserIdentity::new("3", "Carol", "carol@example.com", UserRole::User)
    }

    fn feed_service() -> MessagingService {
        MessagingService::new(
            ChatContext::in_memory(Config::default()),
            Arc::new(FeedTransport),
        )
    }

    fn socket_service() -> (MessagingService, Arc<ConnectionHub>) {
        let hub = Arc::new(ConnectionHub::new());
        let service = MessagingService::new(ChatContext::in_memory(Config::default()), hub.clone());
        (service, hub)
    }

    async fn pair(service: &MessagingService) -> Conversation {
        service
            .get_or_create_conversation(&Participant::from(&alice()), &Participant::from(&bob()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let service = feed_service();
        let first = pair(&service).await;
        let second = service
            .get_or_create_conversation(&Participant::from(&bob()), &Participant::from(&alice()))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(service.list_conversations(&alice().id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_pair_creation_converges() {
        let service = feed_service();
        let a = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .get_or_create_conversation(&Participant::from(&alice()), &Participant::from(&bob()))
                    .await
            })
        };
        let b = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .get_or_create_conversation(&Participant::from(&bob()), &Participant::from(&alice()))
                    .await
            })
        };

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(service.list_conversations(&bob().id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_first_message_scenario() {
        let service = feed_service();
        let conversation = pair(&service).await;

        let message = service
            .send_message(&alice(), &conversation.id, MessageDraft::text("Hi Bob"))
            .await
            .unwrap();
        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(message.sender_name, "Alice");

        let messages = service
            .list_messages(&alice().id, &conversation.id, None)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);

        let conversation = service
            .conversation_for(&alice().id, &conversation.id)
            .await
            .unwrap();
        assert_eq!(conversation.last_message, "Hi Bob");
        assert_eq!(conversation.unread_for(&alice().id), 0);
        assert_eq!(conversation.unread_for(&bob().id), 1);
    }

    #[tokio::test]
    async fn test_read_receipt_scenario() {
        let service = feed_service();
        let conversation = pair(&service).await;
        service
            .send_message(&alice(), &conversation.id, MessageDraft::text("Hi Bob"))
            .await
            .unwrap();

        let messages = service
            .open_conversation(&bob().id, &conversation.id, None)
            .await
            .unwrap();
        assert_eq!(messages[0].status, MessageStatus::Read);

        let conversation = service
            .conversation_for(&bob().id, &conversation.id)
            .await
            .unwrap();
        assert_eq!(conversation.unread_for(&alice().id), 0);
        assert_eq!(conversation.unread_for(&bob().id), 0);

        // Idempotent.
        assert_eq!(service.mark_read(&bob().id, &conversation.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_send_rejected_before_store() {
        let service = feed_service();
        let conversation = pair(&service).await;

        let err = service
            .send_message(&alice(), &conversation.id, MessageDraft::text("   "))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidMessage));
        assert!(service
            .list_messages(&alice().id, &conversation.id, None)
            .await
            .unwrap()
            .is_empty());

        // Attachment-only messages are fine.
        let draft = MessageDraft {
            content: String::new(),
            kind: MessageKind::Image,
            attachment: Some(Attachment {
                url: "https://cdn.example.com/cv.png".to_string(),
                name: "cv.png".to_string(),
                mime_type: Some("image/png".to_string()),
                size: Some(2048),
            }),
        };
        let message = service
            .send_message(&alice(), &conversation.id, draft)
            .await
            .unwrap();
        let conversation = service
            .conversation_for(&bob().id, &conversation.id)
            .await
            .unwrap();
        assert_eq!(conversation.last_message, message.preview_text());
    }

    #[tokio::test]
    async fn test_outsider_is_rejected() {
        let service = feed_service();
        let conversation = pair(&service).await;

        let err = service
            .send_message(&carol(), &conversation.id, MessageDraft::text("hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::ParticipantMismatch { .. }));

        let err = service
            .subscribe_messages(&carol().id, &conversation.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::ParticipantMismatch { .. }));

        let err = service
            .mark_read(&carol().id, &conversation.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::ParticipantMismatch { .. }));

        let err = service
            .conversation_for(&alice().id, &ConversationId::from("conv_1_99"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unread_only_grows_for_recipient_and_resets_to_zero() {
        let service = feed_service();
        let conversation = pair(&service).await;
        let mut observed = Vec::new();

        for (sender, text) in [(alice(), "one"), (alice(), "two"), (bob(), "three")] {
            service
                .send_message(&sender, &conversation.id, MessageDraft::text(text))
                .await
                .unwrap();
            let c = service
                .conversation_for(&alice().id, &conversation.id)
                .await
                .unwrap();
            observed.push((c.unread_for(&alice().id), c.unread_for(&bob().id)));
        }
        assert_eq!(observed, vec![(0, 1), (0, 2), (1, 2)]);

        service.mark_read(&bob().id, &conversation.id).await.unwrap();
        let c = service
            .conversation_for(&alice().id, &conversation.id)
            .await
            .unwrap();
        assert_eq!((c.unread_for(&alice().id), c.unread_for(&bob().id)), (1, 0));
    }

    #[tokio::test]
    async fn test_resubscribe_keeps_prefix_stable() {
        let service = feed_service();
        let conversation = pair(&service).await;
        for text in ["a", "b", "c"] {
            service
                .send_message(&alice(), &conversation.id, MessageDraft::text(text))
                .await
                .unwrap();
        }

        let mut first = service
            .subscribe_messages(&bob().id, &conversation.id)
            .await
            .unwrap();
        let before = first.next().await.unwrap();
        first.cancel();

        for text in ["d", "e"] {
            service
                .send_message(&bob(), &conversation.id, MessageDraft::text(text))
                .await
                .unwrap();
        }

        let mut second = service
            .subscribe_messages(&bob().id, &conversation.id)
            .await
            .unwrap();
        let after = second.next().await.unwrap();

        assert_eq!(after.len(), before.len() + 2);
        assert_eq!(&after[..before.len()], &before[..]);
        assert!(after.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_live_feed_tracks_sends() {
        let service = feed_service();
        let conversation = pair(&service).await;

        let mut list = service.subscribe_conversations(&bob().id).await.unwrap();
        assert_eq!(list.next().await.unwrap()[0].last_message, "");

        service
            .send_message(&alice(), &conversation.id, MessageDraft::text("Hi Bob"))
            .await
            .unwrap();
        let snapshot = list.next().await.unwrap();
        assert_eq!(snapshot[0].last_message, "Hi Bob");
        assert_eq!(snapshot[0].unread_for(&bob().id), 1);
    }

    #[tokio::test]
    async fn test_status_only_moves_forward() {
        let (service, hub) = socket_service();
        let conversation = pair(&service).await;
        let (_, mut bob_rx) = hub.register(&bob().id);
        let (_, mut alice_rx) = hub.register(&alice().id);

        let mut feed = service
            .subscribe_messages(&alice().id, &conversation.id)
            .await
            .unwrap();
        feed.next().await;

        let message = service
            .send_message(&alice(), &conversation.id, MessageDraft::text("ping"))
            .await
            .unwrap();
        assert_eq!(message.status, MessageStatus::Delivered);
        assert!(matches!(bob_rx.recv().await, Some(ChatEvent::NewMessage(_))));

        let mut alice_events = Vec::new();
        while let Ok(event) = alice_rx.try_recv() {
            alice_events.push(event.name());
        }
        assert!(alice_events.contains(&"message_sent"));
        assert!(alice_events.contains(&"message_delivered"));

        service.mark_read(&bob().id, &conversation.id).await.unwrap();
        // A late acknowledgment cannot move a read message back.
        assert!(service
            .mark_delivered(&bob().id, message.id)
            .await
            .unwrap()
            .is_none());

        let statuses: Vec<MessageStatus> = feed.current().iter().map(|m| m.status).collect();
        assert_eq!(statuses, vec![MessageStatus::Read]);
        assert!(MessageStatus::Delivered.can_advance_to(MessageStatus::Read));
        assert!(!MessageStatus::Read.can_advance_to(MessageStatus::Delivered));
    }

    #[tokio::test]
    async fn test_offline_recipient_stays_sent() {
        let (service, hub) = socket_service();
        let conversation = pair(&service).await;
        let (_, mut alice_rx) = hub.register(&alice().id);

        let message = service
            .send_message(&alice(), &conversation.id, MessageDraft::text("are you there?"))
            .await
            .unwrap();
        assert_eq!(message.status, MessageStatus::Sent);
        assert!(matches!(alice_rx.recv().await, Some(ChatEvent::MessageSent(_))));
    }

    #[tokio::test]
    async fn test_typing_pushes_only_on_change() {
        let (service, hub) = socket_service();
        let conversation = pair(&service).await;
        let (_, mut bob_rx) = hub.register(&bob().id);

        service.set_typing(&alice().id, &conversation.id, true).await.unwrap();
        service.set_typing(&alice().id, &conversation.id, true).await.unwrap();
        assert_eq!(bob_rx.recv().await.map(|e| e.name()), Some("user_typing"));
        assert!(bob_rx.try_recv().is_err());

        // Sending clears the sender's flag.
        service
            .send_message(&alice(), &conversation.id, MessageDraft::text("done"))
            .await
            .unwrap();
        assert!(!service.is_typing(&conversation.id, &alice().id));
        assert_eq!(bob_rx.recv().await.map(|e| e.name()), Some("user_stopped_typing"));
    }

    #[tokio::test]
    async fn test_disconnect_clears_abandoned_typing_flag() {
        let (service, hub) = socket_service();
        let conversation = pair(&service).await;
        let (_, mut bob_rx) = hub.register(&bob().id);

        let guard = service.connect(&alice()).await.unwrap();
        service.set_typing(&alice().id, &conversation.id, true).await.unwrap();
        while let Ok(event) = bob_rx.try_recv() {
            assert_ne!(event.name(), "user_stopped_typing");
        }

        assert!(guard.close().is_some());
        service.clear_typing_of(&alice().id).await;
        assert!(!service.is_typing(&conversation.id, &alice().id));
        assert_eq!(service.prune_typing(), 0);

        let mut names = Vec::new();
        while let Ok(event) = bob_rx.try_recv() {
            names.push(event.name());
        }
        assert!(names.contains(&"user_stopped_typing"), "{:?}", names);
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_subscriber_expires_stale_flag() {
        let service = feed_service();
        let conversation = pair(&service).await;
        let mut typing = service
            .subscribe_typing(&bob().id, &conversation.id)
            .await
            .unwrap();
        assert_eq!(typing.next().await, Some(false));

        service.set_typing(&alice().id, &conversation.id, true).await.unwrap();
        assert_eq!(typing.next().await, Some(true));
        assert_eq!(typing.next().await, Some(false));
    }

    #[tokio::test]
    async fn test_start_conversation_requires_known_user() {
        let service = feed_service();
        let guard = service.connect(&bob()).await.unwrap();

        let conversation = service
            .start_conversation_with(&alice(), &bob().id)
            .await
            .unwrap();
        assert_eq!(conversation.id, ConversationId::for_pair(&alice().id, &bob().id));

        let err = service
            .start_conversation_with(&alice(), &carol().id)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));

        let err = service
            .start_conversation_with(&alice(), &alice().id)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidParticipants(_)));
        drop(guard);
    }

    #[tokio::test]
    async fn test_previews_report_partner_presence() {
        let service = feed_service();
        let conversation = pair(&service).await;

        let guard = service.connect(&bob()).await.unwrap();
        let previews = service.conversation_previews(&alice().id).await.unwrap();
        assert_eq!(previews[0].id, conversation.id);
        assert!(previews[0].is_online);
        assert_eq!(previews[0].other_user.as_ref().map(|p| p.name.as_str()), Some("Bob"));

        guard.close();
        let previews = service.conversation_previews(&alice().id).await.unwrap();
        assert!(!previews[0].is_online);
    }

    #[tokio::test]
    async fn test_renamed_user_is_refreshed_on_connect() {
        let service = feed_service();
        service.connect(&bob()).await.unwrap().close();
        let conversation = pair(&service).await;

        let renamed = UserIdentity::new("2", "Robert", "bob@example.com", UserRole::Employer);
        service.connect(&renamed).await.unwrap().close();

        let conversation = service
            .conversation_for(&alice().id, &conversation.id)
            .await
            .unwrap();
        let details: &ParticipantProfile = &conversation.participant_details[&bob().id];
        assert_eq!(details.name, "Robert");
    }

    #[tokio::test]
    async fn test_pairs_with_separator_ids_stay_apart() {
        let service = feed_service();
        let ab = UserIdentity::new("a_b", "Ann", "ann@example.com", UserRole::User);
        let c = UserIdentity::new("c", "Cy", "cy@example.com", UserRole::Employer);
        let a = UserIdentity::new("a", "Al", "al@example.com", UserRole::User);
        let bc = UserIdentity::new("b_c", "Bea", "bea@example.com", UserRole::Employer);

        let first = service
            .get_or_create_conversation(&Participant::from(&ab), &Participant::from(&c))
            .await
            .unwrap();
        service
            .send_message(&ab, &first.id, MessageDraft::text("secret for c"))
            .await
            .unwrap();

        let second = service
            .get_or_create_conversation(&Participant::from(&a), &Participant::from(&bc))
            .await
            .unwrap();
        assert_ne!(first.id, second.id);
        assert!(second.is_between(&a.id, &bc.id));
        assert_eq!(second.last_message, "");

        service
            .send_message(&a, &second.id, MessageDraft::text("hello"))
            .await
            .unwrap();
        let visible = service.list_conversations(&a.id).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].last_message, "hello");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sweeps_during_sends_never_lower_unread() {
        let service = feed_service();
        let conversation = pair(&service).await;
        let sends: u32 = 25;

        let sender = {
            let service = service.clone();
            let id = conversation.id.clone();
            tokio::spawn(async move {
                for i in 0..sends {
                    service
                        .send_message(&alice(), &id, MessageDraft::text(format!("m{}", i)))
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        let sweeper = {
            let service = service.clone();
            tokio::spawn(async move {
                for _ in 0..sends * 2 {
                    service.reconcile_all().await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut observed = Vec::new();
        while !sender.is_finished() {
            let c = service.conversation_for(&bob().id, &conversation.id).await.unwrap();
            observed.push(c.unread_for(&bob().id));
            tokio::task::yield_now().await;
        }
        sender.await.unwrap();
        sweeper.await.unwrap();

        let c = service.conversation_for(&bob().id, &conversation.id).await.unwrap();
        observed.push(c.unread_for(&bob().id));
        assert!(observed.windows(2).all(|w| w[0] <= w[1]), "{:?}", observed);
        assert_eq!(c.unread_for(&bob().id), sends);
        assert_eq!(c.last_message, format!("m{}", sends - 1));
    }

    #[tokio::test]
    async fn test_failed_metadata_update_is_reconciled() {
        let store = Arc::new(FlakyStore::new());
        let service = MessagingService::new(
            ChatContext::with_store(Config::default(), store.clone()),
            Arc::new(FeedTransport),
        );
        let conversation = pair(&service).await;

        store.fail_apply.store(true, Ordering::SeqCst);
        service
            .send_message(&alice(), &conversation.id, MessageDraft::text("repaired inline"))
            .await
            .unwrap();
        let c = service.conversation_for(&bob().id, &conversation.id).await.unwrap();
        assert_eq!(c.last_message, "repaired inline");
        assert_eq!(c.unread_for(&bob().id), 1);

        store.fail_reconcile.store(true, Ordering::SeqCst);
        let err = service
            .send_message(&alice(), &conversation.id, MessageDraft::text("left behind"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::PartialWriteInconsistency { .. }));
        assert!(!err.is_retryable());
        let contents: Vec<String> = service
            .list_messages(&bob().id, &conversation.id, None)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["repaired inline", "left behind"]);

        store.fail_apply.store(false, Ordering::SeqCst);
        store.fail_reconcile.store(false, Ordering::SeqCst);
        assert_eq!(service.reconcile_all().await.unwrap(), 1);
        let c = service.conversation_for(&bob().id, &conversation.id).await.unwrap();
        assert_eq!(c.last_message, "left behind");
        assert_eq!(c.unread_for(&bob().id), 2);
        assert_eq!(service.reconcile_all().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_times_out() {
        struct SlowStore(MemoryChatStore);

        #[async_trait]
        impl ChatStore for SlowStore {
            async fn upsert_profile(&self, p: &Participant) -> ChatResult<()> {
                self.0.upsert_profile(p).await
            }
            async fn find_profile(&self, u: &UserId) -> ChatResult<Option<ParticipantProfile>> {
                self.0.find_profile(u).await
            }
            async fn get_or_create_conversation(
                &self,
                a: &Participant,
                b: &Participant,
            ) -> ChatResult<(Conversation, bool)> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                self.0.get_or_create_conversation(a, b).await
            }
            async fn find_conversation(&self, id: &ConversationId) -> ChatResult<Option<Conversation>> {
                self.0.find_conversation(id).await
            }
            async fn conversations_for(&self, u: &UserId) -> ChatResult<Vec<Conversation>> {
                self.0.conversations_for(u).await
            }
            async fn refresh_participant(&self, p: &Participant) -> ChatResult<Vec<Conversation>> {
                self.0.refresh_participant(p).await
            }
            async fn insert_message(&self, m: NewMessage) -> ChatResult<Message> {
                self.0.insert_message(m).await
            }
            async fn apply_send(&self, m: &Message) -> ChatResult<Conversation> {
                self.0.apply_send(m).await
            }
            async fn messages_in(&self, id: &ConversationId, page: Option<Page>) -> ChatResult<Vec<Message>> {
                self.0.messages_in(id, page).await
            }
            async fn find_message(&self, id: MessageId) -> ChatResult<Option<Message>> {
                self.0.find_message(id).await
            }
            async fn mark_delivered(&self, id: MessageId) -> ChatResult<Option<Message>> {
                self.0.mark_delivered(id).await
            }
            async fn mark_read(&self, id: &ConversationId, r: &UserId) -> ChatResult<u64> {
                self.0.mark_read(id, r).await
            }
            async fn reconcile_conversation(&self, id: &ConversationId) -> ChatResult<Option<Conversation>> {
                self.0.reconcile_conversation(id).await
            }
            async fn conversation_ids(&self) -> ChatResult<Vec<ConversationId>> {
                self.0.conversation_ids().await
            }
        }

        let service = MessagingService::new(
            ChatContext::with_store(Config::default(), Arc::new(SlowStore(MemoryChatStore::new()))),
            Arc::new(FeedTransport),
        );
        let err = service
            .get_or_create_conversation(&Participant::from(&alice()), &Participant::from(&bob()))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Timeout(_)));
        assert!(err.is_retryable());
    }
}
