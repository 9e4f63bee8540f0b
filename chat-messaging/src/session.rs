//! Client-side chat session: the "current conversation" state a UI binds to.

use chat_core::{
    Attachment, ChatError, ChatResult, Conversation, ConversationId, Message, MessageKind,
    Participant, UserIdentity,
};
use tokio::task::JoinHandle;

use crate::feed::Subscription;
use crate::presence::PresenceGuard;
use crate::service::{MessageDraft, MessagingService};
use crate::typing::TypingSubscription;

/// Last failure surfaced to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionError {
    pub message: String,
    pub retryable: bool,
}

impl From<&ChatError> for SessionError {
    fn from(error: &ChatError) -> Self {
        Self {
            message: error.to_string(),
            retryable: error.is_retryable(),
        }
    }
}

struct CurrentConversation {
    conversation: Conversation,
    messages: Option<Subscription<Vec<Message>>>,
    cached: Vec<Message>,
}

pub struct ChatSession {
    service: MessagingService,
    identity: UserIdentity,
    presence: Option<PresenceGuard>,
    conversations: Option<Subscription<Vec<Conversation>>>,
    cached_conversations: Vec<Conversation>,
    current: Option<CurrentConversation>,
    typing_timer: Option<JoinHandle<()>>,
    draft: Option<String>,
    error: Option<SessionError>,
}

impl ChatSession {
    /// Goes online and starts streaming the caller's conversation list.
    ///
    /// When the live feed cannot be established the session starts degraded,
    /// serving a one-off snapshot until [`ChatSession::refresh`] succeeds.
    pub async fn open(service: MessagingService, identity: UserIdentity) -> ChatResult<Self> {
        let presence = service.connect(&identity).await?;
        let mut session = Self {
            service,
            identity,
            presence: Some(presence),
            conversations: None,
            cached_conversations: Vec::new(),
            current: None,
            typing_timer: None,
            draft: None,
            error: None,
        };

        match session.service.subscribe_conversations(&session.identity.id).await {
            Ok(subscription) => session.conversations = Some(subscription),
            Err(e) => {
                tracing::warn!("Conversation feed unavailable for {}: {}", session.identity.id, e);
                session.degrade(&e);
                session.cached_conversations =
                    session.service.list_conversations(&session.identity.id).await?;
            }
        }
        Ok(session)
    }

    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    /// Latest conversation list, most recent first.
    pub fn conversations(&self) -> Vec<Conversation> {
        match &self.conversations {
            Some(subscription) => subscription.current(),
            None => self.cached_conversations.clone(),
        }
    }

    /// Waits for the next list snapshot. Falls back to polling once the live feed is gone.
    pub async fn next_conversations(&mut self) -> ChatResult<Vec<Conversation>> {
        if let Some(subscription) = self.conversations.as_mut() {
            if let Some(snapshot) = subscription.next().await {
                return Ok(snapshot);
            }
            let e = ChatError::TransportUnavailable("conversation feed closed".to_string());
            tracing::warn!("{}; polling instead", e);
            self.degrade(&e);
            self.conversations = None;
        }

        tokio::time::sleep(self.service.config().poll_interval()).await;
        self.cached_conversations = self.service.list_conversations(&self.identity.id).await?;
        Ok(self.cached_conversations.clone())
    }

    pub fn current_conversation(&self) -> Option<&Conversation> {
        self.current.as_ref().map(|c| &c.conversation)
    }

    /// Messages of the current conversation, ascending.
    pub fn messages(&self) -> Vec<Message> {
        match &self.current {
            Some(CurrentConversation {
                messages: Some(subscription),
                ..
            }) => subscription.current(),
            Some(current) => current.cached.clone(),
            None => Vec::new(),
        }
    }

    pub async fn next_messages(&mut self) -> ChatResult<Vec<Message>> {
        let current = self.current.as_mut().ok_or(ChatError::NoActiveConversation)?;
        if let Some(subscription) = current.messages.as_mut() {
            if let Some(snapshot) = subscription.next().await {
                return Ok(snapshot);
            }
            current.messages = None;
            self.degrade(&ChatError::TransportUnavailable("message feed closed".to_string()));
        }

        tokio::time::sleep(self.service.config().poll_interval()).await;
        self.refresh_messages().await
    }

    /// Makes `id` current, marks it read for the caller and streams its messages.
    ///
    /// Unknown conversations and conversations of other users are rejected and
    /// leave the current state untouched.
    pub async fn select_conversation(&mut self, id: &ConversationId) -> ChatResult<()> {
        let conversation = self.service.conversation_for(&self.identity.id, id).await?;
        self.service.mark_read(&self.identity.id, id).await?;

        let (messages, cached) = match self.service.subscribe_messages(&self.identity.id, id).await {
            Ok(subscription) => (Some(subscription), Vec::new()),
            Err(e) if e.is_retryable() => {
                tracing::warn!("Message feed unavailable for {}: {}", id, e);
                self.degrade(&e);
                let cached = self
                    .service
                    .list_messages(&self.identity.id, id, None)
                    .await
                    .unwrap_or_default();
                (None, cached)
            }
            Err(e) => return Err(e),
        };

        self.stop_typing_timer();
        self.current = Some(CurrentConversation {
            conversation,
            messages,
            cached,
        });
        Ok(())
    }

    pub async fn start_conversation(&mut self, other: &Participant) -> ChatResult<ConversationId> {
        let me = Participant::from(&self.identity);
        let conversation = self.service.get_or_create_conversation(&me, other).await?;
        self.select_conversation(&conversation.id).await?;
        Ok(conversation.id)
    }

    /// Sends to the current conversation. A failed send keeps the text as the draft.
    pub async fn send(&mut self, text: &str, attachment: Option<Attachment>) -> ChatResult<Message> {
        let Some(current) = &self.current else {
            return Err(ChatError::NoActiveConversation);
        };
        let id = current.conversation.id.clone();

        let kind = match &attachment {
            Some(a) if a.mime_type.as_deref().map_or(false, |m| m.starts_with("image/")) => MessageKind::Image,
            Some(a) if a.mime_type.as_deref().map_or(false, |m| m.starts_with("audio/")) => MessageKind::Audio,
            Some(_) => MessageKind::File,
            None => MessageKind::Text,
        };
        let draft = MessageDraft {
            content: text.to_string(),
            kind,
            attachment,
        };

        match self.service.send_message(&self.identity, &id, draft).await {
            Ok(message) => {
                self.stop_typing_timer();
                self.draft = None;
                self.error = None;
                Ok(message)
            }
            Err(e @ ChatError::PartialWriteInconsistency { .. }) => {
                // Stored already: restoring the text would invite a duplicate send.
                tracing::warn!("Send in {} stored but not applied: {}", id, e);
                self.stop_typing_timer();
                self.draft = None;
                self.error = Some(SessionError::from(&e));
                Err(e)
            }
            Err(e) => {
                tracing::warn!("Send in {} failed: {}", id, e);
                self.draft = Some(text.to_string());
                self.error = Some(SessionError::from(&e));
                Err(e)
            }
        }
    }

    /// Text restored after a failed send, if any.
    pub fn take_draft(&mut self) -> Option<String> {
        self.draft.take()
    }

    pub async fn set_typing(&mut self, typing: bool) -> ChatResult<()> {
        let id = self.current_id()?;
        if !typing {
            self.stop_typing_timer();
        }
        self.service.set_typing(&self.identity.id, &id, typing).await
    }

    /// Flags the caller as typing and clears the flag after the idle window without keystrokes.
    pub async fn keystroke(&mut self) -> ChatResult<()> {
        let id = self.current_id()?;
        self.service.set_typing(&self.identity.id, &id, true).await?;

        self.stop_typing_timer();
        let service = self.service.clone();
        let user_id = self.identity.id.clone();
        let idle = self.service.config().typing_idle();
        self.typing_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            if let Err(e) = service.set_typing(&user_id, &id, false).await {
                tracing::debug!("Failed to clear typing flag of {}: {}", user_id, e);
            }
        }));
        Ok(())
    }

    /// Watches the partner's typing flag in the current conversation.
    pub async fn partner_typing(&self) -> ChatResult<TypingSubscription> {
        let id = self.current_id()?;
        self.service.subscribe_typing(&self.identity.id, &id).await
    }

    pub async fn mark_read(&mut self) -> ChatResult<u64> {
        let id = self.current_id()?;
        self.service.mark_read(&self.identity.id, &id).await
    }

    /// Drops the current conversation and its subscriptions. Durable data is untouched.
    pub fn clear_current_conversation(&mut self) {
        if let Some(timer) = self.typing_timer.take() {
            timer.abort();
            if let Some(current) = &self.current {
                let service = self.service.clone();
                let user_id = self.identity.id.clone();
                let id = current.conversation.id.clone();
                tokio::spawn(async move {
                    if let Err(e) = service.set_typing(&user_id, &id, false).await {
                        tracing::debug!("Failed to clear typing flag of {}: {}", user_id, e);
                    }
                });
            }
        }
        self.current = None;
    }

    /// Polling fallback: reloads state straight from the store and retries the live feeds.
    pub async fn refresh(&mut self) -> ChatResult<()> {
        let result = self.try_refresh().await;
        match &result {
            Ok(()) => self.error = None,
            Err(e) => self.degrade(e),
        }
        result
    }

    async fn try_refresh(&mut self) -> ChatResult<()> {
        if self.conversations.is_none() {
            match self.service.subscribe_conversations(&self.identity.id).await {
                Ok(subscription) => self.conversations = Some(subscription),
                Err(_) => {
                    self.cached_conversations =
                        self.service.list_conversations(&self.identity.id).await?;
                }
            }
        }

        if let Some(current) = self.current.as_mut() {
            current.conversation = self
                .service
                .conversation_for(&self.identity.id, &current.conversation.id)
                .await?;
            if current.messages.is_none() {
                if let Ok(subscription) = self
                    .service
                    .subscribe_messages(&self.identity.id, &current.conversation.id)
                    .await
                {
                    current.messages = Some(subscription);
                }
            }
        }
        if self.current.as_ref().map_or(false, |c| c.messages.is_none()) {
            self.refresh_messages().await?;
        }
        Ok(())
    }

    async fn refresh_messages(&mut self) -> ChatResult<Vec<Message>> {
        let id = self.current_id()?;
        let messages = self.service.list_messages(&self.identity.id, &id, None).await?;
        if let Some(current) = self.current.as_mut() {
            current.cached = messages.clone();
        }
        Ok(messages)
    }

    pub fn error(&self) -> Option<&SessionError> {
        self.error.as_ref()
    }

    pub fn is_degraded(&self) -> bool {
        self.error.as_ref().map_or(false, |e| e.retryable)
    }

    /// Goes offline explicitly.
    pub fn close(mut self) {
        self.clear_current_conversation();
        if let Some(presence) = self.presence.take() {
            presence.close();
        }
    }

    fn current_id(&self) -> ChatResult<ConversationId> {
        self.current
            .as_ref()
            .map(|c| c.conversation.id.clone())
            .ok_or(ChatError::NoActiveConversation)
    }

    fn stop_typing_timer(&mut self) {
        if let Some(timer) = self.typing_timer.take() {
            timer.abort();
        }
    }

    fn degrade(&mut self, error: &ChatError) {
        self.error = Some(SessionError::from(error));
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.stop_typing_timer();
    }
}
