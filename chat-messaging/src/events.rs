use chat_core::{ChatError, ConversationId, ConversationPreview, Message, MessageId, UserId};
use serde::{Deserialize, Serialize};

/// Server-to-client events pushed over a live transport.
///
/// Serialized as `{"event": "<name>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ChatEvent {
    ConversationsList(Vec<ConversationPreview>),
    MessagesList {
        conversation_id: ConversationId,
        messages: Vec<Message>,
    },
    NewMessage(Message),
    MessageSent(Message),
    MessageDelivered {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    MessagesRead {
        conversation_id: ConversationId,
        read_by: UserId,
    },
    ConversationUpdated(ConversationPreview),
    UserTyping {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    UserStoppedTyping {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    UserOnline {
        user_id: UserId,
    },
    UserOffline {
        user_id: UserId,
    },
    Error {
        message: String,
        retryable: bool,
    },
}

impl ChatEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChatEvent::ConversationsList(_) => "conversations_list",
            ChatEvent::MessagesList { .. } => "messages_list",
            ChatEvent::NewMessage(_) => "new_message",
            ChatEvent::MessageSent(_) => "message_sent",
            ChatEvent::MessageDelivered { .. } => "message_delivered",
            ChatEvent::MessagesRead { .. } => "messages_read",
            ChatEvent::ConversationUpdated(_) => "conversation_updated",
            ChatEvent::UserTyping { .. } => "user_typing",
            ChatEvent::UserStoppedTyping { .. } => "user_stopped_typing",
            ChatEvent::UserOnline { .. } => "user_online",
            ChatEvent::UserOffline { .. } => "user_offline",
            ChatEvent::Error { .. } => "error",
        }
    }

    pub fn typing(conversation_id: &ConversationId, user_id: &UserId, typing: bool) -> Self {
        if typing {
            ChatEvent::UserTyping {
                conversation_id: conversation_id.clone(),
                user_id: user_id.clone(),
            }
        } else {
            ChatEvent::UserStoppedTyping {
                conversation_id: conversation_id.clone(),
                user_id: user_id.clone(),
            }
        }
    }
}

impl From<&ChatError> for ChatEvent {
    fn from(error: &ChatError) -> Self {
        let message = match error {
            // Store internals stay in the logs.
            ChatError::Store(_) => "Internal storage error".to_string(),
            other => other.to_string(),
        };
        ChatEvent::Error {
            message,
            retryable: error.is_retryable(),
        }
    }
}
