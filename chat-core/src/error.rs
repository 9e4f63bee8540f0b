use std::time::Duration;
use thiserror::Error;

use crate::types::{ConversationId, MessageId, UserId};

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Message must have content or an attachment")]
    InvalidMessage,

    #[error("No active conversation")]
    NoActiveConversation,

    #[error("User {user} is not a participant of conversation {conversation}")]
    ParticipantMismatch {
        conversation: ConversationId,
        user: UserId,
    },

    #[error("Invalid participants: {0}")]
    InvalidParticipants(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Message {message_id} stored but conversation {conversation} metadata was not updated")]
    PartialWriteInconsistency {
        conversation: ConversationId,
        message_id: MessageId,
    },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl ChatError {
    /// Whether the caller may retry the same operation unchanged.
    ///
    /// A partial write already stored the message, so repeating the send
    /// would duplicate it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::TransportUnavailable(_) | ChatError::Timeout(_) | ChatError::Store(_)
        )
    }
}

impl From<diesel::result::Error> for ChatError {
    fn from(e: diesel::result::Error) -> Self {
        ChatError::Store(anyhow::anyhow!("Database error: {}", e))
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Store(anyhow::anyhow!("Serialization error: {}", e))
    }
}
