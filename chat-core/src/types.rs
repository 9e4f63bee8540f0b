use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ChatError;

/// Stable identifier of an authenticated user, as handed to us by the auth subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    User,
    Admin,
    Employer,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::User => "user",
            UserRole::Admin => "admin",
            UserRole::Employer => "employer",
        }
    }
}

impl FromStr for UserRole {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(UserRole::User),
            "admin" => Ok(UserRole::Admin),
            "employer" => Ok(UserRole::Employer),
            other => Err(ChatError::Store(anyhow::anyhow!("Unknown user role: {}", other))),
        }
    }
}

/// Identity supplied by the authentication collaborator for the duration of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub role: UserRole,
}

impl UserIdentity {
    pub fn new(id: impl Into<UserId>, name: &str, email: &str, role: UserRole) -> Self {
        Self {
            id: id.into(),
            name: name.to_string(),
            email: email.to_string(),
            role,
        }
    }
}

/// Denormalized snapshot of a participant kept on each conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantProfile {
    pub name: String,
    pub email: String,
    pub role: UserRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(default)]
    pub is_verified: bool,
}

impl From<&UserIdentity> for ParticipantProfile {
    fn from(user: &UserIdentity) -> Self {
        Self {
            name: user.name.clone(),
            email: user.email.clone(),
            role: user.role,
            photo_url: None,
            position: None,
            company_name: None,
            is_verified: false,
        }
    }
}

/// A user id paired with the profile snapshot to denormalize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: UserId,
    pub profile: ParticipantProfile,
}

impl From<&UserIdentity> for Participant {
    fn from(user: &UserIdentity) -> Self {
        Self {
            id: user.id.clone(),
            profile: ParticipantProfile::from(user),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Deterministic id for an unordered participant pair, so both sides resolve the same key.
    ///
    /// The lower id is length-prefixed: `conv_{len}_{low}_{high}`. User ids are
    /// opaque and may contain `_`, so a bare join would map distinct pairs
    /// onto one id.
    pub fn for_pair(a: &UserId, b: &UserId) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("conv_{}_{}_{}", low.as_str().len(), low, high))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    /// Always sorted, always two distinct users.
    pub participant_ids: [UserId; 2],
    pub participant_details: BTreeMap<UserId, ParticipantProfile>,
    pub last_message: String,
    pub last_message_kind: Option<MessageKind>,
    pub last_message_time: DateTime<Utc>,
    pub last_message_sender_id: Option<UserId>,
    pub unread_count: BTreeMap<UserId, u32>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// Builds a fresh conversation between two distinct participants.
    pub fn between(a: &Participant, b: &Participant, now: DateTime<Utc>) -> Result<Self, ChatError> {
        if a.id == b.id {
            return Err(ChatError::InvalidParticipants(format!(
                "cannot start a conversation of {} with themselves",
                a.id
            )));
        }

        let (low, high) = if a.id <= b.id { (a, b) } else { (b, a) };

        let mut participant_details = BTreeMap::new();
        participant_details.insert(low.id.clone(), low.profile.clone());
        participant_details.insert(high.id.clone(), high.profile.clone());

        let mut unread_count = BTreeMap::new();
        unread_count.insert(low.id.clone(), 0);
        unread_count.insert(high.id.clone(), 0);

        Ok(Self {
            id: ConversationId::for_pair(&low.id, &high.id),
            participant_ids: [low.id.clone(), high.id.clone()],
            participant_details,
            last_message: String::new(),
            last_message_kind: None,
            last_message_time: now,
            last_message_sender_id: None,
            unread_count,
            created_at: now,
        })
    }

    pub fn has_participant(&self, user_id: &UserId) -> bool {
        self.participant_ids.iter().any(|p| p == user_id)
    }

    pub fn other_participant(&self, user_id: &UserId) -> Option<&UserId> {
        match &self.participant_ids {
            [a, b] if a == user_id => Some(b),
            [a, b] if b == user_id => Some(a),
            _ => None,
        }
    }

    /// True when the conversation is exactly the unordered pair `{a, b}`.
    pub fn is_between(&self, a: &UserId, b: &UserId) -> bool {
        let [low, high] = &self.participant_ids;
        (low == a && high == b) || (low == b && high == a)
    }

    pub fn unread_for(&self, user_id: &UserId) -> u32 {
        self.unread_count.get(user_id).copied().unwrap_or(0)
    }

    /// Denormalizes a freshly appended message into the preview fields and bumps the recipient's counter.
    /// A message older than the current preview only counts towards unread.
    pub fn record_send(&mut self, message: &Message) {
        if message.timestamp >= self.last_message_time {
            self.last_message = message.preview_text();
            self.last_message_kind = Some(message.kind);
            self.last_message_time = message.timestamp;
            self.last_message_sender_id = Some(message.sender_id.clone());
        }
        *self.unread_count.entry(message.recipient_id.clone()).or_insert(0) += 1;
    }

    pub fn reset_unread(&mut self, user_id: &UserId) {
        if let Some(count) = self.unread_count.get_mut(user_id) {
            *count = 0;
        }
    }

    /// Recomputes the denormalized preview and unread counters from the message log.
    pub fn reconcile_with(&mut self, messages: &[Message]) {
        match messages.iter().max_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id))) {
            Some(latest) => {
                self.last_message = latest.preview_text();
                self.last_message_kind = Some(latest.kind);
                self.last_message_time = latest.timestamp;
                self.last_message_sender_id = Some(latest.sender_id.clone());
            }
            None => {
                self.last_message = String::new();
                self.last_message_kind = None;
                self.last_message_time = self.created_at;
                self.last_message_sender_id = None;
            }
        }

        for participant in &self.participant_ids {
            let unread = messages
                .iter()
                .filter(|m| &m.recipient_id == participant && m.status != MessageStatus::Read)
                .count() as u32;
            self.unread_count.insert(participant.clone(), unread);
        }
    }

    pub fn preview_for(&self, viewer: &UserId, other_online: bool) -> Option<ConversationPreview> {
        let other = self.other_participant(viewer)?;
        Some(ConversationPreview {
            id: self.id.clone(),
            other_user_id: other.clone(),
            other_user: self.participant_details.get(other).cloned(),
            last_message: self.last_message.clone(),
            last_message_kind: self.last_message_kind,
            last_message_sender_id: self.last_message_sender_id.clone(),
            last_message_time: self.last_message_time,
            unread_count: self.unread_for(viewer),
            is_online: other_online,
        })
    }
}

/// A conversation as seen from one participant's list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationPreview {
    pub id: ConversationId,
    pub other_user_id: UserId,
    pub other_user: Option<ParticipantProfile>,
    pub last_message: String,
    pub last_message_kind: Option<MessageKind>,
    pub last_message_sender_id: Option<UserId>,
    pub last_message_time: DateTime<Utc>,
    pub unread_count: u32,
    pub is_online: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Forward-only delivery state. The derived ordering is the state machine's order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
        }
    }

    pub fn can_advance_to(&self, next: MessageStatus) -> bool {
        next > *self
    }
}

impl FromStr for MessageStatus {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "read" => Ok(MessageStatus::Read),
            other => Err(ChatError::Store(anyhow::anyhow!("Unknown message status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    Audio,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
            MessageKind::Audio => "audio",
        }
    }
}

impl FromStr for MessageKind {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageKind::Text),
            "image" => Ok(MessageKind::Image),
            "file" => Ok(MessageKind::File),
            "audio" => Ok(MessageKind::Audio),
            other => Err(ChatError::Store(anyhow::anyhow!("Unknown message kind: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub recipient_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub attachment: Option<Attachment>,
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Text shown in conversation lists; attachments without a caption show their file name.
    pub fn preview_text(&self) -> String {
        if self.content.trim().is_empty() {
            if let Some(attachment) = &self.attachment {
                return attachment.name.clone();
            }
        }
        self.content.clone()
    }
}

/// A message that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub recipient_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub attachment: Option<Attachment>,
}

impl NewMessage {
    pub fn validate(&self) -> Result<(), ChatError> {
        if self.content.trim().is_empty() && self.attachment.is_none() {
            return Err(ChatError::InvalidMessage);
        }
        if self.sender_id == self.recipient_id {
            return Err(ChatError::InvalidParticipants(
                "sender and recipient must differ".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub state: PresenceState,
    pub last_changed: DateTime<Utc>,
}

impl PresenceRecord {
    pub fn is_online(&self) -> bool {
        self.state == PresenceState::Online
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingSignal {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub typing: bool,
    pub timestamp: DateTime<Utc>,
}
