use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::upsert::excluded;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{ensure_pair, sort_by_recency, sort_chronologically, Appended, ChatStore};
use crate::db::{DbConnection, DbPool};
use crate::error::{ChatError, ChatResult};
use crate::schema::{chat_conversations, chat_messages, chat_users};
use crate::types::{
    Conversation, ConversationId, Message, MessageId, MessageStatus, NewMessage, Page,
    Participant, ParticipantProfile, UserId,
};

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = chat_users)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct UserRow {
    user_id: String,
    name: String,
    email: String,
    role: String,
    photo_url: Option<String>,
    position: Option<String>,
    company_name: Option<String>,
    is_verified: bool,
    updated_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for ParticipantProfile {
    type Error = ChatError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(ParticipantProfile {
            name: row.name,
            email: row.email,
            role: row.role.parse()?,
            photo_url: row.photo_url,
            position: row.position,
            company_name: row.company_name,
            is_verified: row.is_verified,
        })
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = chat_conversations)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct ConversationRow {
    id: String,
    participant_low: String,
    participant_high: String,
    participant_details: serde_json::Value,
    last_message: String,
    last_message_kind: Option<String>,
    last_message_at: DateTime<Utc>,
    last_message_sender: Option<String>,
    unread_low: i32,
    unread_high: i32,
    created_at: DateTime<Utc>,
    #[allow(dead_code)]
    updated_at: DateTime<Utc>,
}

impl TryFrom<ConversationRow> for Conversation {
    type Error = ChatError;

    fn try_from(row: ConversationRow) -> Result<Self, Self::Error> {
        let low = UserId::new(row.participant_low);
        let high = UserId::new(row.participant_high);

        let mut unread_count = BTreeMap::new();
        unread_count.insert(low.clone(), row.unread_low.max(0) as u32);
        unread_count.insert(high.clone(), row.unread_high.max(0) as u32);

        Ok(Conversation {
            id: ConversationId::new(row.id),
            participant_ids: [low, high],
            participant_details: serde_json::from_value(row.participant_details)?,
            last_message: row.last_message,
            last_message_kind: row.last_message_kind.map(|k| k.parse()).transpose()?,
            last_message_time: row.last_message_at,
            last_message_sender_id: row.last_message_sender.map(UserId::new),
            unread_count,
            created_at: row.created_at,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = chat_conversations)]
struct NewConversationRow<'a> {
    id: &'a str,
    participant_low: &'a str,
    participant_high: &'a str,
    participant_details: serde_json::Value,
    last_message: &'a str,
    last_message_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = chat_messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct MessageRow {
    id: i64,
    conversation_id: String,
    sender_id: String,
    sender_name: String,
    recipient_id: String,
    content: String,
    kind: String,
    attachment: Option<serde_json::Value>,
    status: String,
    created_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
    read_at: Option<DateTime<Utc>>,
}

impl TryFrom<MessageRow> for Message {
    type Error = ChatError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Message {
            id: MessageId(row.id),
            conversation_id: ConversationId::new(row.conversation_id),
            sender_id: UserId::new(row.sender_id),
            sender_name: row.sender_name,
            recipient_id: UserId::new(row.recipient_id),
            content: row.content,
            kind: row.kind.parse()?,
            attachment: row.attachment.map(serde_json::from_value).transpose()?,
            status: row.status.parse()?,
            timestamp: row.created_at,
            delivered_at: row.delivered_at,
            read_at: row.read_at,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = chat_messages)]
struct NewMessageRow<'a> {
    conversation_id: &'a str,
    sender_id: &'a str,
    sender_name: &'a str,
    recipient_id: &'a str,
    content: &'a str,
    kind: &'a str,
    attachment: Option<serde_json::Value>,
    status: &'a str,
}

fn rows_to_messages(rows: Vec<MessageRow>) -> ChatResult<Vec<Message>> {
    let mut messages = rows
        .into_iter()
        .map(Message::try_from)
        .collect::<ChatResult<Vec<_>>>()?;
    sort_chronologically(&mut messages);
    Ok(messages)
}

pub struct PgChatStore {
    pool: Arc<DbPool>,
}

impl PgChatStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> ChatResult<DbConnection> {
        self.pool
            .get()
            .await
            .map_err(|e| ChatError::Store(anyhow!("Failed to get database connection: {}", e)))
    }

    async fn load_conversation(
        conn: &mut AsyncPgConnection,
        id: &ConversationId,
    ) -> ChatResult<Option<Conversation>> {
        let row: Option<ConversationRow> = chat_conversations::table
            .find(id.as_str())
            .select(ConversationRow::as_select())
            .first(conn)
            .await
            .optional()?;
        row.map(Conversation::try_from).transpose()
    }

    /// Takes the conversation's row lock for the rest of the transaction.
    /// Sends, reads and reconciliation of one conversation serialize on it.
    async fn lock_conversation(conn: &mut AsyncPgConnection, id: &ConversationId) -> ChatResult<()> {
        let locked: Option<String> = chat_conversations::table
            .find(id.as_str())
            .select(chat_conversations::id)
            .for_update()
            .first(conn)
            .await
            .optional()?;
        match locked {
            Some(_) => Ok(()),
            None => Err(ChatError::NotFound(format!("Conversation {}", id))),
        }
    }

    async fn insert_row(conn: &mut AsyncPgConnection, message: &NewMessage) -> ChatResult<Message> {
        let attachment = message
            .attachment
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        let result = diesel::insert_into(chat_messages::table)
            .values(NewMessageRow {
                conversation_id: message.conversation_id.as_str(),
                sender_id: message.sender_id.as_str(),
                sender_name: &message.sender_name,
                recipient_id: message.recipient_id.as_str(),
                content: &message.content,
                kind: message.kind.as_str(),
                attachment,
                status: MessageStatus::Sent.as_str(),
            })
            .returning(MessageRow::as_returning())
            .get_result::<MessageRow>(conn)
            .await;

        match result {
            Ok(row) => row.try_into(),
            Err(DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, _)) => Err(
                ChatError::NotFound(format!("Conversation {}", message.conversation_id)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    /// Bumps the recipient's counter, and moves the preview only when the
    /// message is not older than the one it currently shows.
    async fn apply_row(conn: &mut AsyncPgConnection, message: &Message) -> ChatResult<Conversation> {
        let now = Utc::now();
        let target = chat_conversations::table.find(message.conversation_id.as_str());

        let bumped = if message.recipient_id < message.sender_id {
            diesel::update(target)
                .set((
                    chat_conversations::unread_low.eq(chat_conversations::unread_low + 1),
                    chat_conversations::updated_at.eq(now),
                ))
                .execute(conn)
                .await?
        } else {
            diesel::update(target)
                .set((
                    chat_conversations::unread_high.eq(chat_conversations::unread_high + 1),
                    chat_conversations::updated_at.eq(now),
                ))
                .execute(conn)
                .await?
        };
        if bumped == 0 {
            return Err(ChatError::NotFound(format!("Conversation {}", message.conversation_id)));
        }

        let preview = message.preview_text();
        diesel::update(
            chat_conversations::table
                .find(message.conversation_id.as_str())
                .filter(chat_conversations::last_message_at.le(message.timestamp)),
        )
            .set((
                chat_conversations::last_message.eq(&preview),
                chat_conversations::last_message_kind.eq(Some(message.kind.as_str())),
                chat_conversations::last_message_at.eq(message.timestamp),
                chat_conversations::last_message_sender.eq(Some(message.sender_id.as_str())),
            ))
            .execute(conn)
            .await?;

        Self::load_conversation(conn, &message.conversation_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("Conversation {}", message.conversation_id)))
    }

    async fn load_messages(conn: &mut AsyncPgConnection, id: &ConversationId) -> ChatResult<Vec<Message>> {
        let rows: Vec<MessageRow> = chat_messages::table
            .filter(chat_messages::conversation_id.eq(id.as_str()))
            .order((chat_messages::created_at.asc(), chat_messages::id.asc()))
            .select(MessageRow::as_select())
            .load(conn)
            .await?;
        rows_to_messages(rows)
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn upsert_profile(&self, participant: &Participant) -> ChatResult<()> {
        let mut conn = self.conn().await?;
        let profile = &participant.profile;
        let row = UserRow {
            user_id: participant.id.as_str().to_string(),
            name: profile.name.clone(),
            email: profile.email.clone(),
            role: profile.role.as_str().to_string(),
            photo_url: profile.photo_url.clone(),
            position: profile.position.clone(),
            company_name: profile.company_name.clone(),
            is_verified: profile.is_verified,
            updated_at: Utc::now(),
        };

        diesel::insert_into(chat_users::table)
            .values(&row)
            .on_conflict(chat_users::user_id)
            .do_update()
            .set((
                chat_users::name.eq(excluded(chat_users::name)),
                chat_users::email.eq(excluded(chat_users::email)),
                chat_users::role.eq(excluded(chat_users::role)),
                chat_users::photo_url.eq(excluded(chat_users::photo_url)),
                chat_users::position.eq(excluded(chat_users::position)),
                chat_users::company_name.eq(excluded(chat_users::company_name)),
                chat_users::is_verified.eq(excluded(chat_users::is_verified)),
                chat_users::updated_at.eq(excluded(chat_users::updated_at)),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn find_profile(&self, user_id: &UserId) -> ChatResult<Option<ParticipantProfile>> {
        let mut conn = self.conn().await?;
        let row: Option<UserRow> = chat_users::table
            .find(user_id.as_str())
            .select(UserRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(ParticipantProfile::try_from).transpose()
    }

    async fn get_or_create_conversation(
        &self,
        a: &Participant,
        b: &Participant,
    ) -> ChatResult<(Conversation, bool)> {
        let fresh = Conversation::between(a, b, Utc::now())?;
        let mut conn = self.conn().await?;

        // The primary key on the pair-derived id settles concurrent creators.
        let inserted = diesel::insert_into(chat_conversations::table)
            .values(NewConversationRow {
                id: fresh.id.as_str(),
                participant_low: fresh.participant_ids[0].as_str(),
                participant_high: fresh.participant_ids[1].as_str(),
                participant_details: serde_json::to_value(&fresh.participant_details)?,
                last_message: "",
                last_message_at: fresh.last_message_time,
                created_at: fresh.created_at,
                updated_at: fresh.created_at,
            })
            .on_conflict(chat_conversations::id)
            .do_nothing()
            .execute(&mut conn)
            .await?;

        let conversation = Self::load_conversation(&mut conn, &fresh.id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("Conversation {}", fresh.id)))?;

        Ok((ensure_pair(conversation, &a.id, &b.id)?, inserted == 1))
    }

    async fn find_conversation(&self, id: &ConversationId) -> ChatResult<Option<Conversation>> {
        let mut conn = self.conn().await?;
        Self::load_conversation(&mut conn, id).await
    }

    async fn conversations_for(&self, user_id: &UserId) -> ChatResult<Vec<Conversation>> {
        let mut conn = self.conn().await?;
        let rows: Vec<ConversationRow> = chat_conversations::table
            .filter(
                chat_conversations::participant_low
                    .eq(user_id.as_str())
                    .or(chat_conversations::participant_high.eq(user_id.as_str())),
            )
            .order(chat_conversations::last_message_at.desc())
            .select(ConversationRow::as_select())
            .load(&mut conn)
            .await?;

        let mut conversations = rows
            .into_iter()
            .map(Conversation::try_from)
            .collect::<ChatResult<Vec<_>>>()?;
        sort_by_recency(&mut conversations);
        Ok(conversations)
    }

    async fn refresh_participant(&self, participant: &Participant) -> ChatResult<Vec<Conversation>> {
        self.upsert_profile(participant).await?;

        let mut updated = Vec::new();
        let mut conn = self.conn().await?;
        for mut conversation in self.conversations_for(&participant.id).await? {
            conversation
                .participant_details
                .insert(participant.id.clone(), participant.profile.clone());

            diesel::update(chat_conversations::table.find(conversation.id.as_str()))
                .set((
                    chat_conversations::participant_details
                        .eq(serde_json::to_value(&conversation.participant_details)?),
                    chat_conversations::updated_at.eq(Utc::now()),
                ))
                .execute(&mut conn)
                .await?;
            updated.push(conversation);
        }
        Ok(updated)
    }

    async fn insert_message(&self, message: NewMessage) -> ChatResult<Message> {
        message.validate()?;
        let mut conn = self.conn().await?;
        Self::insert_row(&mut conn, &message).await
    }

    async fn apply_send(&self, message: &Message) -> ChatResult<Conversation> {
        let mut conn = self.conn().await?;
        Self::apply_row(&mut conn, message).await
    }

    async fn append_message(&self, message: NewMessage) -> ChatResult<Appended> {
        message.validate()?;
        let mut conn = self.conn().await?;

        let (message, conversation) = conn
            .transaction::<_, ChatError, _>(|conn| {
                async move {
                    Self::lock_conversation(conn, &message.conversation_id).await?;
                    let stored = Self::insert_row(conn, &message).await?;
                    let conversation = Self::apply_row(conn, &stored).await?;
                    Ok((stored, conversation))
                }
                .scope_boxed()
            })
            .await?;

        Ok(Appended {
            message,
            conversation: Ok(conversation),
        })
    }

    async fn messages_in(&self, id: &ConversationId, page: Option<Page>) -> ChatResult<Vec<Message>> {
        let mut conn = self.conn().await?;
        let mut query = chat_messages::table
            .filter(chat_messages::conversation_id.eq(id.as_str()))
            .order((chat_messages::created_at.asc(), chat_messages::id.asc()))
            .select(MessageRow::as_select())
            .into_boxed();

        if let Some(page) = page {
            query = query.limit(page.limit as i64).offset(page.offset as i64);
        }

        let rows: Vec<MessageRow> = query.load(&mut conn).await?;
        rows_to_messages(rows)
    }

    async fn find_message(&self, id: MessageId) -> ChatResult<Option<Message>> {
        let mut conn = self.conn().await?;
        let row: Option<MessageRow> = chat_messages::table
            .find(id.0)
            .select(MessageRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(Message::try_from).transpose()
    }

    async fn mark_delivered(&self, id: MessageId) -> ChatResult<Option<Message>> {
        let mut conn = self.conn().await?;
        let row: Option<MessageRow> = diesel::update(
            chat_messages::table
                .filter(chat_messages::id.eq(id.0))
                .filter(chat_messages::status.eq(MessageStatus::Sent.as_str())),
        )
        .set((
            chat_messages::status.eq(MessageStatus::Delivered.as_str()),
            chat_messages::delivered_at.eq(Some(Utc::now())),
        ))
        .returning(MessageRow::as_returning())
        .get_result(&mut conn)
        .await
        .optional()?;

        match row {
            Some(row) => Ok(Some(row.try_into()?)),
            None => {
                let exists: i64 = chat_messages::table
                    .filter(chat_messages::id.eq(id.0))
                    .count()
                    .get_result(&mut conn)
                    .await?;
                if exists == 0 {
                    return Err(ChatError::NotFound(format!("Message {}", id)));
                }
                Ok(None)
            }
        }
    }

    async fn mark_read(&self, id: &ConversationId, reader: &UserId) -> ChatResult<u64> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, ChatError, _>(|conn| {
            async move {
                Self::lock_conversation(conn, id).await?;
                let conversation = Self::load_conversation(conn, id)
                    .await?
                    .ok_or_else(|| ChatError::NotFound(format!("Conversation {}", id)))?;

                let transitioned = diesel::update(
                    chat_messages::table
                        .filter(chat_messages::conversation_id.eq(id.as_str()))
                        .filter(chat_messages::recipient_id.eq(reader.as_str()))
                        .filter(chat_messages::status.ne(MessageStatus::Read.as_str())),
                )
                .set((
                    chat_messages::status.eq(MessageStatus::Read.as_str()),
                    chat_messages::read_at.eq(Some(Utc::now())),
                ))
                .execute(conn)
                .await?;

                let target = chat_conversations::table.find(id.as_str());
                if &conversation.participant_ids[0] == reader {
                    diesel::update(target)
                        .set(chat_conversations::unread_low.eq(0))
                        .execute(conn)
                        .await?;
                } else if &conversation.participant_ids[1] == reader {
                    diesel::update(target)
                        .set(chat_conversations::unread_high.eq(0))
                        .execute(conn)
                        .await?;
                }

                Ok(transitioned as u64)
            }
            .scope_boxed()
        })
        .await
    }

    async fn reconcile_conversation(&self, id: &ConversationId) -> ChatResult<Option<Conversation>> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, ChatError, _>(|conn| {
            async move {
                match Self::lock_conversation(conn, id).await {
                    Ok(()) => {}
                    Err(ChatError::NotFound(_)) => return Ok(None),
                    Err(e) => return Err(e),
                }
                let Some(mut conversation) = Self::load_conversation(conn, id).await? else {
                    return Ok(None);
                };
                let messages = Self::load_messages(conn, id).await?;
                conversation.reconcile_with(&messages);

                let [low, high] = &conversation.participant_ids;
                diesel::update(chat_conversations::table.find(id.as_str()))
                    .set((
                        chat_conversations::last_message.eq(&conversation.last_message),
                        chat_conversations::last_message_kind
                            .eq(conversation.last_message_kind.map(|k| k.as_str())),
                        chat_conversations::last_message_at.eq(conversation.last_message_time),
                        chat_conversations::last_message_sender
                            .eq(conversation.last_message_sender_id.as_ref().map(|s| s.as_str())),
                        chat_conversations::unread_low.eq(conversation.unread_for(low) as i32),
                        chat_conversations::unread_high.eq(conversation.unread_for(high) as i32),
                        chat_conversations::updated_at.eq(Utc::now()),
                    ))
                    .execute(conn)
                    .await?;

                Ok(Some(conversation))
            }
            .scope_boxed()
        })
        .await
    }

    async fn conversation_ids(&self) -> ChatResult<Vec<ConversationId>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = chat_conversations::table
            .select(chat_conversations::id)
            .order(chat_conversations::id.asc())
            .load(&mut conn)
            .await?;
        Ok(ids.into_iter().map(ConversationId::new).collect())
    }
}
