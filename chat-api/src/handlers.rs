use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::Json,
};
use chat_core::{
    ChatError, ConversationId, ConversationPreview, Message, MessageId, Page, Participant,
    UserId, UserIdentity, UserRole,
};
use chat_messaging::MessageDraft;
use serde::Deserialize;
use serde_json::Value;

use crate::auth::{self, AuthenticatedUser};
use crate::error::{ApiError, ApiResult};
use crate::server::ApiState;

pub async fn health() -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "chat-api"
    }))
}

#[derive(Deserialize)]
pub struct TokenRequest {
    pub user_id: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub role: Option<UserRole>,
}

/// Issues a token for local development. Disabled unless `ISSUE_DEV_TOKENS` is set.
pub async fn generate_token(
    Extension(state): Extension<ApiState>,
    Json(req): Json<TokenRequest>,
) -> Result<Json<Value>, ApiError> {
    if !state.config().server.issue_dev_tokens {
        return Err(ApiError::NotAvailable("token issuing is disabled".to_string()));
    }

    let identity = UserIdentity::new(
        req.user_id,
        &req.name,
        &req.email,
        req.role.unwrap_or(UserRole::User),
    );
    let token = auth::generate_token(&identity, &state.config().server.jwt_secret, 30)
        .map_err(|_| ApiError::Chat(ChatError::Store(anyhow::anyhow!("failed to sign token"))))?;

    Ok(Json(serde_json::json!({
        "token": token,
        "user_id": identity.id,
        "expires_in_days": 30,
    })))
}

pub async fn get_conversations(
    Extension(state): Extension<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> ApiResult<Json<Vec<ConversationPreview>>> {
    let previews = state.service.conversation_previews(user.id()).await?;
    Ok(Json(previews))
}

#[derive(Deserialize)]
pub struct StartConversationRequest {
    pub participant_id: UserId,
}

pub async fn start_conversation(
    Extension(state): Extension<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(req): Json<StartConversationRequest>,
) -> ApiResult<Json<ConversationPreview>> {
    let conversation = state
        .service
        .start_conversation_with(&user.0, &req.participant_id)
        .await?;
    let preview = conversation
        .preview_for(user.id(), state.service.is_online(&req.participant_id))
        .ok_or_else(|| ApiError::BadRequest("conversation has no other participant".to_string()))?;
    Ok(Json(preview))
}

#[derive(Deserialize)]
pub struct MessagesQuery {
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

pub async fn get_messages(
    Extension(state): Extension<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
    Query(params): Query<MessagesQuery>,
) -> ApiResult<Json<Vec<Message>>> {
    let page = Page {
        limit: params
            .limit
            .unwrap_or(state.service.config().message_page_limit),
        offset: params.offset.unwrap_or(0),
    };
    let messages = state
        .service
        .list_messages(user.id(), &ConversationId::new(id), Some(page))
        .await?;
    Ok(Json(messages))
}

pub async fn mark_read(
    Extension(state): Extension<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let id = ConversationId::new(id);
    let read = state.service.mark_read(user.id(), &id).await?;
    Ok(Json(serde_json::json!({
        "conversation_id": id,
        "read": read,
    })))
}

#[derive(Deserialize)]
pub struct TypingRequest {
    pub typing: bool,
}

pub async fn set_typing(
    Extension(state): Extension<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
    Json(req): Json<TypingRequest>,
) -> ApiResult<Json<Value>> {
    state
        .service
        .set_typing(user.id(), &ConversationId::new(id), req.typing)
        .await?;
    Ok(Json(serde_json::json!({"status": "ok"})))
}

#[derive(Deserialize)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    #[serde(default)]
    pub recipient_id: Option<UserId>,
    #[serde(flatten)]
    pub draft: MessageDraft,
}

pub async fn send_message(
    Extension(state): Extension<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<(StatusCode, Json<Message>)> {
    let message = match (req.conversation_id, req.recipient_id) {
        (Some(id), _) => state.service.send_message(&user.0, &id, req.draft).await?,
        (None, Some(recipient)) => state.service.send_to_user(&user.0, &recipient, req.draft).await?,
        (None, None) => {
            return Err(ApiError::BadRequest(
                "conversation_id or recipient_id is required".to_string(),
            ))
        }
    };
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn mark_delivered(
    Extension(state): Extension<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let message_id: i64 = id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid message id {}", id)))?;
    let delivered = state
        .service
        .mark_delivered(user.id(), MessageId(message_id))
        .await?;
    Ok(Json(serde_json::json!({
        "message_id": message_id,
        "delivered": delivered.is_some(),
    })))
}

#[derive(Deserialize)]
pub struct ProfileUpdate {
    #[serde(default)]
    pub photo_url: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub is_verified: Option<bool>,
}

pub async fn update_profile(
    Extension(state): Extension<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(req): Json<ProfileUpdate>,
) -> ApiResult<Json<Value>> {
    let mut participant = Participant::from(&user.0);
    if let Some(stored) = state.service.profile(user.id()).await? {
        participant.profile.photo_url = stored.photo_url;
        participant.profile.position = stored.position;
        participant.profile.company_name = stored.company_name;
        participant.profile.is_verified = stored.is_verified;
    }

    let profile = &mut participant.profile;
    if req.photo_url.is_some() {
        profile.photo_url = req.photo_url;
    }
    if req.position.is_some() {
        profile.position = req.position;
    }
    if req.company_name.is_some() {
        profile.company_name = req.company_name;
    }
    if let Some(verified) = req.is_verified {
        if user.0.role != UserRole::Admin {
            return Err(ApiError::Forbidden("only admins can change verification".to_string()));
        }
        profile.is_verified = verified;
    }

    let updated = state.service.update_profile(&participant).await?;
    Ok(Json(serde_json::json!({
        "profile": participant.profile,
        "conversations_updated": updated,
    })))
}

pub async fn get_presence(
    Extension(state): Extension<ApiState>,
    Path(user_id): Path<String>,
) -> Json<Value> {
    let user_id = UserId::new(user_id);
    match state.service.presence_of(&user_id) {
        Some(record) => Json(serde_json::json!(record)),
        None => Json(serde_json::json!({
            "user_id": user_id,
            "state": "offline",
            "last_changed": null,
        })),
    }
}

pub async fn reconcile(
    Extension(state): Extension<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> ApiResult<Json<Value>> {
    if user.0.role != UserRole::Admin {
        return Err(ApiError::Forbidden("admin role required".to_string()));
    }
    tracing::info!("Reconcile sweep requested by {}", user.id());
    let repaired = state.service.reconcile_all().await?;
    Ok(Json(serde_json::json!({"repaired": repaired})))
}
