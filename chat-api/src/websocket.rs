use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Extension, Query,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chat_core::{ChatError, ChatResult, ConversationId, MessageId, Page, UserId, UserIdentity};
use chat_messaging::{ChatEvent, ConnectionHub, MessageDraft, MessagingService};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing;

use crate::auth::verify_token;
use crate::server::ApiState;

#[derive(Deserialize)]
pub struct WsQuery {
    token: String,
}

/// Client-to-server frames, `{"event": "<name>", "data": {...}}`.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    GetConversations,
    GetMessages {
        conversation_id: ConversationId,
        #[serde(default)]
        limit: Option<u32>,
        #[serde(default)]
        offset: Option<u32>,
    },
    SendMessage {
        #[serde(default)]
        conversation_id: Option<ConversationId>,
        #[serde(default)]
        recipient_id: Option<UserId>,
        #[serde(flatten)]
        draft: MessageDraft,
    },
    MarkRead {
        conversation_id: ConversationId,
    },
    MessageReceived {
        message_id: MessageId,
    },
    TypingStart {
        conversation_id: ConversationId,
    },
    TypingStop {
        conversation_id: ConversationId,
    },
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    Extension(state): Extension<ApiState>,
) -> Response {
    let identity = match verify_token(&query.token, &state.config().server.jwt_secret) {
        Ok(identity) => identity,
        Err(status) => return status.into_response(),
    };
    let Some(hub) = state.hub.clone() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    ws.on_upgrade(move |socket| handle_socket(socket, identity, state.service, hub))
}

async fn handle_socket(
    socket: WebSocket,
    identity: UserIdentity,
    service: MessagingService,
    hub: Arc<ConnectionHub>,
) {
    let presence = match service.connect(&identity).await {
        Ok(guard) => guard,
        Err(e) => {
            tracing::error!("Failed to bring {} online: {}", identity.id, e);
            return;
        }
    };
    let (connection_id, mut outbound) = hub.register(&identity.id);
    tracing::info!(
        "WebSocket connection {} established for user: {}",
        connection_id,
        identity.id
    );

    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let frame = match serde_json::to_string(&event) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::error!("Failed to encode {} event: {}", event.name(), e);
                    continue;
                }
            };
            if let Err(e) = sender.send(WsMessage::Text(frame)).await {
                tracing::debug!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
    });

    let recv_service = service.clone();
    let recv_hub = hub.clone();
    let recv_identity = identity.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => {
                    let reply = match serde_json::from_str::<ClientEvent>(&text) {
                        Ok(event) => match dispatch(&recv_service, &recv_identity, event).await {
                            Ok(reply) => reply,
                            Err(e) => {
                                tracing::warn!("Event from {} failed: {}", recv_identity.id, e);
                                Some(ChatEvent::from(&e))
                            }
                        },
                        Err(e) => Some(ChatEvent::Error {
                            message: format!("Invalid event: {}", e),
                            retryable: false,
                        }),
                    };
                    if let Some(reply) = reply {
                        recv_hub.push_to(&recv_identity.id, connection_id, &reply);
                    }
                }
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("WebSocket read error: {}", e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {}
        _ = &mut recv_task => {}
    }
    send_task.abort();
    recv_task.abort();

    hub.unregister(&identity.id, connection_id);
    if presence.close().is_some() {
        service.clear_typing_of(&identity.id).await;
    }
    tracing::info!("WebSocket connection {} closed for user: {}", connection_id, identity.id);
}

/// Runs one client event. The returned event, if any, is a reply for the requesting connection only.
pub async fn dispatch(
    service: &MessagingService,
    identity: &UserIdentity,
    event: ClientEvent,
) -> ChatResult<Option<ChatEvent>> {
    match event {
        ClientEvent::GetConversations => {
            let previews = service.conversation_previews(&identity.id).await?;
            Ok(Some(ChatEvent::ConversationsList(previews)))
        }
        ClientEvent::GetMessages {
            conversation_id,
            limit,
            offset,
        } => {
            let page = Page {
                limit: limit.unwrap_or(service.config().message_page_limit),
                offset: offset.unwrap_or(0),
            };
            let messages = service
                .open_conversation(&identity.id, &conversation_id, Some(page))
                .await?;
            Ok(Some(ChatEvent::MessagesList {
                conversation_id,
                messages,
            }))
        }
        ClientEvent::SendMessage {
            conversation_id,
            recipient_id,
            draft,
        } => {
            match (conversation_id, recipient_id) {
                (Some(id), _) => service.send_message(identity, &id, draft).await?,
                (None, Some(recipient)) => service.send_to_user(identity, &recipient, draft).await?,
                (None, None) => {
                    return Err(ChatError::InvalidParticipants(
                        "conversation_id or recipient_id is required".to_string(),
                    ))
                }
            };
            Ok(None)
        }
        ClientEvent::MarkRead { conversation_id } => {
            service.mark_read(&identity.id, &conversation_id).await?;
            Ok(None)
        }
        ClientEvent::MessageReceived { message_id } => {
            service.mark_delivered(&identity.id, message_id).await?;
            Ok(None)
        }
        ClientEvent::TypingStart { conversation_id } => {
            service.set_typing(&identity.id, &conversation_id, true).await?;
            Ok(None)
        }
        ClientEvent::TypingStop { conversation_id } => {
            service.set_typing(&identity.id, &conversation_id, false).await?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_core::{ChatContext, Config, MessageStatus, Participant, UserRole};
    use chat_messaging::Transport;

    fn alice() -> UserIdentity {
        UserIdentity::new("1", "Alice", "alice@example.com", UserRole::User)
    }

    fn bob() -> UserIdentity {
        UserIdentity::new("2", "Bob", "bob@example.com", UserRole::Employer)
    }

    fn service() -> (MessagingService, Arc<ConnectionHub>) {
        let hub = Arc::new(ConnectionHub::new());
        let transport: Arc<dyn Transport> = hub.clone();
        (
            MessagingService::new(ChatContext::in_memory(Config::default()), transport),
            hub,
        )
    }

    #[test]
    fn test_client_event_frames() {
        let event: ClientEvent = serde_json::from_str(r#"{"event":"get_conversations"}"#).unwrap();
        assert_eq!(event, ClientEvent::GetConversations);

        let event: ClientEvent = serde_json::from_str(
            r#"{"event":"send_message","data":{"recipient_id":"2","content":"Hi Bob"}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            ClientEvent::SendMessage {
                conversation_id: None,
                recipient_id: Some(UserId::from("2")),
                draft: MessageDraft::text("Hi Bob"),
            }
        );

        let event: ClientEvent =
            serde_json::from_str(r#"{"event":"typing_start","data":{"conversation_id":"conv_1_2"}}"#)
                .unwrap();
        assert_eq!(
            event,
            ClientEvent::TypingStart {
                conversation_id: ConversationId::from("conv_1_2")
            }
        );
    }

    #[tokio::test]
    async fn test_socket_round_trip_between_two_users() {
        let (service, hub) = service();
        let bob_presence = service.connect(&bob()).await.unwrap();
        let (_, mut bob_rx) = hub.register(&bob().id);

        let reply = dispatch(
            &service,
            &alice(),
            ClientEvent::SendMessage {
                conversation_id: None,
                recipient_id: Some(bob().id),
                draft: MessageDraft::text("Hi Bob"),
            },
        )
        .await
        .unwrap();
        assert!(reply.is_none());

        let received = loop {
            match bob_rx.recv().await {
                Some(ChatEvent::NewMessage(message)) => break message,
                Some(_) => continue,
                None => panic!("bob's queue closed"),
            }
        };
        assert_eq!(received.content, "Hi Bob");

        let reply = dispatch(
            &service,
            &bob(),
            ClientEvent::GetMessages {
                conversation_id: received.conversation_id.clone(),
                limit: None,
                offset: None,
            },
        )
        .await
        .unwrap();
        match reply {
            Some(ChatEvent::MessagesList { messages, .. }) => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].status, MessageStatus::Read);
            }
            other => panic!("unexpected reply {:?}", other),
        }
        bob_presence.close();
    }

    #[tokio::test]
    async fn test_outsider_events_are_rejected() {
        let (service, _) = service();
        let conversation = service
            .get_or_create_conversation(&Participant::from(&alice()), &Participant::from(&bob()))
            .await
            .unwrap();
        let carol = UserIdentity::new("3", "Carol", "carol@example.com", UserRole::User);

        let err = dispatch(
            &service,
            &carol,
            ClientEvent::MarkRead {
                conversation_id: conversation.id,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ChatError::ParticipantMismatch { .. }));
        match ChatEvent::from(&err) {
            ChatEvent::Error { retryable, .. } => assert!(!retryable),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
