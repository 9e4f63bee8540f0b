//! Server-Sent Events rendition of the change feed: one full snapshot per event.

use axum::{
    extract::{Extension, Path},
    response::sse::{Event, KeepAlive, Sse},
};
use chat_core::ConversationId;
use chat_messaging::Subscription;
use futures_util::stream::{self, Stream};
use serde::Serialize;
use std::convert::Infallible;

use crate::auth::AuthenticatedUser;
use crate::error::ApiResult;
use crate::server::ApiState;

fn snapshot_stream<T>(
    subscription: Subscription<T>,
    name: &'static str,
) -> impl Stream<Item = Result<Event, Infallible>>
where
    T: Clone + Serialize + Send + Sync + 'static,
{
    stream::unfold(subscription, move |mut subscription| async move {
        let snapshot = subscription.next().await?;
        let event = match Event::default().event(name).json_data(&snapshot) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!("Failed to encode {} snapshot: {}", name, e);
                Event::default().event("error").data("snapshot encoding failed")
            }
        };
        Some((Ok(event), subscription))
    })
}

pub async fn conversations_feed(
    Extension(state): Extension<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let subscription = state.service.subscribe_conversations(user.id()).await?;
    tracing::debug!("Conversation feed opened for {}", user.id());
    Ok(Sse::new(snapshot_stream(subscription, "conversations")).keep_alive(KeepAlive::default()))
}

pub async fn messages_feed(
    Extension(state): Extension<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let subscription = state
        .service
        .subscribe_messages(user.id(), &ConversationId::new(id))
        .await?;
    Ok(Sse::new(snapshot_stream(subscription, "messages")).keep_alive(KeepAlive::default()))
}
