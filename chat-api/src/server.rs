use anyhow::{anyhow, Result};
use axum::{
    extract::Extension,
    middleware,
    routing::{get, post, put},
    Router,
};
use chat_core::{ChatContext, Config, TransportKind};
use chat_messaging::{ConnectionHub, FeedTransport, MessagingService, Transport};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing;

use crate::auth;
use crate::handlers;
use crate::sse;
use crate::websocket;

/// Shared handler state, injected as a request extension.
#[derive(Clone)]
pub struct ApiState {
    pub service: MessagingService,
    /// Present only when the socket transport is configured.
    pub hub: Option<Arc<ConnectionHub>>,
}

impl ApiState {
    pub fn new(ctx: ChatContext) -> Self {
        match ctx.config.messaging.transport {
            TransportKind::Socket => {
                let hub = Arc::new(ConnectionHub::new());
                let transport: Arc<dyn Transport> = hub.clone();
                ApiState {
                    service: MessagingService::new(ctx, transport),
                    hub: Some(hub),
                }
            }
            TransportKind::Feed => ApiState {
                service: MessagingService::new(ctx, Arc::new(FeedTransport)),
                hub: None,
            },
        }
    }

    pub fn config(&self) -> &Config {
        &self.service.context().config
    }
}

fn cors_layer() -> CorsLayer {
    if let Ok(origins) = env::var("CORS_ORIGINS") {
        let mut cors = CorsLayer::new();
        for origin in origins.split(',').map(|s| s.trim()) {
            if let Ok(parsed) = origin.parse::<axum::http::HeaderValue>() {
                cors = cors.allow_origin(parsed);
            }
        }
        cors.allow_methods(Any).allow_headers(Any)
    } else {
        tracing::warn!("CORS_ORIGINS not set, using permissive CORS. Set CORS_ORIGINS for production!");
        CorsLayer::permissive()
    }
}

pub fn router(state: ApiState) -> Router {
    let mut app = Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/auth/token", post(handlers::generate_token))
        .route(
            "/api/v1/conversations",
            get(handlers::get_conversations).post(handlers::start_conversation),
        )
        .route("/api/v1/conversations/:id/messages", get(handlers::get_messages))
        .route("/api/v1/conversations/:id/read", post(handlers::mark_read))
        .route("/api/v1/conversations/:id/typing", post(handlers::set_typing))
        .route("/api/v1/messages", post(handlers::send_message))
        .route("/api/v1/messages/:id/delivered", post(handlers::mark_delivered))
        .route("/api/v1/profile", put(handlers::update_profile))
        .route("/api/v1/presence/:user_id", get(handlers::get_presence))
        .route("/api/v1/admin/reconcile", post(handlers::reconcile))
        .route("/api/v1/feed/conversations", get(sse::conversations_feed))
        .route("/api/v1/feed/conversations/:id/messages", get(sse::messages_feed));

    if state.hub.is_some() {
        app = app.route("/ws", get(websocket::websocket_handler));
    }

    app.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(Extension(state))
            .layer(middleware::from_fn(auth::auth_middleware))
            .layer(cors_layer()),
    )
}

pub async fn run(state: ApiState) -> Result<()> {
    let server = &state.config().server;
    let addr: SocketAddr = format!("{}:{}", server.host, server.api_port)
        .parse()
        .map_err(|e| anyhow!("Invalid listen address {}:{}: {}", server.host, server.api_port, e))?;

    let transport = state.config().messaging.transport;
    let app = router(state.clone());

    tracing::info!("Starting API server on {} ({:?} transport)", addr, transport);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
