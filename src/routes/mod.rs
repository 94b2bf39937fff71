//! Router assembly: HTTP endpoints, WebSocket upgrade, static files, CORS, and HTTP tracing.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    services::{ServeDir, ServeFile},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::state::AppState;

pub mod http;
pub mod ws;

/// Build the application router with:
/// - WebSocket at `/ws` (session subscription + streamed tutor replies)
/// - JSON API under `/api/v1/...`, SSE for `/api/v1/chat/stream`
/// - Static SPA from `./static` with index fallback
/// - CORS (allow any origin/method/headers)
/// - HTTP trace layer (per-request spans w/ method, path, status, latency)
pub fn build_router(state: Arc<AppState>) -> Router {
    let static_service = ServeDir::new("./static")
        .append_index_html_on_directories(true)
        .not_found_service(ServeFile::new("./static/index.html"));

    Router::new()
        .route("/ws", get(ws::ws_upgrade))
        .route("/api/v1/health", get(http::http_health))
        // Tutor
        .route("/api/v1/chat", post(http::http_post_chat))
        .route("/api/v1/chat/stream", post(http::http_post_chat_stream))
        .route("/api/v1/generate", post(http::http_post_generate))
        // Quiz
        .route("/api/v1/quiz/question", get(http::http_get_question))
        .route("/api/v1/quiz/grade", post(http::http_post_grade))
        // Sessions + settings
        .route("/api/v1/sessions", post(http::http_post_session).get(http::http_list_sessions))
        .route("/api/v1/sessions/:id", get(http::http_get_session).delete(http::http_delete_session))
        .route("/api/v1/sessions/:id/messages", get(http::http_list_messages))
        .route("/api/v1/users/:uid/settings", get(http::http_get_settings).put(http::http_put_settings))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .fallback_service(static_service)
}
