//! API route definitions.

use axum::http::{header, Method};
use axum::routing::{get, post};
use axum::{middleware, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::notify;
use crate::stt;

use super::auth;
use super::chat;
use super::handlers;
use super::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    // Mobile clients call from app webviews and arbitrary origins; the
    // API carries no cookies, so a permissive envelope is fine.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    // API routes; bearer auth applies when a token is configured.
    let api_routes = Router::new()
        .route("/api/instances", get(handlers::instances))
        .route("/api/chat", post(chat::chat_handler))
        .route("/api/stt/stream", get(stt::ws_handler))
        .route("/api/notifications/ws", get(notify::handler::ws_handler))
        .route("/api/notify", post(handlers::notify))
        .route("/api/fcm/register", post(handlers::register_push_token))
        .route("/api/fcm/push", post(handlers::send_push))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ))
        .with_state(state.clone());

    // Public routes (no authentication).
    let public_routes = Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .with_state(state);

    Router::new()
        .merge(public_routes)
        .merge(api_routes)
        .layer(cors)
        .layer(trace_layer)
}
