pub mod config;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Query, State, WebSocketUpgrade, ws::rejection::WebSocketUpgradeRejection},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use futures_util::StreamExt;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use kvant_api::AppState;
use kvant_api::middleware::{bearer_token, decode_claims};
use kvant_gateway::{SessionConfig, run_session};

use crate::config::ServerConfig;

#[derive(Clone)]
struct ServerState {
    app: AppState,
    session: SessionConfig,
}

/// All routes live under `/api`.
pub fn build_router(app: AppState, config: &ServerConfig) -> Result<Router> {
    let state = ServerState {
        app: app.clone(),
        session: config.session.clone(),
    };

    let gateway_routes = Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_upgrade))
        .with_state(state);

    let api = Router::new()
        .merge(gateway_routes)
        .merge(kvant_api::routes(app));

    Ok(Router::new()
        .nest("/api", api)
        .layer(cors_layer(config.cors_origin.as_deref())?)
        .layer(TraceLayer::new_for_http()))
}

fn cors_layer(origin: Option<&str>) -> Result<CorsLayer> {
    let Some(origin) = origin else {
        return Ok(CorsLayer::permissive());
    };
    let origin: HeaderValue = origin
        .parse()
        .with_context(|| format!("invalid CORS origin '{}'", origin))?;
    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]))
}

async fn health(State(state): State<ServerState>) -> impl IntoResponse {
    let online = state.app.engine.hub().online_users().await.len();
    Json(serde_json::json!({ "status": "ok", "online": online }))
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// Browsers cannot set headers on a WebSocket handshake, so the token may
/// also come as `?token=`. Authentication is checked before the upgrade itself.
async fn ws_upgrade(
    State(state): State<ServerState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(token) = query.token.as_deref().or_else(|| bearer_token(&headers)) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let Some(claims) = decode_claims(&state.app.jwt_secret, token) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let engine = state.app.engine.clone();
    let session = state.session;
    debug!(user_id = %claims.sub, "Upgrading WebSocket");

    ws.max_message_size(session.max_frame_bytes)
        .on_upgrade(move |socket| async move {
            let (sink, stream) = socket.split();
            run_session(sink, stream, engine, claims.sub, session).await;
        })
}
