pub mod error;
pub mod messages;
pub mod middleware;
pub mod reactions;
pub mod state;

use axum::{
    Router, middleware as axum_middleware,
    routing::{delete, get, post, put},
};

pub use state::{AppState, AppStateInner};

/// Authenticated message routes, relative to `/api`.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/messages/recent", get(messages::recent_chats))
        .route("/messages/{id}", get(messages::get_conversation))
        .route("/messages/{id}/read", post(messages::mark_read))
        .route("/messages/{id}/edit", put(messages::edit_message))
        .route("/messages/{id}/delete", delete(messages::delete_message))
        .route(
            "/messages/{id}/reactions",
            post(reactions::add_reaction).delete(reactions::remove_reaction),
        )
        .route("/messages/{id}/pin", post(messages::pin_message))
        .route("/messages/{id}/unpin", post(messages::unpin_message))
        .layer(axum_middleware::from_fn_with_state(state.clone(), middleware::require_auth))
        .with_state(state)
}
