use std::sync::Arc;

use kvant_gateway::MessageEngine;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub engine: MessageEngine,
    pub jwt_secret: String,
}
