use axum::http::StatusCode;
use tracing::{debug, error};

use kvant_gateway::LifecycleError;

/// Maps a refused operation onto the HTTP status returned to the client.
pub fn status_for(err: LifecycleError) -> StatusCode {
    match err {
        LifecycleError::Validation(reason) => {
            debug!("Rejected request: {}", reason);
            StatusCode::BAD_REQUEST
        }
        LifecycleError::Authorization(reason) => {
            debug!("Forbidden: {}", reason);
            StatusCode::FORBIDDEN
        }
        LifecycleError::NotFound(_) => StatusCode::NOT_FOUND,
        LifecycleError::Storage(e) => {
            error!("Storage failure: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
