use thiserror::Error;
use uuid::Uuid;

/// Why a lifecycle operation was refused. Every variant means no state was
/// changed and no notification was sent.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Malformed or missing input.
    #[error("invalid request: {0}")]
    Validation(&'static str),

    /// The actor is not a party to the message, or lacks the sender role.
    #[error("not permitted: {0}")]
    Authorization(&'static str),

    #[error("message {0} not found")]
    NotFound(Uuid),

    /// The persistence layer failed; safe to retry.
    #[error("storage failure: {0}")]
    Storage(#[from] anyhow::Error),
}

impl LifecycleError {
    /// Client mistakes, as opposed to server-side failures.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Storage(_))
    }
}
