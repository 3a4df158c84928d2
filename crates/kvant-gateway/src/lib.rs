pub mod error;
pub mod hub;
pub mod lifecycle;
pub mod session;

pub use error::LifecycleError;
pub use hub::{Hub, SessionHandle};
pub use lifecycle::MessageEngine;
pub use session::{DisconnectReason, SessionConfig, run_session};
