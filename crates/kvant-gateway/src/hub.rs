use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use kvant_types::events::ServerEvent;
use kvant_types::models::UserId;

/// A serialized event, shared between every queue it is delivered to.
pub type Frame = Arc<str>;

/// The hub's end of a session: the bounded outbound queue plus the identity
/// used to tell a live session apart from the one that replaced it.
///
/// Not `Clone`: once the hub drops the handle, the session's queue closes.
#[derive(Debug)]
pub struct SessionHandle {
    pub user_id: UserId,
    pub conn_id: Uuid,
    tx: mpsc::Sender<Frame>,
}

impl SessionHandle {
    pub fn new(user_id: impl Into<UserId>, capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            user_id: user_id.into(),
            conn_id: Uuid::new_v4(),
            tx,
        };
        (handle, rx)
    }
}

enum HubCommand {
    Register(SessionHandle),
    Unregister { user_id: UserId, conn_id: Uuid },
    Send { user_id: UserId, frame: Frame, kind: &'static str },
    IsOnline { user_id: UserId, reply: oneshot::Sender<bool> },
    OnlineUsers { reply: oneshot::Sender<Vec<UserId>> },
}

/// Handle to the connection registry.
///
/// The registry itself lives in a single task and is only ever touched by
/// that task; every public method just enqueues a command. Commands are
/// applied in submission order. The task exits once every `Hub` clone has
/// been dropped, closing all remaining session queues.
#[derive(Clone)]
pub struct Hub {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl Hub {
    /// Starts the registry task on the current tokio runtime.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));
        Self { tx }
    }

    /// Makes `session` the current session of its user. A previous session
    /// for the same user is dropped from the registry, which closes its queue.
    pub fn register(&self, session: SessionHandle) {
        self.submit(HubCommand::Register(session));
    }

    /// Removes the user's session, but only if it is still `conn_id`.
    pub fn unregister(&self, user_id: &str, conn_id: Uuid) {
        self.submit(HubCommand::Unregister {
            user_id: user_id.to_string(),
            conn_id,
        });
    }

    /// Fire-and-forget delivery. Dropped silently if the user is offline;
    /// a session whose queue is full is evicted.
    pub fn send_to_user(&self, user_id: &str, event: &ServerEvent) {
        let frame: Frame = match serde_json::to_string(event) {
            Ok(json) => json.into(),
            Err(e) => {
                warn!(kind = event.kind(), "Failed to serialize event: {}", e);
                return;
            }
        };
        self.submit(HubCommand::Send {
            user_id: user_id.to_string(),
            frame,
            kind: event.kind(),
        });
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        self.submit(HubCommand::IsOnline {
            user_id: user_id.to_string(),
            reply,
        });
        rx.await.unwrap_or(false)
    }

    /// Sorted list of users with a registered session.
    pub async fn online_users(&self) -> Vec<UserId> {
        let (reply, rx) = oneshot::channel();
        self.submit(HubCommand::OnlineUsers { reply });
        rx.await.unwrap_or_default()
    }

    fn submit(&self, cmd: HubCommand) {
        // Only fails if the registry task is gone, i.e. the runtime is shutting down.
        if self.tx.send(cmd).is_err() {
            debug!("Hub is stopped, dropping command");
        }
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<HubCommand>) {
    let mut registry = Registry::default();
    while let Some(cmd) = rx.recv().await {
        registry.apply(cmd);
    }
    debug!("Hub stopped with {} sessions registered", registry.sessions.len());
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<UserId, SessionHandle>,
}

impl Registry {
    fn apply(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register(session) => self.register(session),
            HubCommand::Unregister { user_id, conn_id } => self.unregister(&user_id, conn_id),
            HubCommand::Send { user_id, frame, kind } => self.deliver(&user_id, frame, kind),
            HubCommand::IsOnline { user_id, reply } => {
                let _ = reply.send(self.sessions.contains_key(&user_id));
            }
            HubCommand::OnlineUsers { reply } => {
                let _ = reply.send(self.online_users());
            }
        }
    }

    fn register(&mut self, session: SessionHandle) {
        let user_id = session.user_id.clone();
        let conn_id = session.conn_id;
        if let Some(old) = self.sessions.insert(user_id.clone(), session) {
            info!(%user_id, old = %old.conn_id, new = %conn_id, "Session replaced");
        } else {
            info!(%user_id, %conn_id, "User online");
        }
        self.broadcast_presence();
    }

    fn unregister(&mut self, user_id: &str, conn_id: Uuid) {
        match self.sessions.get(user_id) {
            Some(current) if current.conn_id == conn_id => {
                self.sessions.remove(user_id);
                info!(%user_id, %conn_id, "User offline");
                self.broadcast_presence();
            }
            Some(_) => trace!(%user_id, %conn_id, "Ignoring unregister of superseded session"),
            None => trace!(%user_id, %conn_id, "Ignoring unregister of unknown session"),
        }
    }

    fn deliver(&mut self, user_id: &str, frame: Frame, kind: &'static str) {
        let Some(session) = self.sessions.get(user_id) else {
            trace!(%user_id, kind, "Recipient offline, dropping event");
            return;
        };
        if Self::offer(session, frame) {
            trace!(%user_id, kind, "Event queued");
            return;
        }
        self.sessions.remove(user_id);
        self.broadcast_presence();
    }

    /// Returns false if the session must be evicted.
    fn offer(session: &SessionHandle, frame: Frame) -> bool {
        match session.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(user_id = %session.user_id, conn_id = %session.conn_id, "Outbound queue full, evicting session");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(user_id = %session.user_id, conn_id = %session.conn_id, "Session already gone, evicting");
                false
            }
        }
    }

    fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.sessions.keys().cloned().collect();
        users.sort();
        users
    }

    /// Sends the presence snapshot to everyone. Sessions that cannot take it
    /// are evicted, and the survivors get a fresh snapshot without them.
    fn broadcast_presence(&mut self) {
        loop {
            let event = ServerEvent::OnlineUsers {
                users: self.online_users(),
            };
            let frame: Frame = match serde_json::to_string(&event) {
                Ok(json) => json.into(),
                Err(e) => {
                    warn!("Failed to serialize presence: {}", e);
                    return;
                }
            };

            let evicted: Vec<UserId> = self
                .sessions
                .values()
                .filter(|session| !Self::offer(session, frame.clone()))
                .map(|session| session.user_id.clone())
                .collect();
            if evicted.is_empty() {
                return;
            }
            for user_id in evicted {
                self.sessions.remove(&user_id);
            }
        }
    }
}
