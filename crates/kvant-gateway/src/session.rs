use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use kvant_types::events::ClientCommand;
use kvant_types::models::UserId;

use crate::hub::{Frame, SessionHandle};
use crate::lifecycle::{MessageEngine, SendRequest};

/// Per-connection limits and heartbeat timing.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Outbound queue capacity. A session that falls this far behind is evicted.
    pub outbound_capacity: usize,
    /// Inbound frames larger than this close the connection.
    pub max_frame_bytes: usize,
    pub ping_interval: Duration,
    /// How long without a pong before the peer is considered gone.
    pub pong_timeout: Duration,
    /// Upper bound on a single outbound write.
    pub write_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            max_frame_bytes: 512 * 1024,
            ping_interval: Duration::from_secs(54),
            pong_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
        }
    }
}

impl SessionConfig {
    /// Consecutive unanswered pings tolerated before giving up, at least one.
    fn max_missed_pongs(&self) -> u32 {
        let interval = self.ping_interval.as_millis().max(1);
        let missed = self.pong_timeout.as_millis() / interval;
        u32::try_from(missed).unwrap_or(u32::MAX).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client closed the connection or the stream ended.
    ClientClosed,
    ReadError,
    FrameTooLarge,
    HeartbeatTimeout,
    /// A write failed or did not finish within the write timeout.
    WriteFailed,
    /// The hub dropped this session: replaced by a newer one, or evicted.
    QueueClosed,
}

/// Drives one authenticated connection until either side gives up.
///
/// Registers with the hub, then runs a reader and a writer concurrently.
/// Whichever stops first cancels the other; the session is unregistered once
/// both are done. A command already being processed by the reader runs to
/// completion.
pub async fn run_session<W, R, E>(
    sink: W,
    stream: R,
    engine: MessageEngine,
    user_id: UserId,
    config: SessionConfig,
) -> DisconnectReason
where
    W: Sink<Message> + Send + 'static,
    R: Stream<Item = Result<Message, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let hub = engine.hub().clone();
    let (handle, outbound) = SessionHandle::new(user_id.clone(), config.outbound_capacity);
    let conn_id = handle.conn_id;
    hub.register(handle);
    info!(%user_id, %conn_id, "Session started");

    let cancel = CancellationToken::new();
    let pong_received = Arc::new(AtomicBool::new(true));

    let writer = tokio::spawn(write_pump(
        Box::pin(sink),
        outbound,
        pong_received.clone(),
        config.clone(),
        cancel.clone(),
    ));
    let reader = tokio::spawn(read_pump(
        Box::pin(stream),
        engine,
        user_id.clone(),
        pong_received,
        config.max_frame_bytes,
        cancel.clone(),
    ));

    let (written, read) = tokio::join!(writer, reader);
    let reason = written
        .ok()
        .flatten()
        .or(read.ok().flatten())
        .unwrap_or(DisconnectReason::ClientClosed);

    hub.unregister(&user_id, conn_id);
    info!(%user_id, %conn_id, ?reason, "Session ended");
    reason
}

/// Forwards queued events and sends pings. Returns `None` if cancelled by the reader.
async fn write_pump<W>(
    mut sink: std::pin::Pin<Box<W>>,
    mut outbound: mpsc::Receiver<Frame>,
    pong_received: Arc<AtomicBool>,
    config: SessionConfig,
    cancel: CancellationToken,
) -> Option<DisconnectReason>
where
    W: Sink<Message> + Send,
{
    let mut heartbeat = tokio::time::interval(config.ping_interval);
    heartbeat.tick().await;
    let max_missed = config.max_missed_pongs();
    let mut missed: u32 = 0;

    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => break None,
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    let text = Message::Text(frame.as_ref().into());
                    if !send_frame(&mut sink, text, config.write_timeout).await {
                        break Some(DisconnectReason::WriteFailed);
                    }
                }
                None => {
                    let _ = send_frame(&mut sink, Message::Close(None), config.write_timeout).await;
                    break Some(DisconnectReason::QueueClosed);
                }
            },
            _ = heartbeat.tick() => {
                if pong_received.swap(false, Ordering::AcqRel) {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= max_missed {
                        warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed);
                        break Some(DisconnectReason::HeartbeatTimeout);
                    }
                }
                if !send_frame(&mut sink, Message::Ping(Default::default()), config.write_timeout).await {
                    break Some(DisconnectReason::WriteFailed);
                }
            }
        }
    };

    let _ = tokio::time::timeout(config.write_timeout, sink.close()).await;
    cancel.cancel();
    reason
}

async fn send_frame<W>(sink: &mut std::pin::Pin<Box<W>>, frame: Message, limit: Duration) -> bool
where
    W: Sink<Message>,
{
    matches!(tokio::time::timeout(limit, sink.send(frame)).await, Ok(Ok(())))
}

/// Decodes and applies client commands in arrival order. Returns `None` if
/// cancelled by the writer.
async fn read_pump<R, E>(
    mut stream: std::pin::Pin<Box<R>>,
    engine: MessageEngine,
    user_id: UserId,
    pong_received: Arc<AtomicBool>,
    max_frame_bytes: usize,
    cancel: CancellationToken,
) -> Option<DisconnectReason>
where
    R: Stream<Item = Result<Message, E>> + Send,
    E: std::fmt::Display,
{
    let reason = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break None,
            frame = stream.next() => frame,
        };

        match frame {
            None | Some(Ok(Message::Close(_))) => break Some(DisconnectReason::ClientClosed),
            Some(Err(e)) => {
                debug!(%user_id, "WebSocket read error: {}", e);
                break Some(DisconnectReason::ReadError);
            }
            Some(Ok(Message::Text(text))) => {
                if text.as_str().len() > max_frame_bytes {
                    warn!(%user_id, size = text.as_str().len(), "Frame too large, closing");
                    break Some(DisconnectReason::FrameTooLarge);
                }
                match serde_json::from_str::<ClientCommand>(text.as_str()) {
                    Ok(cmd) => dispatch(&engine, &user_id, cmd).await,
                    Err(e) => warn!(%user_id, "Ignoring malformed command: {}", e),
                }
            }
            Some(Ok(Message::Binary(data))) => {
                if data.len() > max_frame_bytes {
                    warn!(%user_id, size = data.len(), "Frame too large, closing");
                    break Some(DisconnectReason::FrameTooLarge);
                }
                trace!(%user_id, "Ignoring binary frame");
            }
            Some(Ok(Message::Pong(_))) => pong_received.store(true, Ordering::Release),
            // Pings are answered by the WebSocket layer.
            Some(Ok(Message::Ping(_))) => {}
        }
    };

    cancel.cancel();
    reason
}

async fn dispatch(engine: &MessageEngine, user_id: &str, cmd: ClientCommand) {
    let result = match cmd {
        ClientCommand::SendMessage {
            receiver_id,
            text,
            reply_to_id,
        } => engine
            .send_message(
                user_id,
                SendRequest {
                    receiver_id,
                    text,
                    reply_to_id,
                },
            )
            .await
            .map(drop),
        ClientCommand::TypingStart { receiver_id } => engine.typing(user_id, &receiver_id, true),
        ClientCommand::TypingStop { receiver_id } => engine.typing(user_id, &receiver_id, false),
        ClientCommand::MarkRead { sender_id } => engine.mark_read(user_id, &sender_id).await.map(drop),
    };

    match result {
        Ok(()) => {}
        Err(e) if e.is_client_error() => warn!(%user_id, "Command rejected: {}", e),
        Err(e) => error!(%user_id, "Command failed: {}", e),
    }
}
