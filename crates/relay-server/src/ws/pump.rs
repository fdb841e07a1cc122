//! Connection pump
//!
//! Owns one WebSocket for the lifetime of a session and runs two loops:
//!
//! - the read loop (caller's task) decodes request frames, dispatches them
//!   to the chat service and enforces the read deadline;
//! - the write loop (spawned task) drains the user's registry sink and
//!   sends a ping every `ping_period`, bounding each write by `write_wait`.
//!
//! Either loop may trigger teardown. Teardown cancels the session token so
//! the other loop stops, and asks the registry to unregister the
//! connection. Only the caller that gets `true` back closes the socket.

use crate::chat::ChatService;
use crate::config::{AppState, KeepAlive};
use crate::ws::registry::{ConnectionId, ConnectionRegistry, Registration, Sink};
use axum::body::Bytes;
use axum::extract::ws::Message;
use futures::{Sink as FrameSink, SinkExt, Stream, StreamExt};
use relay_common::{Delivery, Request, UserId};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{interval_at, timeout, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Everything a pump needs from the rest of the server
#[derive(Clone)]
pub struct PumpContext {
    pub registry: Arc<ConnectionRegistry>,
    pub service: Arc<ChatService>,
    pub keepalive: KeepAlive,
    /// Process-wide shutdown; each session derives a child token from it
    pub shutdown: CancellationToken,
}

impl From<&AppState> for PumpContext {
    fn from(state: &AppState) -> Self {
        Self {
            registry: state.registry.clone(),
            service: state.service.clone(),
            keepalive: state.config.keepalive,
            shutdown: state.shutdown.clone(),
        }
    }
}

#[derive(Error, Debug)]
enum WriteError {
    #[error("write failed: {0}")]
    Transport(String),

    #[error("write deadline exceeded")]
    Timeout,
}

/// State shared by the two loops of one connection
struct Session<W> {
    user_id: UserId,
    connection: ConnectionId,
    registry: Arc<ConnectionRegistry>,
    writer: Mutex<W>,
    cancel: CancellationToken,
    write_wait: std::time::Duration,
}

impl<W> Session<W>
where
    W: FrameSink<Message> + Unpin,
    W::Error: fmt::Display,
{
    async fn write(&self, frame: Message) -> Result<(), WriteError> {
        let mut writer = self.writer.lock().await;
        match timeout(self.write_wait, writer.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(WriteError::Transport(e.to_string())),
            Err(_) => Err(WriteError::Timeout),
        }
    }

    /// Idempotent; safe to call from both loops.
    async fn teardown(&self, reason: &str) {
        self.cancel.cancel();

        if !self.registry.unregister(&self.user_id, self.connection) {
            trace!(
                "Connection {} of {} already torn down ({})",
                self.connection,
                self.user_id,
                reason
            );
            return;
        }

        let mut writer = self.writer.lock().await;
        match timeout(self.write_wait, writer.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Error closing connection of {}: {}", self.user_id, e),
            Err(_) => debug!("Timed out closing connection of {}", self.user_id),
        }

        info!(
            "Connection {} of {} closed ({})",
            self.connection, self.user_id, reason
        );
    }
}

/// Run a session until either side fails, the peer closes, or the server
/// shuts down.
pub async fn run_connection<W, R, E>(user_id: UserId, writer: W, reader: R, ctx: PumpContext)
where
    W: FrameSink<Message> + Unpin + Send + 'static,
    W::Error: fmt::Display + Send,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    let Registration { connection, sink } = ctx.registry.register(user_id.clone());

    let session = Arc::new(Session {
        user_id,
        connection,
        registry: ctx.registry.clone(),
        writer: Mutex::new(writer),
        cancel: ctx.shutdown.child_token(),
        write_wait: ctx.keepalive.write_wait,
    });

    debug!(
        "Connection {} of {} started",
        session.connection, session.user_id
    );

    let writer_handle = tokio::spawn(write_loop(
        session.clone(),
        sink,
        ctx.keepalive.ping_period,
    ));

    read_loop(session.as_ref(), reader, &ctx).await;

    if let Err(e) = writer_handle.await {
        warn!("Write loop of {} panicked: {}", session.user_id, e);
    }
}

async fn write_loop<W>(
    session: Arc<Session<W>>,
    mut sink: Sink,
    ping_period: std::time::Duration,
)
where
    W: FrameSink<Message> + Unpin,
    W::Error: fmt::Display,
{
    let mut ticker = interval_at(Instant::now() + ping_period, ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            _ = session.cancel.cancelled() => break "cancelled",
            delivery = sink.recv() => {
                let Some(delivery) = delivery else {
                    debug!("Sink of {} closed", session.user_id);
                    break "sink closed";
                };

                let text = match delivery.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode delivery for {}: {}", session.user_id, e);
                        continue;
                    }
                };

                debug!("Send to {}: {}", session.user_id, text);
                if let Err(e) = session.write(Message::Text(text.into())).await {
                    debug!("Error writing to {}: {}", session.user_id, e);
                    break "write failed";
                }
            }
            _ = ticker.tick() => {
                trace!("Send ping to {}", session.user_id);
                if let Err(e) = session.write(Message::Ping(Bytes::new())).await {
                    debug!("Error pinging {}: {}", session.user_id, e);
                    break "ping failed";
                }
            }
        }
    };

    session.teardown(reason).await;
}

async fn read_loop<W, R, E>(session: &Session<W>, mut reader: R, ctx: &PumpContext)
where
    W: FrameSink<Message> + Unpin,
    W::Error: fmt::Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    let read_wait = ctx.keepalive.read_wait;
    let mut deadline = Instant::now() + read_wait;

    let reason = loop {
        let next = tokio::select! {
            _ = session.cancel.cancelled() => break "cancelled",
            next = timeout_at(deadline, reader.next()) => next,
        };

        let frame = match next {
            Err(_) => break "read deadline exceeded",
            Ok(None) => break "stream ended",
            Ok(Some(Err(e))) => {
                debug!("Error reading from {}: {}", session.user_id, e);
                break "read failed";
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => {
                deadline = Instant::now() + read_wait;
                debug!("Got message from {}: {}", session.user_id, text.as_str());
                dispatch(&ctx.service, &session.user_id, text.as_str().as_bytes());
            }
            Message::Binary(data) => {
                deadline = Instant::now() + read_wait;
                debug!("Got {} bytes from {}", data.len(), session.user_id);
                dispatch(&ctx.service, &session.user_id, &data);
            }
            Message::Pong(_) => {
                trace!("Got pong from {}", session.user_id);
                deadline = Instant::now() + read_wait;
            }
            // Answered by the transport
            Message::Ping(_) => trace!("Got ping from {}", session.user_id),
            Message::Close(frame) => {
                debug!("Session of {} closed by client: {:?}", session.user_id, frame);
                break "closed by client";
            }
        }
    };

    session.teardown(reason).await;
}

/// Decode one request frame and run it. Failures are reported back to the
/// sender as an Error delivery and never end the session.
fn dispatch(service: &ChatService, user_id: &UserId, frame: &[u8]) {
    let request = match Request::from_slice(frame) {
        Ok(request) => request,
        Err(e) => {
            debug!("Bad request from {}: {}", user_id, e);
            service.reply(user_id, Delivery::error(e));
            return;
        }
    };

    match request {
        Request::NewChat(req) => match service.create_chat(user_id, req.user_ids) {
            Ok(ch_id) => service.reply(user_id, Delivery::NewChat(ch_id)),
            Err(e) => service.reply(user_id, Delivery::error(e)),
        },
        Request::NewMessage(req) => {
            if let Err(e) = service.post_message(&req.ch_id, req.kind, req.msg, user_id) {
                service.reply(user_id, Delivery::error(e));
            }
        }
    }
}
