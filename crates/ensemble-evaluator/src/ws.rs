//! `WebSocket` handlers for observers and reporters.
//!
//! The first path segment of the upgrade request selects the role:
//!
//! - `client` -- an **observer**. It receives a `snapshot` envelope, then
//!   every `snapshot-update`, then `terminated`. It may send a
//!   `terminate-request` to begin shutdown.
//! - `dispatch` -- a **reporter**. It streams forward-model events that
//!   are translated and merged into the tree, optionally ending with the
//!   literal `null`.
//!
//! Each reporter has one reader feeding a bounded queue and one forwarder
//! draining it in order, so a reporter's events are merged in exactly the
//! order they were received.

use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Path, State};
use axum::http::Uri;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use ensemble_core::drain::ReporterGuard;
use ensemble_core::translate::translate;
use ensemble_types::envelope::{END_OF_STREAM, TERMINATE_REQUEST};
use ensemble_types::{ConnectionId, Envelope};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::{ControlHandle, Subscription};
use crate::error::ConnectionError;
use crate::state::EvaluatorState;

/// Connection role selected by the first path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// `/client`: receives the state stream.
    Observer,
    /// `/dispatch`: sends forward-model events.
    Reporter,
}

impl Role {
    /// Parse the first segment of a request path.
    pub fn from_path(path: &str) -> Option<Self> {
        match path.trim_start_matches('/').split('/').next() {
            Some("client") => Some(Self::Observer),
            Some("dispatch") => Some(Self::Reporter),
            _ => None,
        }
    }
}

/// Upgrade a request to a `WebSocket` and hand it to the role's handler.
///
/// # Route
///
/// `GET /{role}/...`
pub async fn connect(
    State(state): State<Arc<EvaluatorState>>,
    Path(path): Path<String>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(role) = Role::from_path(&path) else {
        return reject_path(&path).into_response();
    };
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            debug!(%path, %rejection, "Rejected non-WebSocket request");
            return rejection.into_response();
        }
    };

    // Counted before the 101 response is sent.
    let counted = matches!(role, Role::Reporter).then(|| state.drain.register());
    let limit = state.config.max_message_size;
    let tracker = state.tracker.clone();
    upgrade
        .max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| {
            tracker.track_future(async move {
                match counted {
                    Some(guard) => report(socket, state, guard).await,
                    None => observe(socket, state).await,
                }
            })
        })
}

/// Answer requests outside any role path (including `/`).
pub async fn unroutable(uri: Uri) -> ConnectionError {
    reject_path(uri.path())
}

fn reject_path(path: &str) -> ConnectionError {
    let role = path
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or_default()
        .to_owned();
    warn!(%role, "Rejected connection for unknown role");
    ConnectionError::UnknownRole { role }
}

// ---------------------------------------------------------------------------
// Observers
// ---------------------------------------------------------------------------

/// Unregisters an observer on every exit path.
struct ObserverGuard {
    id: ConnectionId,
    control: ControlHandle,
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        self.control.unsubscribe(self.id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObserverExit {
    /// The control loop closed the queue after `terminated` (or dropped
    /// the observer for falling behind).
    QueueClosed,
    /// The observer went away.
    Disconnected,
    /// The observer sent something that is not an envelope.
    Malformed,
}

async fn observe(mut socket: WebSocket, state: Arc<EvaluatorState>) {
    let Some(subscription) = state.control.subscribe().await else {
        debug!("Observer connected after termination, closing");
        let _ = socket
            .send(close_message(close_code::AWAY, "evaluator terminated"))
            .await;
        return;
    };
    let Subscription {
        id,
        snapshot_index,
        mut frames,
    } = subscription;
    let _guard = ObserverGuard {
        id,
        control: state.control.clone(),
    };
    debug!(observer = %id, index = snapshot_index, "Observer connected");

    let (mut sink, mut stream) = socket.split();

    let writer = async {
        while let Some(frame) = frames.recv().await {
            if sink.send(Message::Text(frame.as_ref().into())).await.is_err() {
                return ObserverExit::Disconnected;
            }
        }
        ObserverExit::QueueClosed
    };

    let reader = async {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(text.as_str()) {
                    Ok(envelope) if envelope.kind == TERMINATE_REQUEST => {
                        info!(observer = %id, "Observer requested termination");
                        state.done.cancel();
                    }
                    Ok(envelope) => {
                        debug!(observer = %id, kind = %envelope.kind, "Ignoring observer message");
                    }
                    Err(e) => {
                        warn!(observer = %id, error = %e, "Malformed envelope from observer");
                        return ObserverExit::Malformed;
                    }
                },
                Ok(Message::Close(_)) | Err(_) => return ObserverExit::Disconnected,
                Ok(_) => {}
            }
        }
        ObserverExit::Disconnected
    };

    let exit = tokio::select! {
        exit = writer => exit,
        exit = reader => exit,
    };

    match exit {
        ObserverExit::QueueClosed => {
            let _ = sink.send(Message::Close(None)).await;
        }
        ObserverExit::Malformed => {
            let _ = sink
                .send(close_message(close_code::PROTOCOL, "malformed envelope"))
                .await;
        }
        ObserverExit::Disconnected => {}
    }
    debug!(observer = %id, ?exit, "Observer disconnected");
}

// ---------------------------------------------------------------------------
// Reporters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadExit {
    /// The reporter closed the connection.
    Disconnected,
    /// The forwarder finished or the service is closing.
    Stopped,
    /// More frames arrived than the queue holds.
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForwardExit {
    /// The reader stopped and the queue is drained.
    Drained,
    /// The reporter sent the end-of-stream sentinel.
    EndOfStream,
    /// A frame was not an envelope.
    Malformed,
    /// The control loop is gone.
    ControlClosed,
}

async fn report(socket: WebSocket, state: Arc<EvaluatorState>, _counted: ReporterGuard) {
    let connection = ConnectionId::new();
    debug!(reporter = %connection, reporters = state.drain.count(), "Reporter connected");

    let (mut sink, stream) = socket.split();
    let (tx, mut rx) = mpsc::channel(state.config.max_queue.max(1));
    let stop = state.close.child_token();

    let reader = read_frames(stream, tx, stop.clone(), connection);
    let forwarder = async {
        let exit = forward(&mut rx, &state.control, connection).await;
        stop.cancel();
        exit
    };
    let (read_exit, forward_exit) = tokio::join!(reader, forwarder);

    if let Some((code, reason)) = reporter_close(read_exit, forward_exit) {
        let _ = sink.send(close_message(code, reason)).await;
    }
    debug!(
        reporter = %connection,
        ?read_exit,
        ?forward_exit,
        "Reporter disconnected"
    );
}

/// Move text frames from the socket into the bounded queue.
async fn read_frames(
    mut stream: SplitStream<WebSocket>,
    tx: mpsc::Sender<Utf8Bytes>,
    stop: CancellationToken,
    connection: ConnectionId,
) -> ReadExit {
    loop {
        let message = tokio::select! {
            () = stop.cancelled() => return ReadExit::Stopped,
            message = stream.next() => message,
        };
        match message {
            Some(Ok(Message::Text(text))) => match tx.try_send(text) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(reporter = %connection, "Reporter inbound queue overflowed, closing");
                    return ReadExit::Overflow;
                }
                Err(TrySendError::Closed(_)) => return ReadExit::Stopped,
            },
            Some(Ok(Message::Close(_))) | None => return ReadExit::Disconnected,
            Some(Err(e)) => {
                debug!(reporter = %connection, error = %e, "Reporter connection error");
                return ReadExit::Disconnected;
            }
            Some(Ok(_)) => {}
        }
    }
}

/// Translate queued frames in order and hand the diffs to the control loop.
async fn forward(
    frames: &mut mpsc::Receiver<Utf8Bytes>,
    control: &ControlHandle,
    connection: ConnectionId,
) -> ForwardExit {
    while let Some(frame) = frames.recv().await {
        if frame.as_str() == END_OF_STREAM {
            debug!(reporter = %connection, "Reporter sent end of stream");
            return ForwardExit::EndOfStream;
        }
        let mut envelope: Envelope = match serde_json::from_str(frame.as_str()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(reporter = %connection, error = %e, "Malformed envelope from reporter, closing");
                return ForwardExit::Malformed;
            }
        };
        if envelope.time.is_none() {
            envelope.time = Some(Utc::now());
        }
        match translate(&envelope) {
            Ok(update) => {
                debug!(reporter = %connection, kind = %envelope.kind, "Forwarding event");
                if !control.apply(update).await {
                    return ForwardExit::ControlClosed;
                }
            }
            Err(e) => warn!(reporter = %connection, error = %e, "Dropping event"),
        }
    }
    ForwardExit::Drained
}

/// Close frame to send once both reporter halves have finished.
const fn reporter_close(read: ReadExit, forward: ForwardExit) -> Option<(u16, &'static str)> {
    match (read, forward) {
        (ReadExit::Overflow, _) => Some((close_code::POLICY, "inbound queue overflow")),
        (_, ForwardExit::Malformed) => Some((close_code::PROTOCOL, "malformed envelope")),
        (ReadExit::Disconnected, _) => None,
        (_, ForwardExit::EndOfStream) => Some((close_code::NORMAL, "end of stream")),
        _ => Some((close_code::AWAY, "evaluator shutting down")),
    }
}

fn close_message(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: Utf8Bytes::from_static(reason),
    }))
}
