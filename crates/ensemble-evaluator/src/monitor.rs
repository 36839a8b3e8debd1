//! Observer-side client for an evaluator.
//!
//! A [`Monitor`] connects to `/client`, keeps a local mirror of the state
//! tree (replaced by each `snapshot`, merged with each `snapshot-update`),
//! and can ask the evaluator to shut down. Dropping it closes the socket.

use ensemble_core::merge::apply_update;
use ensemble_types::envelope::{SNAPSHOT, SNAPSHOT_UPDATE, TERMINATED};
use ensemble_types::{Envelope, PartialSnapshot, Snapshot};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use crate::error::MonitorError;

/// Source attribute on messages the monitor sends.
const MONITOR_SOURCE: &str = "/ensemble/monitor";

/// A message received from the evaluator.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// A full snapshot replaced the mirror.
    Snapshot {
        /// Event index.
        index: u64,
    },
    /// An applied diff was merged into the mirror.
    SnapshotUpdate {
        /// Event index.
        index: u64,
        /// The diff as received.
        update: PartialSnapshot,
    },
    /// The evaluator is shutting down; no further events follow.
    Terminated {
        /// Event index.
        index: u64,
    },
}

impl MonitorEvent {
    /// The event index carried by the message.
    pub const fn index(&self) -> u64 {
        match self {
            Self::Snapshot { index }
            | Self::SnapshotUpdate { index, .. }
            | Self::Terminated { index } => *index,
        }
    }
}

/// A live observer connection with a mirrored state tree.
pub struct Monitor {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mirror: Snapshot,
    last_index: Option<u64>,
}

impl core::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Monitor")
            .field("realizations", &self.mirror.reals.len())
            .field("last_index", &self.last_index)
            .finish_non_exhaustive()
    }
}

impl Monitor {
    /// Connect to an evaluator's observer URL (`ws://host:port/client`).
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Connect`] if the handshake fails.
    pub async fn connect(url: &str) -> Result<Self, MonitorError> {
        let (stream, _response) = connect_async(url).await.map_err(|source| MonitorError::Connect {
            url: url.to_owned(),
            source: Box::new(source),
        })?;
        debug!(%url, "Monitor connected");
        Ok(Self {
            stream,
            mirror: Snapshot::default(),
            last_index: None,
        })
    }

    /// Wait for the next evaluator message.
    ///
    /// Returns `Ok(None)` once the connection is closed. Messages of any
    /// other type are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Transport`] on a connection failure,
    /// [`MonitorError::Json`] for a malformed message, and
    /// [`MonitorError::Merge`] if an update does not fit the mirror.
    pub async fn next_event(&mut self) -> Result<Option<MonitorEvent>, MonitorError> {
        while let Some(message) = self.stream.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => return Ok(None),
                Ok(_) => continue,
                Err(e) => return Err(e.into()),
            };
            let envelope: Envelope = serde_json::from_str(text.as_str())?;
            let index = envelope.id;
            let event = match envelope.kind.as_str() {
                SNAPSHOT => {
                    self.mirror = serde_json::from_value(envelope.data)?;
                    MonitorEvent::Snapshot { index }
                }
                SNAPSHOT_UPDATE => {
                    let update: PartialSnapshot = serde_json::from_value(envelope.data)?;
                    apply_update(&mut self.mirror, &update)?;
                    MonitorEvent::SnapshotUpdate { index, update }
                }
                TERMINATED => MonitorEvent::Terminated { index },
                other => {
                    debug!(kind = %other, "Monitor skipping message");
                    continue;
                }
            };
            self.last_index = Some(self.last_index.map_or(index, |last| last.max(index)));
            return Ok(Some(event));
        }
        Ok(None)
    }

    /// The mirrored state tree.
    pub const fn snapshot(&self) -> &Snapshot {
        &self.mirror
    }

    /// Highest event index received so far.
    pub const fn last_index(&self) -> Option<u64> {
        self.last_index
    }

    /// Ask the evaluator to begin shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Transport`] if the message cannot be sent.
    pub async fn signal_done(&mut self) -> Result<(), MonitorError> {
        let json = serde_json::to_string(&Envelope::terminate_request(MONITOR_SOURCE))?;
        self.stream.send(Message::Text(json.into())).await?;
        Ok(())
    }
}
