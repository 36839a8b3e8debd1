//! The control loop: single owner of the state tree.
//!
//! The tree, the [`EventIndex`], and the observer registry live inside
//! one task. Connection tasks reach it only through [`ControlHandle`],
//! which sends [`Command`]s over a bounded FIFO channel. Each command is
//! processed to completion before the next one is received, so every
//! observer sees broadcasts in the same order and a freshly subscribed
//! observer never misses an update between its snapshot and the stream.

use std::collections::BTreeMap;
use std::sync::Arc;

use ensemble_core::index::EventIndex;
use ensemble_core::merge::apply_update;
use ensemble_types::{ConnectionId, EnsembleStatus, Envelope, PartialSnapshot, Snapshot};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Capacity of the command channel into the control loop.
const COMMAND_CAPACITY: usize = 256;

/// One serialized outbound envelope, shared by every observer queue.
pub type Frame = Arc<str>;

/// Requests processed by the control loop.
#[derive(Debug)]
pub enum Command {
    /// Register an observer and queue its snapshot.
    Subscribe {
        /// Receives the registration, or `None` after termination.
        reply: oneshot::Sender<Option<Subscription>>,
    },
    /// Remove an observer from the registry.
    Unsubscribe {
        /// The observer to remove.
        id: ConnectionId,
    },
    /// Merge a diff into the tree and broadcast what changed.
    Apply {
        /// The diff to merge.
        update: PartialSnapshot,
    },
    /// Mark the ensemble stopped, send `terminated`, and close every
    /// observer queue.
    Terminate {
        /// Signalled once the final messages are queued.
        reply: oneshot::Sender<()>,
    },
}

/// An observer's registration.
#[derive(Debug)]
pub struct Subscription {
    /// Registry key, used to unsubscribe.
    pub id: ConnectionId,
    /// Index of the snapshot queued first in `frames`.
    pub snapshot_index: u64,
    /// Outbound frames. Closed by the loop on termination or overflow.
    pub frames: mpsc::Receiver<Frame>,
}

/// Cloneable sender side of the control loop.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<Command>,
}

impl ControlHandle {
    /// Register an observer. Returns `None` once the service terminated.
    pub async fn subscribe(&self) -> Option<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Subscribe { reply }).await.ok()?;
        rx.await.ok().flatten()
    }

    /// Remove an observer without waiting. Safe to call from `Drop`.
    ///
    /// If the command channel is full the observer stays registered until
    /// the next broadcast finds its queue closed.
    pub fn unsubscribe(&self, id: ConnectionId) {
        if let Err(e) = self.tx.try_send(Command::Unsubscribe { id }) {
            debug!(observer = %id, error = %e, "Deferred observer removal");
        }
    }

    /// Queue a diff for merging. Returns `false` if the loop has exited.
    pub async fn apply(&self, update: PartialSnapshot) -> bool {
        self.tx.send(Command::Apply { update }).await.is_ok()
    }

    /// Terminate and wait until `terminated` has been queued for every
    /// observer.
    pub async fn terminate(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Terminate { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// The task that owns the tree.
#[derive(Debug)]
pub struct ControlLoop {
    tree: Snapshot,
    index: EventIndex,
    observers: BTreeMap<ConnectionId, mpsc::Sender<Frame>>,
    source: String,
    observer_queue: usize,
    terminated: bool,
    commands: mpsc::Receiver<Command>,
}

impl ControlLoop {
    /// Create the loop around an initial tree, with its handle.
    ///
    /// `source` is stamped on every outbound envelope; `observer_queue`
    /// bounds each observer's outbound queue.
    pub fn new(tree: Snapshot, source: String, observer_queue: usize) -> (Self, ControlHandle) {
        let (tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let control = Self {
            tree,
            index: EventIndex::new(),
            observers: BTreeMap::new(),
            source,
            observer_queue: observer_queue.max(1),
            terminated: false,
            commands,
        };
        (control, ControlHandle { tx })
    }

    /// Process commands until every [`ControlHandle`] is dropped.
    pub async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Subscribe { reply } => {
                    let subscription = self.subscribe();
                    if let Err(Some(rejected)) = reply.send(subscription) {
                        self.observers.remove(&rejected.id);
                    }
                }
                Command::Unsubscribe { id } => {
                    if self.observers.remove(&id).is_some() {
                        debug!(observer = %id, observers = self.observers.len(), "Observer removed");
                    }
                }
                Command::Apply { update } => self.apply(&update),
                Command::Terminate { reply } => {
                    self.terminate();
                    let _ = reply.send(());
                }
            }
        }
        debug!("Control loop exiting");
    }

    fn subscribe(&mut self) -> Option<Subscription> {
        if self.terminated {
            debug!("Refusing observer after termination");
            return None;
        }
        let snapshot_index = self.index.next();
        let frame = match Envelope::snapshot(&self.source, snapshot_index, &self.tree) {
            Ok(envelope) => encode(&envelope)?,
            Err(e) => {
                error!(error = %e, "Failed to serialize snapshot");
                return None;
            }
        };
        let (tx, frames) = mpsc::channel(self.observer_queue);
        // Fresh queue with capacity >= 1; cannot be full.
        if tx.try_send(frame).is_err() {
            return None;
        }
        let id = ConnectionId::new();
        self.observers.insert(id, tx);
        debug!(observer = %id, index = snapshot_index, observers = self.observers.len(), "Observer subscribed");
        Some(Subscription {
            id,
            snapshot_index,
            frames,
        })
    }

    fn apply(&mut self, update: &PartialSnapshot) {
        if self.terminated {
            debug!("Dropping update received after termination");
            return;
        }
        match apply_update(&mut self.tree, update) {
            Ok(applied) if applied.is_empty() => debug!("Update changed nothing"),
            Ok(applied) => self.broadcast_update(&applied),
            Err(e) => error!(error = %e, "Rejected update for unknown path"),
        }
    }

    fn broadcast_update(&mut self, applied: &PartialSnapshot) {
        let index = self.index.next();
        match Envelope::snapshot_update(&self.source, index, applied) {
            Ok(envelope) => {
                if let Some(frame) = encode(&envelope) {
                    self.broadcast(&frame);
                    debug!(index, observers = self.observers.len(), "Broadcast snapshot update");
                }
            }
            Err(e) => error!(index, error = %e, "Failed to serialize snapshot update"),
        }
    }

    fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.apply(&PartialSnapshot {
            status: Some(EnsembleStatus::Stopped),
            ..PartialSnapshot::default()
        });
        let index = self.index.next();
        if let Some(frame) = encode(&Envelope::terminated(&self.source, index)) {
            self.broadcast(&frame);
        }
        info!(index, observers = self.observers.len(), "Sent terminated to observers");
        self.terminated = true;
        self.observers.clear();
    }

    /// Queue a frame for every observer, dropping those that cannot keep up.
    fn broadcast(&mut self, frame: &Frame) {
        self.observers
            .retain(|id, tx| match tx.try_send(Arc::clone(frame)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(observer = %id, "Observer queue full, dropping observer");
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(observer = %id, "Observer gone, removing");
                    false
                }
            });
    }
}

fn encode(envelope: &Envelope) -> Option<Frame> {
    match serde_json::to_string(envelope) {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            error!(kind = %envelope.kind, error = %e, "Failed to encode envelope");
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;

    use ensemble_types::{Status, envelope};

    use super::*;

    fn one_job_tree() -> Snapshot {
        let mut tree = Snapshot::default();
        let job = ensemble_types::Job {
            name: String::from("FWD"),
            ..ensemble_types::Job::default()
        };
        let step = ensemble_types::Step {
            jobs: BTreeMap::from([("0".into(), job)]),
            ..ensemble_types::Step::default()
        };
        let stage = ensemble_types::Stage {
            steps: BTreeMap::from([("0".into(), step)]),
            ..ensemble_types::Stage::default()
        };
        let real = ensemble_types::Realization {
            active: true,
            stages: BTreeMap::from([("0".into(), stage)]),
            ..ensemble_types::Realization::default()
        };
        tree.reals.insert("0".into(), real);
        tree
    }

    fn decode(frame: &Frame) -> Envelope {
        serde_json::from_str(frame).unwrap()
    }

    fn running(job: &str) -> PartialSnapshot {
        let mut update = PartialSnapshot::default();
        update.job_mut("0", "0", "0", job).status = Some(Status::Running);
        update
    }

    #[tokio::test]
    async fn snapshot_then_updates_then_terminated() {
        let (control, handle) = ControlLoop::new(one_job_tree(), String::from("/test"), 8);
        let task = tokio::spawn(control.run());

        let mut sub = handle.subscribe().await.unwrap();
        assert_eq!(sub.snapshot_index, 1);
        let first = decode(&sub.frames.recv().await.unwrap());
        assert_eq!(first.kind, envelope::SNAPSHOT);
        assert_eq!(first.id, 1);
        assert_eq!(first.source, "/test");

        assert!(handle.apply(running("0")).await);
        handle.terminate().await;

        let update = decode(&sub.frames.recv().await.unwrap());
        assert_eq!(update.kind, envelope::SNAPSHOT_UPDATE);
        assert_eq!(update.id, 2);
        let stopped = decode(&sub.frames.recv().await.unwrap());
        assert_eq!(stopped.data["status"], "Stopped");
        assert_eq!(stopped.id, 3);
        let terminated = decode(&sub.frames.recv().await.unwrap());
        assert_eq!(terminated.kind, envelope::TERMINATED);
        assert_eq!(terminated.id, 4);
        assert!(sub.frames.recv().await.is_none());

        assert!(handle.subscribe().await.is_none());
        drop(handle);
        assert!(task.await.is_ok());
    }

    #[tokio::test]
    async fn unchanged_and_unknown_updates_are_not_broadcast() {
        let (control, handle) = ControlLoop::new(one_job_tree(), String::from("/test"), 8);
        tokio::spawn(control.run());
        let mut sub = handle.subscribe().await.unwrap();
        let _snapshot = sub.frames.recv().await;

        handle.apply(running("0")).await;
        handle.apply(running("0")).await;
        handle.apply(running("7")).await;
        handle.terminate().await;

        let kinds: Vec<(String, u64)> = std::iter::from_fn(|| sub.frames.try_recv().ok())
            .map(|frame| {
                let envelope = decode(&frame);
                (envelope.kind, envelope.id)
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                (String::from(envelope::SNAPSHOT_UPDATE), 2),
                (String::from(envelope::SNAPSHOT_UPDATE), 3),
                (String::from(envelope::TERMINATED), 4),
            ]
        );
    }

    #[tokio::test]
    async fn slow_observers_are_dropped() {
        let (control, handle) = ControlLoop::new(one_job_tree(), String::from("/test"), 1);
        tokio::spawn(control.run());
        let mut slow = handle.subscribe().await.unwrap();
        let mut fast = handle.subscribe().await.unwrap();
        let _ = fast.frames.recv().await;

        handle.apply(running("0")).await;
        let update = fast.frames.recv().await.unwrap();
        assert_eq!(decode(&update).kind, envelope::SNAPSHOT_UPDATE);

        // The slow observer still holds its unread snapshot, so the update
        // overflowed its queue and it was removed.
        assert_eq!(decode(&slow.frames.recv().await.unwrap()).kind, envelope::SNAPSHOT);
        assert!(slow.frames.recv().await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_closes_the_queue() {
        let (control, handle) = ControlLoop::new(one_job_tree(), String::from("/test"), 8);
        tokio::spawn(control.run());
        let mut sub = handle.subscribe().await.unwrap();
        handle.unsubscribe(sub.id);
        handle.apply(running("0")).await;
        assert_eq!(decode(&sub.frames.recv().await.unwrap()).kind, envelope::SNAPSHOT);
        assert!(sub.frames.recv().await.is_none());
    }
}
