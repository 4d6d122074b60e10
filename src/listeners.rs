// Copyright 2025 Stator Contributors
// SPDX-License-Identifier: Apache-2.0

//! # Transition listeners
//!
//! The `listeners` module keeps the set of observer references a machine
//! gossips its transitions to. Every admitted observer is watched: a small
//! task waits for the observer's mailbox to close and reports the
//! termination back to the machine, which then silently drops the
//! registration. Removing an observer (or dropping the set) cancels its
//! watch task through the record's cancellation token.
//!

use crate::machine::MachineId;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tracing::debug;

use std::{
    collections::HashMap,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

static OBSERVER_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity of an observer reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer-{}", self.0)
    }
}

/// What a machine emits to its observers: one `CurrentState` baseline when
/// the observer is admitted, then one `Transition` per real state change.
#[derive(Clone, Debug, PartialEq)]
pub enum StateEvent<S> {
    /// Baseline sent on subscription.
    CurrentState {
        /// The emitting machine.
        source: MachineId,
        /// Its state at subscription time.
        state: S,
    },
    /// A real state change (source state differs from target state).
    Transition {
        /// The emitting machine.
        source: MachineId,
        /// The state the machine left.
        from: S,
        /// The state the machine entered.
        to: S,
    },
}

/// A reference through which an observer receives [`StateEvent`]s.
pub struct ObserverRef<S> {
    id: ObserverId,
    sender: mpsc::UnboundedSender<StateEvent<S>>,
}

impl<S> ObserverRef<S> {
    /// Creates an observer endpoint: the reference to hand to
    /// [`MachineRef::subscribe`] and the receiver to read events from.
    ///
    /// [`MachineRef::subscribe`]: crate::MachineRef::subscribe
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StateEvent<S>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = ObserverId(OBSERVER_COUNTER.fetch_add(1, Ordering::Relaxed));
        (Self { id, sender }, receiver)
    }

    /// Returns the identity of this observer.
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Targeted delivery, used for the `CurrentState` baseline.
    pub(crate) fn notify(&self, event: StateEvent<S>) -> bool {
        self.sender.send(event).is_ok()
    }
}

impl<S> Clone for ObserverRef<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            sender: self.sender.clone(),
        }
    }
}

/// One admitted observer together with the token of its watch task.
struct WatchedObserver<S> {
    sender: mpsc::UnboundedSender<StateEvent<S>>,
    watch: CancellationToken,
}

impl<S> Drop for WatchedObserver<S> {
    fn drop(&mut self) {
        self.watch.cancel();
    }
}

/// The listener set of one machine. Confined to the machine's serialized
/// execution context; only the watch tasks run elsewhere, and they do
/// nothing but report a closed observer mailbox.
pub(crate) struct Listeners<S> {
    observers: HashMap<ObserverId, WatchedObserver<S>>,
}

impl<S> Listeners<S>
where
    S: Clone + Send + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            observers: HashMap::new(),
        }
    }

    /// Admits an observer and starts watching it. Returns `false` when the
    /// observer was already admitted (no second watch task is spawned).
    pub(crate) fn add<F>(&mut self, observer: &ObserverRef<S>, on_terminated: F) -> bool
    where
        F: FnOnce(ObserverId) + Send + 'static,
    {
        if self.observers.contains_key(&observer.id) {
            return false;
        }
        let watch = CancellationToken::new();
        let token = watch.clone();
        let sender = observer.sender.clone();
        let id = observer.id;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sender.closed() => {
                    debug!("Observer {} terminated.", id);
                    on_terminated(id);
                }
            }
        });
        self.observers.insert(
            observer.id,
            WatchedObserver {
                sender: observer.sender.clone(),
                watch,
            },
        );
        true
    }

    /// Unwatches and removes an observer. Idempotent.
    pub(crate) fn remove(&mut self, id: &ObserverId) {
        self.observers.remove(id);
    }

    /// Sends `event` to every admitted observer. Closed mailboxes are
    /// ignored; their watch task reports the termination separately.
    pub(crate) fn gossip(&self, event: &StateEvent<S>) {
        for observer in self.observers.values() {
            let _ = observer.sender.send(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    fn machine_id() -> MachineId {
        MachineId::new("test")
    }

    #[tokio::test]
    async fn test_add_gossip_remove() {
        let mut listeners: Listeners<&str> = Listeners::new();
        let (observer, mut receiver) = ObserverRef::channel();
        assert!(listeners.add(&observer, |_| {}));
        assert!(!listeners.add(&observer, |_| {}));

        let event = StateEvent::CurrentState {
            source: machine_id(),
            state: "idle",
        };
        listeners.gossip(&event);
        // Admitted once: exactly one delivery.
        assert_eq!(receiver.recv().await, Some(event.clone()));
        assert!(receiver.try_recv().is_err());

        listeners.remove(&observer.id());
        listeners.remove(&observer.id());
        listeners.gossip(&event);
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_watch_reports_dropped_observer() {
        let mut listeners: Listeners<&str> = Listeners::new();
        let (observer, receiver) = ObserverRef::channel();
        let (probe, mut probe_rx) = mpsc::unbounded_channel();
        listeners.add(&observer, move |id| {
            let _ = probe.send(id);
        });

        drop(receiver);
        assert_eq!(probe_rx.recv().await, Some(observer.id()));
    }

    #[tokio::test]
    async fn test_remove_cancels_watch() {
        let mut listeners: Listeners<&str> = Listeners::new();
        let (observer, receiver) = ObserverRef::channel();
        let (probe, mut probe_rx) = mpsc::unbounded_channel();
        listeners.add(&observer, move |id| {
            let _ = probe.send(id);
        });

        listeners.remove(&observer.id());
        drop(receiver);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(probe_rx.try_recv().is_err());
    }
}
