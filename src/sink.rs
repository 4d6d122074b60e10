// Copyright 2025 Stator Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{listeners::StateEvent, machine::StateKey};

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;

use tracing::debug;

/// Drains an observer mailbox and forwards every notification to a
/// [`Subscriber`]. Pair with [`ObserverRef::channel`] and run the sink in
/// its own task.
///
/// [`ObserverRef::channel`]: crate::ObserverRef::channel
pub struct TransitionSink<S: StateKey> {
    subscriber: Box<dyn Subscriber<S>>,
    receiver: UnboundedReceiver<StateEvent<S>>,
}

impl<S: StateKey> TransitionSink<S> {
    pub fn new(
        receiver: UnboundedReceiver<StateEvent<S>>,
        subscriber: impl Subscriber<S>,
    ) -> Self {
        TransitionSink {
            subscriber: Box::new(subscriber),
            receiver,
        }
    }

    /// Runs until the machine terminates and the observer channel closes.
    pub async fn run(&mut self) {
        while let Some(event) = self.receiver.recv().await {
            debug!("Received {:?}. Notify the subscriber.", event);
            self.subscriber.notify(event).await;
        }
    }
}

/// Callback side of a [`TransitionSink`].
#[async_trait]
pub trait Subscriber<S: StateKey>: Send + Sync + 'static {
    async fn notify(&self, event: StateEvent<S>);
}
