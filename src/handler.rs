// Copyright 2025 Stator Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{
    listeners::{ObserverId, ObserverRef},
    machine::{FsmMessage, MachineId, StateKey},
    Error,
};

use tokio::sync::mpsc;

use tracing::debug;

/// Everything a machine's mailbox accepts. User messages carry an optional
/// reply endpoint; the remaining variants are the system messages the
/// kernel consumes itself.
pub(crate) enum Envelope<S: StateKey, M: FsmMessage, R: FsmMessage> {
    /// A user event for the current state's handler.
    User {
        message: M,
        reply_to: Option<ReplyTo<R>>,
    },
    /// A named timer fired. Admission-checked against the timer table.
    TimerFired {
        name: String,
        message: M,
        repeat: bool,
        generation: u64,
    },
    /// The state-entry timeout elapsed. Admission-checked by generation.
    StateTimeout { generation: u64 },
    /// Admit a transition observer and send it the baseline.
    Subscribe(ObserverRef<S>),
    /// Remove a transition observer.
    Unsubscribe(ObserverId),
    /// Alternate admission channel; feeds the same listener set.
    Listen(ObserverRef<S>),
    /// Alternate removal channel.
    Deafen(ObserverId),
    /// An admitted observer's mailbox closed.
    ObserverTerminated(ObserverId),
    /// Host request to stop the machine.
    Stop,
}

/// Mailbox receiver.
pub(crate) type MailboxReceiver<S, M, R> = mpsc::UnboundedReceiver<Envelope<S, M, R>>;

/// Mailbox sender.
pub(crate) type MailboxSender<S, M, R> = mpsc::UnboundedSender<Envelope<S, M, R>>;

/// Mailbox factory.
pub(crate) fn mailbox<S: StateKey, M: FsmMessage, R: FsmMessage>(
) -> (MailboxSender<S, M, R>, MailboxReceiver<S, M, R>) {
    mpsc::unbounded_channel()
}

/// Reply endpoint attached to a user message. The machine delivers the
/// replies a handler accumulated with `replying` through this endpoint, in
/// the order the handler accumulated them.
pub struct ReplyTo<R> {
    sender: mpsc::UnboundedSender<R>,
}

impl<R> ReplyTo<R> {
    /// Creates a reply endpoint and the receiver to read replies from.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<R>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub(crate) fn send(&self, reply: R) -> bool {
        self.sender.send(reply).is_ok()
    }
}

impl<R> Clone for ReplyTo<R> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

/// Handle for sending messages to a running machine.
///
/// Clones share the same mailbox. The handle stays valid for the machine's
/// whole life; once the machine terminates, sends fail with
/// [`Error::Send`].
pub struct MachineRef<S, M, R>
where
    S: StateKey,
    M: FsmMessage,
    R: FsmMessage,
{
    id: MachineId,
    sender: MailboxSender<S, M, R>,
}

impl<S, M, R> MachineRef<S, M, R>
where
    S: StateKey,
    M: FsmMessage,
    R: FsmMessage,
{
    pub(crate) fn new(id: MachineId, sender: MailboxSender<S, M, R>) -> Self {
        Self { id, sender }
    }

    fn send(&self, envelope: Envelope<S, M, R>) -> Result<(), Error> {
        self.sender
            .send(envelope)
            .map_err(|_| Error::Send(self.id.to_string()))
    }

    /// Sends a user message without a reply endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Send`] when the machine has terminated.
    pub async fn tell(&self, message: M) -> Result<(), Error> {
        self.send(Envelope::User {
            message,
            reply_to: None,
        })
    }

    /// Sends a user message together with a reply endpoint. Replies the
    /// handler accumulates for this message are delivered through it.
    pub async fn tell_from(
        &self,
        message: M,
        reply_to: ReplyTo<R>,
    ) -> Result<(), Error> {
        self.send(Envelope::User {
            message,
            reply_to: Some(reply_to),
        })
    }

    /// Sends a user message and waits for the first reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Send`] when the machine has terminated, or
    /// [`Error::NoReply`] when it processes the message (or stops) without
    /// replying.
    pub async fn ask(&self, message: M) -> Result<R, Error> {
        let (reply_to, mut receiver) = ReplyTo::channel();
        self.tell_from(message, reply_to).await?;
        receiver
            .recv()
            .await
            .ok_or_else(|| Error::NoReply(self.id.to_string()))
    }

    /// Registers `observer` as a transition observer. The machine answers
    /// with a `CurrentState` baseline, then gossips every real transition.
    pub async fn subscribe(&self, observer: ObserverRef<S>) -> Result<(), Error> {
        self.send(Envelope::Subscribe(observer))
    }

    /// Removes `observer` from the machine's listener set.
    pub async fn unsubscribe(&self, observer: &ObserverRef<S>) -> Result<(), Error> {
        self.send(Envelope::Unsubscribe(observer.id()))
    }

    /// Equivalent admission channel to [`subscribe`](Self::subscribe); both
    /// feed the same listener set.
    pub async fn listen(&self, observer: ObserverRef<S>) -> Result<(), Error> {
        self.send(Envelope::Listen(observer))
    }

    /// Equivalent removal channel to [`unsubscribe`](Self::unsubscribe).
    pub async fn deafen(&self, observer: &ObserverRef<S>) -> Result<(), Error> {
        self.send(Envelope::Deafen(observer.id()))
    }

    /// Asks the machine to stop. The termination sequence runs with
    /// `Reason::Shutdown`. Best effort: a machine that already stopped is
    /// left alone.
    pub async fn stop(&self) {
        debug!("Stopping machine {} from handle.", self.id);
        let _ = self.sender.send(Envelope::Stop);
    }

    /// Returns the machine's identity.
    pub fn id(&self) -> &MachineId {
        &self.id
    }

    /// True once the machine's runner has dropped the mailbox.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl<S, M, R> Clone for MachineRef<S, M, R>
where
    S: StateKey,
    M: FsmMessage,
    R: FsmMessage,
{
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            sender: self.sender.clone(),
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct TestState;

    impl StateKey for TestState {}

    #[derive(Clone, Debug, PartialEq)]
    struct TestMessage(u32);

    impl FsmMessage for TestMessage {}

    #[test]
    fn test_mailbox() {
        let (sender, receiver) = mailbox::<TestState, TestMessage, TestMessage>();
        assert!(!sender.is_closed());
        drop(receiver);
        assert!(sender.is_closed());
    }

    #[tokio::test]
    async fn test_reply_to_channel() {
        let (reply_to, mut receiver) = ReplyTo::channel();
        assert!(reply_to.send(5u32));
        assert_eq!(receiver.recv().await, Some(5));
        drop(receiver);
        assert!(!reply_to.send(6));
    }
}
