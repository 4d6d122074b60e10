// Copyright 2025 Stator Contributors
// SPDX-License-Identifier: Apache-2.0

//! # Transition descriptors
//!
//! The `state` module provides the `State` type, the value a state handler
//! returns to instruct the kernel what to do next: which state to be in
//! afterwards, with which data, whether a state-entry timeout override
//! applies, which replies to deliver to the sender, and whether the machine
//! should stop instead. It also defines the event value handed to handlers
//! and the termination vocabulary (`Reason`, `StopEvent`).
//!

use std::time::Duration;

/// Reason for a machine's termination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reason {
    /// The machine stopped itself through a handler.
    Normal,
    /// The host asked the machine to stop.
    Shutdown,
    /// Something went wrong; the payload describes the cause.
    Failure(String),
}

/// Passed to the termination finalizer when the machine stops.
#[derive(Clone, Debug, PartialEq)]
pub struct StopEvent<S, D> {
    /// Why the machine stopped.
    pub reason: Reason,
    /// The state the machine terminated in.
    pub state: S,
    /// The state data at termination time.
    pub data: D,
}

/// What triggered a handler invocation.
#[derive(Clone, Debug, PartialEq)]
pub enum EventPayload<M> {
    /// A user message.
    Message(M),
    /// The state-entry timeout for the current state elapsed.
    StateTimeout,
}

/// The immutable pair presented to state handlers: the triggering payload
/// together with the current state data.
#[derive(Clone, Debug, PartialEq)]
pub struct Event<M, D> {
    /// The triggering payload.
    pub payload: EventPayload<M>,
    /// The machine's state data at the time the event was dequeued.
    pub data: D,
}

impl<M, D> Event<M, D> {
    pub(crate) fn new(payload: EventPayload<M>, data: D) -> Self {
        Self { payload, data }
    }
}

/// The transition descriptor a handler returns.
///
/// Descriptors are built fluently from [`MachineContext::goto`],
/// [`MachineContext::stay`] or [`MachineContext::stop`] and refined with the
/// combinators below; each combinator consumes the descriptor and returns a
/// fresh one. The kernel treats the returned value as immutable.
///
/// Equality is structural across all five fields; it is used for the
/// old-versus-new debug trace and in tests.
///
/// [`MachineContext::goto`]: crate::MachineContext::goto
/// [`MachineContext::stay`]: crate::MachineContext::stay
/// [`MachineContext::stop`]: crate::MachineContext::stop
#[derive(Clone, Debug, PartialEq)]
pub struct State<S, D, R> {
    /// The target state.
    pub name: S,
    /// The state data to carry into the target state.
    pub data: D,
    /// Per-transition override of the state-entry timeout.
    pub timeout: Option<Duration>,
    /// When set, the kernel terminates instead of transitioning.
    pub stop_reason: Option<Reason>,
    /// Replies to deliver to the sender of the in-flight message.
    pub replies: Vec<R>,
}

impl<S, D, R> State<S, D, R> {
    /// Creates a plain descriptor targeting `name` with `data`.
    pub fn new(name: S, data: D) -> Self {
        Self {
            name,
            data,
            timeout: None,
            stop_reason: None,
            replies: Vec::new(),
        }
    }

    /// Replaces the state data carried by this descriptor.
    pub fn using(mut self, data: D) -> Self {
        self.data = data;
        self
    }

    /// Sets the state-entry timeout override for the target state.
    ///
    /// Passing [`Duration::MAX`] means "no timeout": the override is cleared
    /// and the kernel falls back to the registry default for the target
    /// state, which is itself never scheduled at or beyond the sentinel.
    pub fn for_max(mut self, timeout: Duration) -> Self {
        self.timeout = if timeout == Duration::MAX {
            None
        } else {
            Some(timeout)
        };
        self
    }

    /// Appends a reply for the sender of the message being processed.
    ///
    /// Replies are delivered in the order `replying` was called, before any
    /// transition event is gossiped to observers.
    pub fn replying(mut self, reply: R) -> Self {
        self.replies.push(reply);
        self
    }

    /// Marks this descriptor as terminating with `reason`.
    pub fn with_stop_reason(mut self, reason: Reason) -> Self {
        self.stop_reason = Some(reason);
        self
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_builder_composition() {
        let state: State<&str, u32, &str> = State::new("idle", 0)
            .using(7)
            .for_max(Duration::from_millis(50))
            .replying("a")
            .replying("b");
        assert_eq!(state.name, "idle");
        assert_eq!(state.data, 7);
        assert_eq!(state.timeout, Some(Duration::from_millis(50)));
        assert_eq!(state.stop_reason, None);
        assert_eq!(state.replies, vec!["a", "b"]);
    }

    #[test]
    fn test_for_max_infinite_sentinel_clears_override() {
        let state: State<&str, u32, ()> = State::new("idle", 0)
            .for_max(Duration::from_secs(1))
            .for_max(Duration::MAX);
        assert_eq!(state.timeout, None);
    }

    #[test]
    fn test_stop_reason() {
        let state: State<&str, u32, ()> =
            State::new("idle", 0).with_stop_reason(Reason::Normal);
        assert_eq!(state.stop_reason, Some(Reason::Normal));
        let state = state.with_stop_reason(Reason::Failure("boom".to_owned()));
        assert_eq!(
            state.stop_reason,
            Some(Reason::Failure("boom".to_owned()))
        );
    }

    #[test]
    fn test_structural_equality() {
        let a: State<&str, u32, &str> = State::new("idle", 1).replying("r");
        let b: State<&str, u32, &str> = State::new("idle", 1).replying("r");
        assert_eq!(a, b);
        assert_ne!(a, b.clone().using(2));
        assert_ne!(a, b.clone().for_max(Duration::from_secs(1)));
        assert_ne!(a, b.with_stop_reason(Reason::Shutdown));
    }
}
