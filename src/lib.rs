// Copyright 2025 Stator Contributors
// SPDX-License-Identifier: Apache-2.0

//! # Event-driven state machine runtime
//!
//! This crate provides a finite state machine runtime in the tradition of
//! actor-style FSMs: a machine is a collection of per-state handler
//! functions over typed state data, executed one message at a time by a
//! serialized mailbox. In response to a message, a handler can:
//!
//! - transition to another registered state, or stay,
//! - replace the state data carried into the next state,
//! - reply to the message's sender,
//! - set, cancel and query named timers,
//! - stop the machine with a reason.
//!
//! Around the handlers the runtime maintains named timers whose firings are
//! admission-checked by generation (a cancel that overlaps an in-flight
//! firing is never observed), state-entry timeouts that restart on every
//! user message, transition observers that receive a `CurrentState`
//! baseline followed by every real transition, and a termination protocol
//! that flushes replies, cancels all timers and runs a user finalizer
//! exactly once.
//!

mod error;
mod handler;
mod listeners;
mod machine;
mod registry;
mod sink;
mod state;
mod timers;

pub use error::Error;

pub use handler::{MachineRef, ReplyTo};
pub use listeners::{ObserverId, ObserverRef, StateEvent};
pub use machine::{
    Finalizer, FsmMessage, MachineContext, MachineId, MachineRunner, Settings,
    StateData, StateKey, StateMachine, TransitionHook,
};
pub use registry::{transform, StateFunction, Transformer};
pub use sink::{Subscriber, TransitionSink};
pub use state::{Event, EventPayload, Reason, State, StopEvent};
