// Copyright 2025 Stator Contributors
// SPDX-License-Identifier: Apache-2.0

//! # Machine error types
//!
//! This module defines the error conditions a state machine can report to its
//! host: mailbox delivery failures, ask round-trips that end without a reply,
//! machines driven before they were given an initial state, and accesses to
//! transition-scoped data outside of a transition.
//!
//! Errors carry string context and are cheap to clone so they can cross task
//! boundaries together with the messages that produced them.

use thiserror::Error;

/// Error conditions reported by the machine runtime.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum Error {
    /// A message could not be delivered to the machine's mailbox.
    ///
    /// This happens once the machine has terminated and its runner has
    /// dropped the receiving end of the mailbox.
    #[error("An error occurred while sending a message to machine: {0}.")]
    Send(String),

    /// An `ask` round-trip ended without a reply.
    ///
    /// The machine processed the message (or stopped) without ever calling
    /// `replying` for it, so the reply channel closed empty.
    #[error("Machine {0} stopped without replying.")]
    NoReply(String),

    /// The machine was created before `start_with` was called, or driven
    /// without a committed current state.
    #[error("Machine is not initialized: {0}.")]
    Uninitialized(String),

    /// `next_state_data` was read outside of a transition.
    ///
    /// The upcoming state's data is exposed only while transition hooks run.
    #[error("Next state data is only available during a transition.")]
    NextStateData,
}
