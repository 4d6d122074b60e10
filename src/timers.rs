// Copyright 2025 Stator Contributors
// SPDX-License-Identifier: Apache-2.0

//! # Named timers
//!
//! The `timers` module provides the machine's named-timer table and the
//! scheduler that delivers firings back into the machine's own mailbox.
//!
//! Every timer carries the value of a per-machine monotonic generation
//! counter taken at creation time. A firing is honored only when the table
//! still holds an entry under the timer's name *and* that entry carries the
//! same generation. Cancelling a timer, or replacing it under the same name,
//! therefore makes any firing that is already sitting in the mailbox
//! undeliverable: the race between a cancel and an in-flight firing is never
//! observable by handler code.
//!
//! Each table entry owns the cancellation token of its scheduler task;
//! dropping the entry cancels the task. The scheduler-side task holds only a
//! clone of the token and the mailbox sender, never the entry itself.
//!

use crate::{
    handler::{Envelope, MailboxSender},
    machine::{FsmMessage, StateKey},
};

use tokio::time::{interval_at, sleep, Instant};
use tokio_util::sync::CancellationToken;

use tracing::debug;

use std::{collections::HashMap, time::Duration};

/// One-shot and repeating delivery of messages into a mailbox, guarded by a
/// cancellation token per scheduled task.
pub(crate) struct Scheduler<T> {
    sender: tokio::sync::mpsc::UnboundedSender<T>,
}

impl<T> Scheduler<T>
where
    T: Send + 'static,
{
    pub(crate) fn new(sender: tokio::sync::mpsc::UnboundedSender<T>) -> Self {
        Self { sender }
    }

    /// Posts `message` into the mailbox after `delay`, unless `token` is
    /// cancelled first.
    pub(crate) fn schedule_once(
        &self,
        delay: Duration,
        message: T,
        token: CancellationToken,
    ) {
        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(delay) => {
                    let _ = sender.send(message);
                }
            }
        });
    }

    /// Posts `make()` into the mailbox every `interval`, starting after
    /// `initial`, until `token` is cancelled or the mailbox closes.
    pub(crate) fn schedule_repeating<F>(
        &self,
        initial: Duration,
        interval: Duration,
        mut make: F,
        token: CancellationToken,
    ) where
        F: FnMut() -> T + Send + 'static,
    {
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + initial, interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticks.tick() => {
                        if sender.send(make()).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

impl<T> Clone for Scheduler<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

/// Bookkeeping for one named timer. Dropping the entry cancels the
/// scheduler task.
pub(crate) struct TimerEntry {
    pub(crate) generation: u64,
    token: CancellationToken,
}

impl Drop for TimerEntry {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// The named-timer table of one machine.
pub(crate) struct TimerTable<S: StateKey, M: FsmMessage, R: FsmMessage> {
    entries: HashMap<String, TimerEntry>,
    generation: u64,
    scheduler: Scheduler<Envelope<S, M, R>>,
    debug: bool,
}

impl<S, M, R> TimerTable<S, M, R>
where
    S: StateKey,
    M: FsmMessage,
    R: FsmMessage,
{
    pub(crate) fn new(sender: MailboxSender<S, M, R>, debug: bool) -> Self {
        Self {
            entries: HashMap::new(),
            generation: 0,
            scheduler: Scheduler::new(sender),
            debug,
        }
    }

    /// Schedules `message` under `name`, replacing any timer already held
    /// under that name. The firing posts a timer record into the machine's
    /// mailbox, stamped with a fresh generation.
    pub(crate) fn set(
        &mut self,
        name: &str,
        message: M,
        delay: Duration,
        repeat: bool,
    ) {
        if self.entries.remove(name).is_some() && self.debug {
            debug!("Canceling timer '{}' before rescheduling.", name);
        }
        self.generation += 1;
        let generation = self.generation;
        if self.debug {
            debug!(
                "Setting timer '{}' with delay {:?} (repeat: {}).",
                name, delay, repeat
            );
        }
        let token = CancellationToken::new();
        if repeat {
            let timer_name = name.to_owned();
            self.scheduler.schedule_repeating(
                delay,
                delay,
                move || Envelope::TimerFired {
                    name: timer_name.clone(),
                    message: message.clone(),
                    repeat: true,
                    generation,
                },
                token.clone(),
            );
        } else {
            self.scheduler.schedule_once(
                delay,
                Envelope::TimerFired {
                    name: name.to_owned(),
                    message,
                    repeat: false,
                    generation,
                },
                token.clone(),
            );
        }
        self.entries.insert(
            name.to_owned(),
            TimerEntry { generation, token },
        );
    }

    /// Cancels the timer under `name`. Idempotent; never produces a
    /// user-visible event.
    pub(crate) fn cancel(&mut self, name: &str) {
        if self.entries.remove(name).is_some() && self.debug {
            debug!("Canceling timer '{}'.", name);
        }
    }

    /// True while an entry is held under `name`. A one-shot timer whose
    /// firing is enqueued but not yet processed still reports active: the
    /// entry is removed at processing time, not at firing time.
    pub(crate) fn is_active(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Admission check for a dequeued firing: the name must still be in the
    /// table and the generations must match.
    pub(crate) fn admit(&self, name: &str, generation: u64) -> bool {
        self.entries
            .get(name)
            .is_some_and(|entry| entry.generation == generation)
    }

    /// Consumes an admitted one-shot firing's entry.
    pub(crate) fn consume(&mut self, name: &str) {
        self.entries.remove(name);
    }

    /// Cancels and clears every timer. Part of the termination sequence.
    pub(crate) fn cancel_all(&mut self) {
        if self.debug && !self.entries.is_empty() {
            debug!("Canceling all {} timer(s).", self.entries.len());
        }
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::handler::mailbox;

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct TestState;

    impl StateKey for TestState {}

    #[derive(Clone, Debug, PartialEq)]
    struct Tick(&'static str);

    impl FsmMessage for Tick {}

    type TestTable = TimerTable<TestState, Tick, Tick>;

    #[tokio::test]
    async fn test_generations_are_strictly_increasing() {
        let (sender, _receiver) = mailbox();
        let mut table: TestTable = TimerTable::new(sender, false);

        table.set("t", Tick("a"), Duration::from_secs(5), false);
        let first = table.entries.get("t").unwrap().generation;
        table.set("t", Tick("b"), Duration::from_secs(5), false);
        let second = table.entries.get("t").unwrap().generation;
        table.cancel("t");
        table.set("t", Tick("c"), Duration::from_secs(5), true);
        let third = table.entries.get("t").unwrap().generation;

        assert!(first < second);
        assert!(second < third);
    }

    #[tokio::test]
    async fn test_admit_requires_matching_generation() {
        let (sender, _receiver) = mailbox();
        let mut table: TestTable = TimerTable::new(sender, false);

        table.set("t", Tick("a"), Duration::from_secs(5), false);
        let generation = table.entries.get("t").unwrap().generation;
        assert!(table.admit("t", generation));
        assert!(!table.admit("t", generation + 1));

        table.set("t", Tick("b"), Duration::from_secs(5), false);
        assert!(!table.admit("t", generation));

        table.cancel("t");
        assert!(!table.admit("t", generation + 1));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (sender, _receiver) = mailbox();
        let mut table: TestTable = TimerTable::new(sender, false);

        table.set("t", Tick("a"), Duration::from_millis(10), false);
        assert!(table.is_active("t"));
        table.cancel("t");
        table.cancel("t");
        assert!(!table.is_active("t"));
    }

    #[tokio::test]
    async fn test_one_shot_fires_into_mailbox() {
        let (sender, mut receiver) = mailbox();
        let mut table: TestTable = TimerTable::new(sender, false);

        table.set("t", Tick("a"), Duration::from_millis(10), false);
        match receiver.recv().await {
            Some(Envelope::TimerFired {
                name,
                message,
                repeat,
                generation,
            }) => {
                assert_eq!(name, "t");
                assert_eq!(message, Tick("a"));
                assert!(!repeat);
                assert!(table.admit(&name, generation));
            }
            _ => panic!("expected a timer record"),
        }
        // Fired but not yet processed: the entry is still there.
        assert!(table.is_active("t"));
        table.consume("t");
        assert!(!table.is_active("t"));
    }

    #[tokio::test]
    async fn test_cancelled_timer_never_fires() {
        let (sender, mut receiver) = mailbox();
        let mut table: TestTable = TimerTable::new(sender, false);

        table.set("t", Tick("a"), Duration::from_millis(20), false);
        table.cancel("t");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_repeating_timer_fires_until_cancelled() {
        let (sender, mut receiver) = mailbox();
        let mut table: TestTable = TimerTable::new(sender, false);

        table.set("t", Tick("a"), Duration::from_millis(10), true);
        let mut fired = 0;
        while fired < 3 {
            match receiver.recv().await {
                Some(Envelope::TimerFired { repeat, .. }) => {
                    assert!(repeat);
                    fired += 1;
                }
                _ => panic!("expected a timer record"),
            }
        }
        table.cancel_all();
        tokio::time::sleep(Duration::from_millis(50)).await;
        while receiver.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(receiver.try_recv().is_err());
    }
}
