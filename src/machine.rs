// Copyright 2025 Stator Contributors
// SPDX-License-Identifier: Apache-2.0

//! # State machine
//!
//! The `machine` module provides the `StateMachine` definition type, the
//! `MachineRunner` that executes it, and the `MachineContext` handed to
//! state handlers. A machine is described by registering per-state handlers
//! with [`StateMachine::when`], an initial state with
//! [`StateMachine::start_with`] and optional transition/termination hooks;
//! [`StateMachine::spawn`] then turns the description into a running task
//! with a serialized mailbox.
//!
//! Handlers are synchronous functions from an [`Event`] to a transition
//! descriptor ([`State`]). Everything the kernel does for one message runs
//! to completion before the next message is dequeued: handler invocation,
//! reply delivery, transition hooks, observer gossip and timeout arming all
//! share the machine's execution context and need no locking. Scheduler and
//! watch tasks never touch machine state; they only post messages back into
//! the mailbox.
//!

use crate::{
    handler::{mailbox, Envelope, MailboxReceiver, MailboxSender, MachineRef, ReplyTo},
    listeners::{Listeners, ObserverRef, StateEvent},
    registry::StateRegistry,
    state::{Event, EventPayload, Reason, State, StopEvent},
    timers::{Scheduler, TimerTable},
    Error,
};

use tokio_util::sync::CancellationToken;

use tracing::{debug, error, warn};

use std::{
    fmt,
    hash::Hash,
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
    time::Duration,
};

/// Marker trait for state names: value-equatable registry keys.
pub trait StateKey:
    Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static
{
}

/// Marker trait for state data, carried by value through descriptors.
pub trait StateData: Clone + fmt::Debug + PartialEq + Send + 'static {}

/// Marker trait for the message and reply payloads a machine exchanges.
pub trait FsmMessage:
    Clone + fmt::Debug + PartialEq + Send + Sync + 'static
{
}

static MACHINE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity of a machine. Carried in every observer
/// notification so observers can tell sources apart.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MachineId {
    name: Arc<str>,
    uid: u64,
}

impl MachineId {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            uid: MACHINE_COUNTER.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// The name the machine was created with.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.uid)
    }
}

/// Machine configuration. `debug_event` enables the per-message,
/// per-transition and per-timer traces.
#[derive(Clone, Debug, Default)]
pub struct Settings {
    /// Log every processed event, transition and timer operation.
    pub debug_event: bool,
}

/// A transition hook, invoked as `(ctx, from, to)` on real state changes.
pub type TransitionHook<S, D, M, R> =
    Box<dyn FnMut(&mut MachineContext<'_, S, D, M, R>, &S, &S) + Send>;

/// The user finalizer, invoked exactly once during termination.
pub type Finalizer<S, D> = Box<dyn FnMut(StopEvent<S, D>) + Send>;

/// Where an event came from, for the debug traces.
pub(crate) enum EventSource {
    Sender,
    Timer(String),
    StateTimeout,
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSource::Sender => write!(f, "sender"),
            EventSource::Timer(name) => write!(f, "timer '{}'", name),
            EventSource::StateTimeout => write!(f, "state timeout"),
        }
    }
}

/// The machine surface available inside state handlers and transition
/// hooks: descriptor constructors, the named-timer operations and the
/// current (and, during a transition, upcoming) state.
pub struct MachineContext<'a, S, D, M, R>
where
    S: StateKey,
    D: StateData,
    M: FsmMessage,
    R: FsmMessage,
{
    id: &'a MachineId,
    timers: &'a mut TimerTable<S, M, R>,
    timeouts: &'a mut std::collections::HashMap<S, Duration>,
    current: &'a State<S, D, R>,
    next: Option<&'a State<S, D, R>>,
}

impl<S, D, M, R> MachineContext<'_, S, D, M, R>
where
    S: StateKey,
    D: StateData,
    M: FsmMessage,
    R: FsmMessage,
{
    /// The machine's identity.
    pub fn id(&self) -> &MachineId {
        self.id
    }

    /// The current state's name.
    pub fn state_name(&self) -> &S {
        &self.current.name
    }

    /// The current state's data.
    pub fn state_data(&self) -> &D {
        &self.current.data
    }

    /// The data of the state being transitioned into.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NextStateData`] outside of a transition; the value
    /// is only exposed while transition hooks run.
    pub fn next_state_data(&self) -> Result<&D, Error> {
        self.next.map(|state| &state.data).ok_or(Error::NextStateData)
    }

    /// Produces a descriptor targeting `name`, carrying the current data.
    pub fn goto(&self, name: S) -> State<S, D, R> {
        State::new(name, self.current.data.clone())
    }

    /// Produces a descriptor that stays in the current state.
    pub fn stay(&self) -> State<S, D, R> {
        self.goto(self.current.name.clone())
    }

    /// Produces a descriptor that stops the machine with [`Reason::Normal`].
    pub fn stop(&self) -> State<S, D, R> {
        self.stop_with(Reason::Normal)
    }

    /// Produces a descriptor that stops the machine with `reason`. Combine
    /// with [`State::using`] to replace the final state data.
    pub fn stop_with(&self, reason: Reason) -> State<S, D, R> {
        self.stay().with_stop_reason(reason)
    }

    /// Schedules `message` under `name` after `delay`, replacing any timer
    /// already held under that name. With `repeat`, the timer fires every
    /// `delay` until cancelled.
    pub fn set_timer(&mut self, name: &str, message: M, delay: Duration, repeat: bool) {
        self.timers.set(name, message, delay, repeat);
    }

    /// Cancels the named timer. Idempotent; a firing that is already
    /// enqueued will be discarded unprocessed.
    pub fn cancel_timer(&mut self, name: &str) {
        self.timers.cancel(name);
    }

    /// True while a timer is held under `name`; see the timer table for the
    /// one-shot window semantics.
    pub fn is_timer_active(&self, name: &str) -> bool {
        self.timers.is_active(name)
    }

    /// Stores (or clears, with `None`) the default state-entry timeout for
    /// `name`. Takes effect the next time that state is entered.
    pub fn set_state_timeout(&mut self, name: S, timeout: Option<Duration>) {
        match timeout {
            Some(timeout) => {
                self.timeouts.insert(name, timeout);
            }
            None => {
                self.timeouts.remove(&name);
            }
        }
    }
}

/// Description of a state machine: per-state handlers, initial state,
/// transition hooks, finalizer and settings. Consumed by
/// [`create`](Self::create) or [`spawn`](Self::spawn).
pub struct StateMachine<S, D, M, R>
where
    S: StateKey,
    D: StateData,
    M: FsmMessage,
    R: FsmMessage,
{
    name: String,
    registry: StateRegistry<S, D, M, R>,
    transition_hooks: Vec<TransitionHook<S, D, M, R>>,
    finalizer: Option<Finalizer<S, D>>,
    start: Option<(S, D, Option<Duration>)>,
    settings: Settings,
}

impl<S, D, M, R> StateMachine<S, D, M, R>
where
    S: StateKey,
    D: StateData,
    M: FsmMessage,
    R: FsmMessage,
{
    /// Creates an empty machine description.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            registry: StateRegistry::new(),
            transition_hooks: Vec::new(),
            finalizer: None,
            start: None,
            settings: Settings::default(),
        }
    }

    /// Applies host-supplied settings.
    pub fn with_settings(&mut self, settings: Settings) -> &mut Self {
        self.settings = settings;
        self
    }

    /// Enables or disables the per-event debug traces.
    pub fn debug_events(&mut self, enabled: bool) -> &mut Self {
        self.settings.debug_event = enabled;
        self
    }

    /// Registers `handler` for state `name`.
    ///
    /// Registering a second handler for the same state chains it behind the
    /// first: the earlier handler is tried first and the later one is
    /// consulted only when it returns `None`. The default state-entry
    /// timeout for a state is the first non-`None` one supplied; later
    /// registrations do not override it.
    pub fn when<F>(
        &mut self,
        name: S,
        default_timeout: Option<Duration>,
        handler: F,
    ) -> &mut Self
    where
        F: FnMut(
                Event<M, D>,
                &mut MachineContext<'_, S, D, M, R>,
            ) -> Option<State<S, D, R>>
            + Send
            + 'static,
    {
        self.registry.register(name, Box::new(handler), default_timeout);
        self
    }

    /// Replaces the handler consulted when no state handler accepted an
    /// event. The built-in "log a warning and stay" fallback remains behind
    /// it.
    pub fn when_unhandled<F>(&mut self, handler: F) -> &mut Self
    where
        F: FnMut(
                Event<M, D>,
                &mut MachineContext<'_, S, D, M, R>,
            ) -> Option<State<S, D, R>>
            + Send
            + 'static,
    {
        self.registry.set_unhandled(Box::new(handler));
        self
    }

    /// Registers a transition hook, invoked as `(ctx, from, to)` before
    /// observers are notified. Hooks fire on real state changes only;
    /// staying in a state is not a transition.
    pub fn on_transition<F>(&mut self, hook: F) -> &mut Self
    where
        F: FnMut(&mut MachineContext<'_, S, D, M, R>, &S, &S) + Send + 'static,
    {
        self.transition_hooks.push(Box::new(hook));
        self
    }

    /// Registers the finalizer invoked exactly once when the machine
    /// terminates.
    pub fn on_termination<F>(&mut self, finalizer: F) -> &mut Self
    where
        F: FnMut(StopEvent<S, D>) + Send + 'static,
    {
        self.finalizer = Some(Box::new(finalizer));
        self
    }

    /// Sets the initial state, data and optional state-entry timeout
    /// override. Committed when the runner initializes.
    pub fn start_with(
        &mut self,
        name: S,
        data: D,
        timeout: Option<Duration>,
    ) -> &mut Self {
        self.start = Some((name, data, timeout));
        self
    }

    /// Stores (or clears) the default state-entry timeout for `name`,
    /// overriding any timeout supplied through [`when`](Self::when).
    pub fn set_state_timeout(&mut self, name: S, timeout: Option<Duration>) -> &mut Self {
        self.registry.set_timeout(name, timeout);
        self
    }

    /// Builds the mailbox and runner for this description.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Uninitialized`] when [`start_with`](Self::start_with)
    /// was never called.
    pub fn create(
        self,
    ) -> Result<(MachineRef<S, M, R>, MachineRunner<S, D, M, R>), Error> {
        let start = self.start.ok_or_else(|| {
            Error::Uninitialized("start_with was never called".to_owned())
        })?;
        let id = MachineId::new(&self.name);
        debug!("Creating machine {}.", id);
        let (sender, receiver) = mailbox();
        let debug_event = self.settings.debug_event;
        let runner = MachineRunner {
            id: id.clone(),
            registry: self.registry,
            transition_hooks: self.transition_hooks,
            finalizer: self.finalizer,
            start,
            debug_event,
            timers: TimerTable::new(sender.clone(), debug_event),
            scheduler: Scheduler::new(sender.clone()),
            listeners: Listeners::new(),
            sender: sender.clone(),
            receiver,
            current: None,
            next: None,
            generation: 0,
            timeout_token: None,
            in_flight_reply: None,
            token: CancellationToken::new(),
            stopping: false,
        };
        Ok((MachineRef::new(id, sender), runner))
    }

    /// Convenience over [`create`](Self::create): spawns the runner on the
    /// current tokio runtime and returns the handle.
    pub fn spawn(self) -> Result<MachineRef<S, M, R>, Error> {
        let (machine_ref, runner) = self.create()?;
        tokio::spawn(async move {
            runner.run().await;
        });
        Ok(machine_ref)
    }
}

/// Executes one machine description: the serialized receive loop.
pub struct MachineRunner<S, D, M, R>
where
    S: StateKey,
    D: StateData,
    M: FsmMessage,
    R: FsmMessage,
{
    id: MachineId,
    registry: StateRegistry<S, D, M, R>,
    transition_hooks: Vec<TransitionHook<S, D, M, R>>,
    finalizer: Option<Finalizer<S, D>>,
    start: (S, D, Option<Duration>),
    debug_event: bool,
    timers: TimerTable<S, M, R>,
    scheduler: Scheduler<Envelope<S, M, R>>,
    listeners: Listeners<S>,
    sender: MailboxSender<S, M, R>,
    receiver: MailboxReceiver<S, M, R>,
    /// The committed current state. `None` only before initialization.
    current: Option<State<S, D, R>>,
    /// The upcoming state, exposed to hooks while a transition is applied.
    next: Option<State<S, D, R>>,
    /// State-timeout generation; bumped on every user message so stale
    /// timeout markers are dropped on arrival.
    generation: u64,
    /// Token of the pending state-entry timeout, if one is armed.
    timeout_token: Option<CancellationToken>,
    /// Reply endpoint of the message currently being processed.
    in_flight_reply: Option<ReplyTo<R>>,
    token: CancellationToken,
    stopping: bool,
}

impl<S, D, M, R> MachineRunner<S, D, M, R>
where
    S: StateKey,
    D: StateData,
    M: FsmMessage,
    R: FsmMessage,
{
    /// Commits the `start_with` state and arms the first state-entry
    /// timeout. Called by [`run`](Self::run); a host embedding the runner
    /// may call it earlier. Starting in an unregistered state terminates
    /// the machine with a `Failure`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Uninitialized`] when the runner ends up without a
    /// current state, which the kernel treats as a fatal condition.
    pub fn initialize(&mut self) -> Result<(), Error> {
        if self.current.is_some() {
            return Ok(());
        }
        let (name, data, timeout) = self.start.clone();
        debug!("Initializing machine {} in state {:?}.", self.id, name);
        if !self.registry.contains(&name) {
            let reason =
                Reason::Failure(format!("Next state {:?} does not exist", name));
            self.terminate(reason, State::new(name, data));
            return Ok(());
        }
        let mut state = State::new(name, data);
        state.timeout = timeout.filter(|timeout| *timeout != Duration::MAX);
        self.current = Some(state);
        self.arm_state_timeout()
    }

    /// The committed current state, or the error every kernel path turns
    /// into a `Failure` stop when the initialization invariant is broken.
    fn current_state(&self) -> Result<&State<S, D, R>, Error> {
        self.current.as_ref().ok_or_else(|| {
            Error::Uninitialized("the machine has no current state".to_owned())
        })
    }

    /// Runs the machine until it terminates. Every handler invocation and
    /// every system message is processed here, one at a time, in mailbox
    /// order.
    pub async fn run(mut self) {
        if let Err(error) = self.initialize() {
            error!("Machine {} failed to initialize: {}", self.id, error);
            self.stop_with_reason(Reason::Failure(error.to_string()));
        }
        debug!("Machine {} is running.", self.id);
        while !self.stopping {
            tokio::select! {
                envelope = self.receiver.recv() => {
                    match envelope {
                        Some(envelope) => {
                            if let Err(error) = self.dispatch(envelope) {
                                error!(
                                    "Machine {} failed to process a message: {}",
                                    self.id, error
                                );
                                self.stop_with_reason(Reason::Failure(
                                    error.to_string(),
                                ));
                            }
                        }
                        None => self.stop_from_host(),
                    }
                }
                _ = self.token.cancelled() => {
                    self.stop_from_host();
                }
            }
        }
        // Safety net: a runner never exits without the termination sequence
        // having run.
        self.stop_from_host();
        self.receiver.close();
        debug!("Machine {} is terminated.", self.id);
    }

    /// Classifies one dequeued message. First match wins; observer
    /// administration is not a user event and leaves the state-entry
    /// timeout untouched.
    fn dispatch(&mut self, envelope: Envelope<S, M, R>) -> Result<(), Error> {
        match envelope {
            Envelope::StateTimeout { generation } => {
                if generation == self.generation {
                    self.timeout_token = None;
                    self.in_flight_reply = None;
                    self.process_event(
                        EventPayload::StateTimeout,
                        EventSource::StateTimeout,
                    )?;
                } else if self.debug_event {
                    debug!("Machine {} dropping stale state timeout.", self.id);
                }
            }
            Envelope::TimerFired {
                name,
                message,
                repeat,
                generation,
            } => {
                if self.timers.admit(&name, generation) {
                    if self.debug_event {
                        debug!("Timer '{}' fired on machine {}.", name, self.id);
                    }
                    self.cancel_state_timeout();
                    self.generation += 1;
                    if !repeat {
                        self.timers.consume(&name);
                    }
                    self.in_flight_reply = None;
                    self.process_event(
                        EventPayload::Message(message),
                        EventSource::Timer(name),
                    )?;
                } else if self.debug_event {
                    debug!(
                        "Machine {} discarding stale firing of timer '{}'.",
                        self.id, name
                    );
                }
            }
            Envelope::Subscribe(observer) | Envelope::Listen(observer) => {
                self.admit_observer(observer);
            }
            Envelope::Unsubscribe(id) | Envelope::Deafen(id) => {
                debug!("Machine {} removing observer {}.", self.id, id);
                self.listeners.remove(&id);
            }
            Envelope::ObserverTerminated(id) => {
                debug!(
                    "Machine {} removing terminated observer {}.",
                    self.id, id
                );
                self.listeners.remove(&id);
            }
            Envelope::User { message, reply_to } => {
                self.cancel_state_timeout();
                self.generation += 1;
                self.in_flight_reply = reply_to;
                self.process_event(
                    EventPayload::Message(message),
                    EventSource::Sender,
                )?;
            }
            Envelope::Stop => {
                debug!("Machine {} received a stop request.", self.id);
                self.stop_from_host();
            }
        }
        Ok(())
    }

    /// Admits a transition observer: watch it, add it to the listener set
    /// and send it the `CurrentState` baseline. Re-subscribing an already
    /// admitted observer re-sends the baseline only.
    fn admit_observer(&mut self, observer: ObserverRef<S>) {
        let Some(current) = &self.current else {
            return;
        };
        debug!("Machine {} admitting observer {}.", self.id, observer.id());
        let sender = self.sender.clone();
        self.listeners.add(&observer, move |id| {
            let _ = sender.send(Envelope::ObserverTerminated(id));
        });
        observer.notify(StateEvent::CurrentState {
            source: self.id.clone(),
            state: current.name.clone(),
        });
    }

    /// Builds the event for the current state, runs the handler chain and
    /// applies the resulting descriptor. Falls through to the unhandled
    /// handler and finally to "log a warning and stay".
    fn process_event(
        &mut self,
        payload: EventPayload<M>,
        source: EventSource,
    ) -> Result<(), Error> {
        let next_state = {
            let MachineRunner {
                id,
                registry,
                timers,
                current,
                next,
                debug_event,
                ..
            } = self;
            let id: &MachineId = id;
            let debug_event = *debug_event;
            let Some(current) = current.as_ref() else {
                return Err(Error::Uninitialized(
                    "the machine has no current state".to_owned(),
                ));
            };
            if debug_event {
                debug!(
                    "Machine {} processing {:?} from {} in state {:?}.",
                    id, payload, source, current.name
                );
            }
            let event = Event::new(payload, current.data.clone());
            let StateRegistry {
                handlers,
                timeouts,
                unhandled,
            } = registry;
            let mut ctx = MachineContext {
                id,
                timers,
                timeouts,
                current,
                next: next.as_ref(),
            };
            let mut result = None;
            if let Some(chain) = handlers.get_mut(&current.name) {
                for handler in chain.iter_mut() {
                    if let Some(state) = handler(event.clone(), &mut ctx) {
                        result = Some(state);
                        break;
                    }
                }
            }
            if result.is_none() {
                if let Some(handler) = unhandled.as_mut() {
                    result = handler(event.clone(), &mut ctx);
                }
            }
            match result {
                Some(state) => state,
                None => {
                    warn!(
                        "Machine {} unhandled event {:?} in state {:?}.",
                        id, event.payload, current.name
                    );
                    ctx.stay()
                }
            }
        };
        let applied = self.apply_state(next_state);
        // Drop the reply endpoint so an ask with no reply resolves instead
        // of waiting on a sender the machine still holds.
        self.in_flight_reply = None;
        applied
    }

    /// Applies a descriptor: replies first, then either the termination
    /// sequence or the transition.
    fn apply_state(&mut self, mut state: State<S, D, R>) -> Result<(), Error> {
        match state.stop_reason.take() {
            Some(reason) => {
                let replies = std::mem::take(&mut state.replies);
                self.deliver_replies(replies);
                self.terminate(reason, state);
                Ok(())
            }
            None => self.make_transition(state),
        }
    }

    fn make_transition(&mut self, mut state: State<S, D, R>) -> Result<(), Error> {
        if !self.registry.contains(&state.name) {
            let reason = Reason::Failure(format!(
                "Next state {:?} does not exist",
                state.name
            ));
            let current = self.current_state()?;
            let synthetic = State::new(current.name.clone(), current.data.clone())
                .with_stop_reason(reason);
            return self.apply_state(synthetic);
        }
        let replies = std::mem::take(&mut state.replies);
        self.deliver_replies(replies);

        let old = self.current_state()?;
        if self.debug_event && *old != state {
            debug!(
                "Machine {} transition {:?} -> {:?}.",
                self.id, old.name, state.name
            );
        }
        let changed = old.name != state.name;
        if changed {
            let from = old.name.clone();
            let to = state.name.clone();
            self.next = Some(state.clone());
            self.run_transition_hooks(&from, &to)?;
            self.listeners.gossip(&StateEvent::Transition {
                source: self.id.clone(),
                from,
                to,
            });
            self.next = None;
        }
        self.current = Some(state);
        self.arm_state_timeout()
    }

    fn run_transition_hooks(&mut self, from: &S, to: &S) -> Result<(), Error> {
        let MachineRunner {
            id,
            registry,
            timers,
            current,
            next,
            transition_hooks,
            ..
        } = self;
        let id: &MachineId = id;
        let Some(current) = current.as_ref() else {
            return Err(Error::Uninitialized(
                "the machine has no current state".to_owned(),
            ));
        };
        let StateRegistry { timeouts, .. } = registry;
        let mut ctx = MachineContext {
            id,
            timers,
            timeouts,
            current,
            next: next.as_ref(),
        };
        for hook in transition_hooks.iter_mut() {
            hook(&mut ctx, from, to);
        }
        Ok(())
    }

    /// Delivers accumulated replies to the sender of the in-flight message,
    /// in the order the handler accumulated them.
    fn deliver_replies(&self, replies: Vec<R>) {
        if replies.is_empty() {
            return;
        }
        match &self.in_flight_reply {
            Some(reply_to) => {
                for reply in replies {
                    if !reply_to.send(reply) {
                        debug!(
                            "Machine {} dropping a reply: the sender is gone.",
                            self.id
                        );
                    }
                }
            }
            None => debug!(
                "Machine {} dropping {} reply(ies): event has no sender.",
                self.id,
                replies.len()
            ),
        }
    }

    /// Arms the state-entry timeout for the just-entered state: the
    /// descriptor override if present, else the registry default. Values at
    /// or beyond [`Duration::MAX`] mean "no timeout".
    fn arm_state_timeout(&mut self) -> Result<(), Error> {
        let current = self.current_state()?;
        let timeout = current
            .timeout
            .or_else(|| self.registry.timeout_for(&current.name));
        let Some(timeout) = timeout else {
            return Ok(());
        };
        if timeout >= Duration::MAX {
            return Ok(());
        }
        if self.debug_event {
            debug!(
                "Machine {} arming state timeout {:?} for {:?}.",
                self.id, timeout, current.name
            );
        }
        let token = CancellationToken::new();
        self.timeout_token = Some(token.clone());
        self.scheduler.schedule_once(
            timeout,
            Envelope::StateTimeout {
                generation: self.generation,
            },
            token,
        );
        Ok(())
    }

    fn cancel_state_timeout(&mut self) {
        if let Some(token) = self.timeout_token.take() {
            token.cancel();
        }
    }

    /// The termination sequence. Runs at most once: a machine whose current
    /// state already carries a stop reason is left alone. The stop state is
    /// stamped with `reason` and frozen as the final current state.
    fn terminate(&mut self, reason: Reason, mut stop_state: State<S, D, R>) {
        if self.stopping {
            return;
        }
        if self
            .current
            .as_ref()
            .is_some_and(|current| current.stop_reason.is_some())
        {
            return;
        }
        self.log_termination(&reason);
        self.cancel_state_timeout();
        self.timers.cancel_all();
        stop_state.stop_reason = Some(reason.clone());
        let state = stop_state.name.clone();
        let data = stop_state.data.clone();
        self.current = Some(stop_state);
        if let Some(finalizer) = self.finalizer.as_mut() {
            finalizer(StopEvent {
                reason,
                state,
                data,
            });
        }
        self.stopping = true;
        self.token.cancel();
    }

    /// Host-driven stop: the termination sequence with `Shutdown`.
    fn stop_from_host(&mut self) {
        self.stop_with_reason(Reason::Shutdown);
    }

    /// Terminates in place with `reason`, keeping the current state name
    /// and data. Before initialization there is nothing to freeze; the
    /// runner just winds down.
    fn stop_with_reason(&mut self, reason: Reason) {
        if self.stopping {
            return;
        }
        match &self.current {
            Some(current) => {
                let stop_state =
                    State::new(current.name.clone(), current.data.clone());
                self.terminate(reason, stop_state);
            }
            None => {
                self.stopping = true;
                self.token.cancel();
            }
        }
    }

    fn log_termination(&self, reason: &Reason) {
        match reason {
            Reason::Failure(cause) => error!(
                "Machine {} terminating due to failure: {}",
                self.id, cause
            ),
            reason => {
                debug!("Machine {} terminating: {:?}.", self.id, reason)
            }
        }
    }
}
