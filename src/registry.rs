// Copyright 2025 Stator Contributors
// SPDX-License-Identifier: Apache-2.0

//! # State registry
//!
//! Stores the per-state handler chains, the per-state default timeouts and
//! the unhandled-event fallback. Registering a second handler for a state
//! chains it behind the existing one: the earlier handler is consulted
//! first, and only when it declines (returns `None`) is the later handler
//! tried. The default timeout for a state is the first one supplied;
//! later registrations never override it ([`StateRegistry::set_timeout`]
//! does, deliberately).
//!

use crate::{
    machine::{FsmMessage, MachineContext, StateData, StateKey},
    state::{Event, State},
};

use std::{collections::HashMap, hash::Hash, time::Duration};

/// A state handler: consumes an [`Event`] and either returns the transition
/// descriptor to apply, or `None` to signal "not handled" so the kernel
/// falls through to the next handler in the chain and finally to the
/// unhandled-event handler.
pub type StateFunction<S, D, M, R> = Box<
    dyn FnMut(
            Event<M, D>,
            &mut MachineContext<'_, S, D, M, R>,
        ) -> Option<State<S, D, R>>
        + Send,
>;

/// Registry of state handlers for one machine.
pub(crate) struct StateRegistry<S: StateKey, D: StateData, M: FsmMessage, R: FsmMessage> {
    /// Handler chains, tried in registration order.
    pub(crate) handlers: HashMap<S, Vec<StateFunction<S, D, M, R>>>,
    /// Default state-entry timeout per state.
    pub(crate) timeouts: HashMap<S, Duration>,
    /// User fallback for events no state handler accepted.
    pub(crate) unhandled: Option<StateFunction<S, D, M, R>>,
}

impl<S, D, M, R> StateRegistry<S, D, M, R>
where
    S: Eq + Hash + Clone + StateKey,
    D: StateData,
    M: FsmMessage,
    R: FsmMessage,
{
    pub(crate) fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            timeouts: HashMap::new(),
            unhandled: None,
        }
    }

    /// Records a handler for `name`, chaining behind any existing ones.
    /// Only the first non-null default timeout for a state is kept.
    pub(crate) fn register(
        &mut self,
        name: S,
        handler: StateFunction<S, D, M, R>,
        default_timeout: Option<Duration>,
    ) {
        if let Some(timeout) = default_timeout {
            self.timeouts.entry(name.clone()).or_insert(timeout);
        }
        self.handlers.entry(name).or_default().push(handler);
    }

    /// Replaces the user part of the unhandled-event handler. The built-in
    /// "log a warning and stay" fallback remains behind it.
    pub(crate) fn set_unhandled(&mut self, handler: StateFunction<S, D, M, R>) {
        self.unhandled = Some(handler);
    }

    /// Stores or overwrites the default timeout for `name`. `None` clears it.
    pub(crate) fn set_timeout(&mut self, name: S, timeout: Option<Duration>) {
        match timeout {
            Some(timeout) => {
                self.timeouts.insert(name, timeout);
            }
            None => {
                self.timeouts.remove(&name);
            }
        }
    }

    pub(crate) fn timeout_for(&self, name: &S) -> Option<Duration> {
        self.timeouts.get(name).copied()
    }

    pub(crate) fn contains(&self, name: &S) -> bool {
        self.handlers.contains_key(name)
    }
}

/// Entry point of the `transform(handler).using(wrap)` sugar: wraps a state
/// handler so that every descriptor it produces is post-processed.
pub fn transform<S, D, M, R, F>(handler: F) -> Transformer<S, D, M, R>
where
    S: StateKey,
    D: StateData,
    M: FsmMessage,
    R: FsmMessage,
    F: FnMut(
            Event<M, D>,
            &mut MachineContext<'_, S, D, M, R>,
        ) -> Option<State<S, D, R>>
        + Send
        + 'static,
{
    Transformer {
        inner: Box::new(handler),
    }
}

/// Intermediate value returned by [`transform`].
pub struct Transformer<S: StateKey, D: StateData, M: FsmMessage, R: FsmMessage> {
    inner: StateFunction<S, D, M, R>,
}

impl<S: StateKey, D: StateData, M: FsmMessage, R: FsmMessage> Transformer<S, D, M, R> {
    /// Completes the combinator: descriptors returned by the wrapped
    /// handler are passed through `wrap` before the kernel applies them.
    /// "Not handled" results pass through untouched.
    pub fn using<W>(self, mut wrap: W) -> StateFunction<S, D, M, R>
    where
        W: FnMut(State<S, D, R>) -> State<S, D, R> + Send + 'static,
        S: 'static,
        D: 'static,
        M: 'static,
        R: 'static,
    {
        let mut inner = self.inner;
        Box::new(move |event, ctx| inner(event, ctx).map(&mut wrap))
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    impl StateKey for &'static str {}
    impl FsmMessage for &'static str {}

    type Registry = StateRegistry<&'static str, u32, &'static str, &'static str>;

    fn noop() -> StateFunction<&'static str, u32, &'static str, &'static str> {
        Box::new(|_, _| None)
    }

    #[test]
    fn test_register_chains_handlers() {
        let mut registry = Registry::new();
        registry.register("idle", noop(), None);
        registry.register("idle", noop(), None);
        assert_eq!(registry.handlers.get("idle").unwrap().len(), 2);
        assert!(registry.contains(&"idle"));
        assert!(!registry.contains(&"active"));
    }

    #[test]
    fn test_first_default_timeout_wins() {
        let mut registry = Registry::new();
        registry.register("idle", noop(), None);
        registry.register("idle", noop(), Some(Duration::from_millis(50)));
        registry.register("idle", noop(), Some(Duration::from_millis(500)));
        assert_eq!(
            registry.timeout_for(&"idle"),
            Some(Duration::from_millis(50))
        );
    }

    #[test]
    fn test_set_timeout_overwrites_and_clears() {
        let mut registry = Registry::new();
        registry.register("idle", noop(), Some(Duration::from_millis(50)));
        registry.set_timeout("idle", Some(Duration::from_millis(10)));
        assert_eq!(
            registry.timeout_for(&"idle"),
            Some(Duration::from_millis(10))
        );
        registry.set_timeout("idle", None);
        assert_eq!(registry.timeout_for(&"idle"), None);
    }
}
