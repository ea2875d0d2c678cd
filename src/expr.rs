//! Canonical state and transition expressions.
//!
//! An expression is the categorized, long-form description of a state's
//! contents: data, methods, events, guards, substates, and transition
//! templates. Loosely-shaped declarative input is the business of an
//! external normalizer; this crate accepts only the canonical form, built
//! through the fluent constructors below.

use crate::attr::StateAttrs;
use crate::event::{EventType, Listener, ListenerFn};
use crate::guard::{Guard, GuardContext, GuardValue};
use crate::method::{MethodContext, MethodFn};
use crate::query::Selector;
use crate::transition::ActionFn;
use crate::Value;
use indexmap::IndexMap;
use std::fmt;
use std::rc::Rc;

/// Canonical description of one state.
///
/// # Example
///
/// ```rust
/// use protostate::{StateAttrs, StateExpr, Value};
///
/// let expr: StateExpr<()> = StateExpr::new()
///     .state(
///         "Idle",
///         StateExpr::new()
///             .attrs(StateAttrs::INITIAL)
///             .method("describe", |_, _, _| Value::from("idle")),
///     )
///     .state("Busy", StateExpr::new());
/// assert_eq!(expr.states.len(), 2);
/// ```
pub struct StateExpr<O: 'static> {
    pub attrs: StateAttrs,
    pub data: serde_json::Map<String, Value>,
    pub methods: IndexMap<String, MethodFn<O>>,
    pub events: IndexMap<EventType, Vec<Listener<O>>>,
    pub admit: Guard<O>,
    pub release: Guard<O>,
    pub states: IndexMap<String, StateExpr<O>>,
    pub transitions: IndexMap<String, TransitionExpr<O>>,
}

impl<O> Default for StateExpr<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O> Clone for StateExpr<O> {
    fn clone(&self) -> Self {
        StateExpr {
            attrs: self.attrs,
            data: self.data.clone(),
            methods: self.methods.clone(),
            events: self.events.clone(),
            admit: self.admit.clone(),
            release: self.release.clone(),
            states: self.states.clone(),
            transitions: self.transitions.clone(),
        }
    }
}

impl<O> StateExpr<O> {
    pub fn new() -> Self {
        StateExpr {
            attrs: StateAttrs::NORMAL,
            data: serde_json::Map::new(),
            methods: IndexMap::new(),
            events: IndexMap::new(),
            admit: Guard::new(),
            release: Guard::new(),
            states: IndexMap::new(),
            transitions: IndexMap::new(),
        }
    }

    /// Set the attribute flags.
    pub fn attrs(mut self, attrs: StateAttrs) -> Self {
        self.attrs = attrs;
        self
    }

    /// Attach a data entry.
    pub fn data(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }

    /// Attach a method override.
    pub fn method<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&mut O, &MethodContext<O>, &[Value]) -> Value + 'static,
    {
        self.methods.insert(name.to_string(), Rc::new(f));
        self
    }

    /// Bind an event listener.
    pub fn on<F>(mut self, kind: EventType, f: F) -> Self
    where
        F: Fn(&crate::event::Event<O>) + 'static,
    {
        self.listener(kind, Listener::Call(Rc::new(f) as ListenerFn<O>))
    }

    /// Bind an implied-transition listener: once the event's callbacks have
    /// run, the emitting state changes to `target`.
    pub fn on_transit(self, kind: EventType, target: &str) -> Self {
        self.listener(kind, Listener::Transit(target.to_string()))
    }

    fn listener(mut self, kind: EventType, listener: Listener<O>) -> Self {
        self.events.entry(kind).or_default().push(listener);
        self
    }

    /// Bind an admission verdict to a selector.
    pub fn admit(mut self, selector: &str, value: impl Into<GuardValue<O>>) -> Self {
        self.admit.insert(selector, value.into());
        self
    }

    /// Bind an admission predicate to a selector.
    pub fn admit_fn<F>(mut self, selector: &str, f: F) -> Self
    where
        F: Fn(&GuardContext<O>) -> bool + 'static,
    {
        self.admit
            .insert(selector, GuardValue::Predicate(Rc::new(f)));
        self
    }

    /// Bind a release verdict to a selector.
    pub fn release(mut self, selector: &str, value: impl Into<GuardValue<O>>) -> Self {
        self.release.insert(selector, value.into());
        self
    }

    /// Bind a release predicate to a selector.
    pub fn release_fn<F>(mut self, selector: &str, f: F) -> Self
    where
        F: Fn(&GuardContext<O>) -> bool + 'static,
    {
        self.release
            .insert(selector, GuardValue::Predicate(Rc::new(f)));
        self
    }

    /// Declare a substate.
    pub fn state(mut self, name: &str, expr: StateExpr<O>) -> Self {
        self.states.insert(name.to_string(), expr);
        self
    }

    /// Declare a transition template.
    pub fn transition(mut self, name: &str, expr: TransitionExpr<O>) -> Self {
        self.transitions.insert(name.to_string(), expr);
        self
    }
}

impl<O> fmt::Debug for StateExpr<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateExpr")
            .field("attrs", &self.attrs)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("states", &self.states.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Canonical description of a transition template.
///
/// The `origin` and `target` selectors scope which origin/target pairings
/// the template applies to; `action` is the suspend point, responsible for
/// concluding the transition it receives. `source` and `conjugate` are
/// accepted for completeness but carry no behavior.
pub struct TransitionExpr<O: 'static> {
    pub origin: Option<Selector>,
    pub source: Option<Selector>,
    pub target: Option<Selector>,
    pub conjugate: Option<String>,
    pub action: Option<ActionFn<O>>,
    pub methods: IndexMap<String, MethodFn<O>>,
    pub events: IndexMap<EventType, Vec<Listener<O>>>,
    pub admit: Guard<O>,
    pub release: Guard<O>,
}

impl<O> Default for TransitionExpr<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O> Clone for TransitionExpr<O> {
    fn clone(&self) -> Self {
        TransitionExpr {
            origin: self.origin.clone(),
            source: self.source.clone(),
            target: self.target.clone(),
            conjugate: self.conjugate.clone(),
            action: self.action.clone(),
            methods: self.methods.clone(),
            events: self.events.clone(),
            admit: self.admit.clone(),
            release: self.release.clone(),
        }
    }
}

impl<O> TransitionExpr<O> {
    /// A plain, immediate, guardless transition.
    pub fn new() -> Self {
        TransitionExpr {
            origin: None,
            source: None,
            target: None,
            conjugate: None,
            action: None,
            methods: IndexMap::new(),
            events: IndexMap::new(),
            admit: Guard::new(),
            release: Guard::new(),
        }
    }

    /// Scope the template to origins matching `selector`.
    pub fn origin(mut self, selector: &str) -> Self {
        self.origin = Some(Selector::parse(selector));
        self
    }

    /// Scope the template to targets matching `selector`.
    pub fn target(mut self, selector: &str) -> Self {
        self.target = Some(Selector::parse(selector));
        self
    }

    /// Supply the action. The transition suspends after `Start` until the
    /// action concludes it by calling `end` or `abort` on the handle it
    /// receives.
    pub fn action<F>(mut self, f: F) -> Self
    where
        F: Fn(&crate::transition::Transition<O>, &[Value]) + 'static,
    {
        self.action = Some(Rc::new(f));
        self
    }

    /// Attach a method override active while the transition is current.
    pub fn method<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&mut O, &MethodContext<O>, &[Value]) -> Value + 'static,
    {
        self.methods.insert(name.to_string(), Rc::new(f));
        self
    }

    /// Bind a listener for the transition's own events.
    pub fn on<F>(mut self, kind: EventType, f: F) -> Self
    where
        F: Fn(&crate::event::Event<O>) + 'static,
    {
        self.events
            .entry(kind)
            .or_default()
            .push(Listener::Call(Rc::new(f) as ListenerFn<O>));
        self
    }

    /// Bind an admission verdict scoping where the template applies.
    pub fn admit(mut self, selector: &str, value: impl Into<GuardValue<O>>) -> Self {
        self.admit.insert(selector, value.into());
        self
    }

    /// Bind a release verdict scoping where the template applies.
    pub fn release(mut self, selector: &str, value: impl Into<GuardValue<O>>) -> Self {
        self.release.insert(selector, value.into());
        self
    }
}

impl<O> fmt::Debug for TransitionExpr<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionExpr")
            .field("origin", &self.origin)
            .field("target", &self.target)
            .field("action", &self.action.is_some())
            .finish()
    }
}
