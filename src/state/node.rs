//! State nodes: identity, topology, contents, and event emission.

use crate::attr::StateAttrs;
use crate::event::{self, Event, EventType, Listener, ListenerId, ListenerList};
use crate::expr::{StateExpr, TransitionExpr};
use crate::guard::{Guard, GuardKind, GuardValue};
use crate::machine::{Current, Machine, MachineCore};
use crate::method::MethodSlot;
use crate::state::proto::ProtoCell;
use crate::transition::Transition;
use crate::Value;
use indexmap::IndexMap;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

pub(crate) struct StateCore<O: 'static> {
    pub(crate) name: String,
    pub(crate) attrs: Cell<StateAttrs>,
    pub(crate) superstate: RefCell<Option<WeakState<O>>>,
    /// Set on the root only; every other state reaches the machine through
    /// its superstate chain.
    pub(crate) machine: RefCell<Option<Weak<MachineCore<O>>>>,
    pub(crate) data: RefCell<serde_json::Map<String, Value>>,
    pub(crate) methods: RefCell<IndexMap<String, MethodSlot<O>>>,
    pub(crate) events: RefCell<IndexMap<EventType, ListenerList<O>>>,
    pub(crate) admit: RefCell<Guard<O>>,
    pub(crate) release: RefCell<Guard<O>>,
    pub(crate) substates: RefCell<IndexMap<String, State<O>>>,
    pub(crate) transitions: RefCell<IndexMap<String, Rc<TransitionExpr<O>>>>,
    pub(crate) protostate: RefCell<ProtoCell<O>>,
    pub(crate) destroyed: Cell<bool>,
}

/// A handle to one state in a machine's behavior tree.
///
/// Handles are cheap to clone and compare by node identity.
pub struct State<O: 'static> {
    pub(crate) core: Rc<StateCore<O>>,
}

/// A non-owning counterpart to [`State`].
pub struct WeakState<O: 'static> {
    core: Weak<StateCore<O>>,
}

impl<O> Clone for State<O> {
    fn clone(&self) -> Self {
        State {
            core: Rc::clone(&self.core),
        }
    }
}

impl<O> Clone for WeakState<O> {
    fn clone(&self) -> Self {
        WeakState {
            core: Weak::clone(&self.core),
        }
    }
}

impl<O> PartialEq for State<O> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }
}

impl<O> Eq for State<O> {}

impl<O> WeakState<O> {
    pub fn upgrade(&self) -> Option<State<O>> {
        self.core.upgrade().map(|core| State { core })
    }
}

impl<O> fmt::Debug for State<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "State({})", self.path())
    }
}

impl<O> fmt::Display for State<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

impl<O> State<O> {
    fn new_bare(name: &str, attrs: StateAttrs) -> State<O> {
        State {
            core: Rc::new(StateCore {
                name: name.to_string(),
                attrs: Cell::new(attrs),
                superstate: RefCell::new(None),
                machine: RefCell::new(None),
                data: RefCell::new(serde_json::Map::new()),
                methods: RefCell::new(IndexMap::new()),
                events: RefCell::new(IndexMap::new()),
                admit: RefCell::new(Guard::new()),
                release: RefCell::new(Guard::new()),
                substates: RefCell::new(IndexMap::new()),
                transitions: RefCell::new(IndexMap::new()),
                protostate: RefCell::new(ProtoCell::Unresolved),
                destroyed: Cell::new(false),
            }),
        }
    }

    /// The machine constructs its root through this; contents are applied
    /// afterwards via [`State::init`], once the machine back-reference is
    /// in place.
    pub(crate) fn new_root(machine: &Weak<MachineCore<O>>, attrs: StateAttrs) -> State<O> {
        let state = State::new_bare("", attrs);
        *state.core.machine.borrow_mut() = Some(Weak::clone(machine));
        if let Some(protostate) = state.protostate() {
            state
                .core
                .attrs
                .set(attrs | (protostate.attrs() & StateAttrs::HERITABLE));
        }
        state
    }

    /// Construct an unattached substate of `superstate`. Attribute
    /// inheritance happens here: mutability from the superstate, the
    /// heritable subset from the protostate, both as one-time copies.
    pub(crate) fn new_child(superstate: &State<O>, name: &str, attrs: StateAttrs) -> State<O> {
        let mut attrs = attrs | (superstate.attrs() & StateAttrs::MUTABLE);
        let state = State::new_bare(name, attrs);
        *state.core.superstate.borrow_mut() = Some(superstate.downgrade());
        if let Some(protostate) = state.protostate() {
            attrs |= protostate.attrs() & StateAttrs::HERITABLE;
            state.core.attrs.set(attrs);
        }
        state
    }

    /// Materialize a virtual stand-in under `superstate`. Virtual states
    /// are not entered into the superstate's substate mapping.
    pub(crate) fn new_virtual(superstate: &State<O>, name: &str) -> State<O> {
        let state = State::new_child(superstate, name, StateAttrs::VIRTUAL);
        tracing::trace!(state = %state.path(), "materialized virtual state");
        state
    }

    /// Build out this state's members from an expression and emit
    /// `Construct`.
    pub(crate) fn init(&self, expr: StateExpr<O>) {
        self.apply_expr(expr);
        self.emit_local(&EventType::Construct, Vec::new());
    }

    pub(crate) fn apply_expr(&self, expr: StateExpr<O>) {
        {
            let mut data = self.core.data.borrow_mut();
            for (key, value) in expr.data {
                data.insert(key, value);
            }
        }
        for (name, f) in expr.methods {
            self.add_method_fn(&name, f);
        }
        for (kind, listeners) in expr.events {
            let mut events = self.core.events.borrow_mut();
            let list = events.entry(kind).or_default();
            for listener in listeners {
                list.add(listener);
            }
        }
        *self.core.admit.borrow_mut() = expr.admit;
        *self.core.release.borrow_mut() = expr.release;
        for (name, substate_expr) in expr.states {
            self.add_substate(&name, substate_expr);
        }
        for (name, transition_expr) in expr.transitions {
            self.add_transition_expr(&name, transition_expr);
        }
    }

    pub(crate) fn downgrade(&self) -> WeakState<O> {
        WeakState {
            core: Rc::downgrade(&self.core),
        }
    }

    // --- Identity -------------------------------------------------------

    /// The local name. The root's name is empty.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// The fully qualified dot-joined path from the root.
    pub fn path(&self) -> String {
        self.derivation_names().join(".")
    }

    /// The attribute flags.
    pub fn attrs(&self) -> StateAttrs {
        self.core.attrs.get()
    }

    pub fn is_virtual(&self) -> bool {
        self.attrs().contains(StateAttrs::VIRTUAL)
    }

    pub fn is_mutable(&self) -> bool {
        self.attrs().contains(StateAttrs::MUTABLE)
    }

    pub fn is_initial(&self) -> bool {
        self.attrs().contains(StateAttrs::INITIAL)
    }

    pub fn is_conclusive(&self) -> bool {
        self.attrs().contains(StateAttrs::CONCLUSIVE)
    }

    pub fn is_final(&self) -> bool {
        self.attrs().contains(StateAttrs::FINAL)
    }

    pub fn is_abstract(&self) -> bool {
        self.attrs().contains(StateAttrs::ABSTRACT)
    }

    pub fn is_default(&self) -> bool {
        self.attrs().contains(StateAttrs::DEFAULT)
    }

    pub fn is_sealed(&self) -> bool {
        self.attrs().contains(StateAttrs::SEALED)
    }

    pub fn is_retained(&self) -> bool {
        self.attrs().contains(StateAttrs::RETAINED)
    }

    pub fn has_history(&self) -> bool {
        self.attrs().contains(StateAttrs::HISTORY)
    }

    pub fn is_shallow(&self) -> bool {
        self.attrs().contains(StateAttrs::SHALLOW)
    }

    pub fn is_versioned(&self) -> bool {
        self.attrs().contains(StateAttrs::VERSIONED)
    }

    pub fn is_concurrent(&self) -> bool {
        self.attrs().contains(StateAttrs::CONCURRENT)
    }

    /// Whether this state has been permanently invalidated.
    pub fn is_destroyed(&self) -> bool {
        self.core.destroyed.get()
    }

    // --- Topology -------------------------------------------------------

    /// The immediate superstate; `None` for the root.
    pub fn superstate(&self) -> Option<State<O>> {
        self.core
            .superstate
            .borrow()
            .as_ref()
            .and_then(WeakState::upgrade)
    }

    /// The nearest ancestor with the given name.
    pub fn superstate_named(&self, name: &str) -> Option<State<O>> {
        let mut cursor = self.superstate();
        while let Some(state) = cursor {
            if state.name() == name {
                return Some(state);
            }
            cursor = state.superstate();
        }
        None
    }

    /// Whether this state is a machine's root.
    pub fn is_root(&self) -> bool {
        self.core.machine.borrow().is_some()
    }

    /// The machine this state belongs to.
    pub fn machine(&self) -> Option<Machine<O>> {
        let mut cursor = self.clone();
        loop {
            if let Some(weak) = cursor.core.machine.borrow().as_ref() {
                return weak.upgrade().map(Machine::from_core);
            }
            cursor = cursor.superstate()?;
        }
    }

    /// The root of this state's tree.
    pub fn root(&self) -> Option<State<O>> {
        self.machine().and_then(|m| m.root_state())
    }

    /// The machine's current state or transition.
    pub fn current(&self) -> Option<Current<O>> {
        self.machine().and_then(|m| m.current())
    }

    /// Ordered path of states from (but excluding) the root to `self`.
    pub fn derivation(&self) -> Vec<State<O>> {
        let mut result = Vec::new();
        let mut cursor = self.clone();
        while let Some(superstate) = cursor.superstate() {
            result.push(cursor);
            cursor = superstate;
        }
        result.reverse();
        result
    }

    /// The derivation as state names.
    pub fn derivation_names(&self) -> Vec<String> {
        self.derivation()
            .into_iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    /// The number of superstates above this state.
    pub fn depth(&self) -> usize {
        let mut n = 0;
        let mut cursor = self.clone();
        while let Some(superstate) = cursor.superstate() {
            n += 1;
            cursor = superstate;
        }
        n
    }

    /// The least common ancestor of `self` and `other`: the deeper state
    /// walks up until it is an ancestor of (or equal to) the other.
    pub fn common(&self, other: &State<O>) -> Option<State<O>> {
        let (mut cursor, other) = if self.depth() > other.depth() {
            (other.clone(), self.clone())
        } else {
            (self.clone(), other.clone())
        };
        loop {
            if cursor == other || cursor.is_superstate_of(&other) {
                return Some(cursor);
            }
            cursor = cursor.superstate()?;
        }
    }

    /// Whether `self` is a proper ancestor of `state`.
    pub fn is_superstate_of(&self, state: &State<O>) -> bool {
        match state.superstate() {
            Some(superstate) => *self == superstate || self.is_superstate_of(&superstate),
            None => false,
        }
    }

    /// Whether `self` is a protostate of `state`, at any remove.
    pub fn is_protostate_of(&self, state: &State<O>) -> bool {
        match state.protostate() {
            Some(protostate) => *self == protostate || self.is_protostate_of(&protostate),
            None => false,
        }
    }

    /// Whether the path expression resolves to this state.
    pub fn is(&self, expr: &str) -> bool {
        self.query_one(expr).is_some_and(|state| state == *self)
    }

    /// Whether `self` is `state` or a descendant of it.
    pub fn is_in(&self, state: &State<O>) -> bool {
        self == state || state.is_superstate_of(self)
    }

    /// Whether `self` is `state` or an ancestor of it.
    pub fn has(&self, state: &State<O>) -> bool {
        self == state || self.is_superstate_of(state)
    }

    /// Whether this state is the machine's current state.
    pub fn is_current(&self) -> bool {
        matches!(self.current(), Some(Current::State(s)) if s == *self)
    }

    /// Whether this state or one of its descendants is current (counting an
    /// in-flight transition by its present attachment).
    pub fn is_active(&self) -> bool {
        match self.current() {
            Some(Current::State(s)) => s == *self || self.is_superstate_of(&s),
            Some(Current::Transition(t)) => {
                let position = t.attachment();
                position == *self || self.is_superstate_of(&position)
            }
            None => false,
        }
    }

    // --- Data -----------------------------------------------------------

    /// Data visible from this state: the superstate's, overlaid by the
    /// protostate's, overlaid by this state's own entries.
    pub fn data(&self) -> serde_json::Map<String, Value> {
        self.data_with(true, true)
    }

    /// Data with inheritance along either axis disabled.
    pub fn data_with(&self, via_super: bool, via_proto: bool) -> serde_json::Map<String, Value> {
        let mut out = serde_json::Map::new();
        if via_super {
            if let Some(superstate) = self.superstate() {
                out.extend(superstate.data_with(true, true));
            }
        }
        if via_proto {
            if let Some(protostate) = self.protostate() {
                out.extend(protostate.data_with(false, true));
            }
        }
        for (key, value) in self.core.data.borrow().iter() {
            out.insert(key.clone(), value.clone());
        }
        out
    }

    /// Edit this state's own data, emitting `Mutate` with the prior values
    /// of every changed key. A virtual state realizes first.
    pub fn edit_data(&self, edit: serde_json::Map<String, Value>) {
        if self.is_virtual() {
            if let Some(real) = self.realize() {
                real.edit_data(edit);
            }
            return;
        }
        let mut delta = serde_json::Map::new();
        {
            let mut data = self.core.data.borrow_mut();
            for (key, value) in &edit {
                let prior = data.insert(key.clone(), value.clone());
                if prior.as_ref() != Some(value) {
                    delta.insert(key.clone(), prior.unwrap_or(Value::Null));
                }
            }
        }
        if !delta.is_empty() {
            self.emit_local(
                &EventType::Mutate,
                vec![Value::Object(edit), Value::Object(delta)],
            );
        }
    }

    // --- Events ---------------------------------------------------------

    /// Bind an event listener, returning its removal key.
    pub fn add_listener(&self, kind: EventType, listener: Listener<O>) -> ListenerId {
        self.core
            .events
            .borrow_mut()
            .entry(kind)
            .or_default()
            .add(listener)
    }

    /// Bind a plain callback listener.
    pub fn on<F>(&self, kind: EventType, f: F) -> ListenerId
    where
        F: Fn(&Event<O>) + 'static,
    {
        self.add_listener(kind, Listener::Call(Rc::new(f)))
    }

    /// Unbind a listener.
    pub fn remove_listener(&self, kind: &EventType, id: ListenerId) -> Option<Listener<O>> {
        self.core.events.borrow_mut().get_mut(kind)?.remove(id)
    }

    /// The number of listeners bound to `kind` on this state.
    pub fn listener_count(&self, kind: &EventType) -> usize {
        self.core
            .events
            .borrow()
            .get(kind)
            .map_or(0, ListenerList::len)
    }

    /// Emit an event with the default propagation: local listeners first,
    /// then the protostate chain, then the superstate chain.
    pub fn emit(&self, kind: EventType, args: Vec<Value>) {
        self.emit_inner(&kind, None, false, &args, None, true, true);
    }

    pub(crate) fn emit_simple(&self, kind: &EventType, args: Vec<Value>) {
        self.emit_inner(kind, None, false, &args, None, true, true);
    }

    /// Construct, mutate, and destroy notifications propagate along the
    /// protostate axis only.
    pub(crate) fn emit_local(&self, kind: &EventType, args: Vec<Value>) {
        self.emit_inner(kind, None, false, &args, None, false, true);
    }

    /// Transition-traversal emissions propagate along the protostate axis
    /// only.
    pub(crate) fn emit_traversal(&self, kind: &EventType, transition: &Transition<O>) {
        self.emit_inner(kind, Some(transition), transition.forced(), &[], None, false, true);
    }

    pub(crate) fn emit_inner(
        &self,
        kind: &EventType,
        transition: Option<&Transition<O>>,
        forced: bool,
        args: &[Value],
        context: Option<&State<O>>,
        via_super: bool,
        via_proto: bool,
    ) {
        let snapshot = self
            .core
            .events
            .borrow()
            .get(kind)
            .map(ListenerList::snapshot);

        if let Some(listeners) = snapshot {
            let context_state = context.unwrap_or(self).clone();
            let event = Event {
                kind: kind.clone(),
                state: Some(context_state.clone()),
                transition: transition.cloned(),
                forced,
                args: args.to_vec(),
            };
            if let Some(target) = event::dispatch(&listeners, &event) {
                if let Some(machine) = context_state.machine() {
                    let _ = machine.change(target.as_str(), Default::default());
                }
            }
        }

        if via_proto {
            if let Some(protostate) = self.protostate() {
                let context_state = context.unwrap_or(self);
                protostate.emit_inner(
                    kind,
                    transition,
                    forced,
                    args,
                    Some(context_state),
                    false,
                    true,
                );
            }
        }

        if via_super {
            if let Some(superstate) = self.superstate() {
                let context_state = context.cloned().unwrap_or_else(|| superstate.clone());
                superstate.emit_inner(
                    kind,
                    transition,
                    forced,
                    args,
                    Some(&context_state),
                    true,
                    true,
                );
            }
        }
    }

    // --- Guards ---------------------------------------------------------

    /// The guard of the given kind, inherited from the protostate when this
    /// state declares none. Guards never come from superstates.
    pub fn guard(&self, kind: GuardKind) -> Option<Guard<O>> {
        let own = match kind {
            GuardKind::Admit => self.core.admit.borrow(),
            GuardKind::Release => self.core.release.borrow(),
        };
        if !own.is_empty() {
            return Some(own.clone());
        }
        drop(own);
        self.protostate().and_then(|p| p.guard(kind))
    }

    /// Bind a guard verdict on this state.
    pub fn add_guard(&self, kind: GuardKind, selector: &str, value: GuardValue<O>) {
        match kind {
            GuardKind::Admit => self.core.admit.borrow_mut().insert(selector, value),
            GuardKind::Release => self.core.release.borrow_mut().insert(selector, value),
        }
    }

    /// Remove a guard entry, returning its value.
    pub fn remove_guard(&self, kind: GuardKind, selector: &str) -> Option<GuardValue<O>> {
        match kind {
            GuardKind::Admit => self.core.admit.borrow_mut().remove(selector),
            GuardKind::Release => self.core.release.borrow_mut().remove(selector),
        }
    }

    // --- Substates ------------------------------------------------------

    /// Retrieve the named substate. Virtual substates on the current-state
    /// chain are found first; failing a local match, an identically named
    /// substate of the protostate is returned when `via_proto` is set.
    pub fn substate(&self, name: &str, via_proto: bool) -> Option<State<O>> {
        // Scan any virtual chain hanging below this state while current.
        if let Some(Current::State(mut cursor)) = self.current() {
            while cursor.is_virtual() {
                let Some(superstate) = cursor.superstate() else {
                    break;
                };
                if superstate == *self && cursor.name() == name {
                    return Some(cursor);
                }
                cursor = superstate;
            }
        }

        if let Some(substate) = self.core.substates.borrow().get(name) {
            return Some(substate.clone());
        }

        if via_proto {
            if let Some(protostate) = self.protostate() {
                return protostate.substate(name, true);
            }
        }

        None
    }

    /// This state's substates; `deep` flattens all descendants depth-first,
    /// `include_virtual` also surfaces any currently active virtual chain.
    pub fn substates(&self, deep: bool, include_virtual: bool) -> Vec<State<O>> {
        let mut result = Vec::new();

        if include_virtual {
            if let Some(Current::State(current)) = self.current() {
                if current.is_virtual() && self.is_superstate_of(&current) {
                    let mut cursor = current;
                    while cursor.is_virtual() {
                        let Some(superstate) = cursor.superstate() else {
                            break;
                        };
                        if deep || superstate == *self {
                            result.insert(0, cursor.clone());
                        }
                        cursor = superstate;
                    }
                }
            }
        }

        for substate in self.core.substates.borrow().values() {
            result.push(substate.clone());
            if deep {
                result.extend(substate.substates(true, false));
            }
        }

        result
    }

    // --- Transition templates -------------------------------------------

    /// The named transition template declared on this state.
    pub fn transition_expr(&self, name: &str) -> Option<Rc<TransitionExpr<O>>> {
        self.core.transitions.borrow().get(name).cloned()
    }

    /// All transition templates declared on this state, in definition
    /// order.
    pub fn transition_exprs(&self) -> Vec<(String, Rc<TransitionExpr<O>>)> {
        self.core
            .transitions
            .borrow()
            .iter()
            .map(|(name, expr)| (name.clone(), Rc::clone(expr)))
            .collect()
    }

    /// Register a transition template on this state.
    pub fn add_transition_expr(&self, name: &str, expr: TransitionExpr<O>) {
        self.core
            .transitions
            .borrow_mut()
            .insert(name.to_string(), Rc::new(expr));
    }

    // --- Changes --------------------------------------------------------

    /// Ask the machine to make this state current.
    pub fn activate(&self) -> Option<State<O>> {
        let machine = self.machine()?;
        machine.change(self.clone(), Default::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineOptions;

    fn sample() -> Machine<()> {
        Machine::new(
            StateExpr::new().state(
                "A",
                StateExpr::new()
                    .state("B", StateExpr::new().state("C", StateExpr::new()))
                    .state("D", StateExpr::new()),
            ),
            MachineOptions::default(),
        )
    }

    #[test]
    fn root_has_empty_name_and_no_superstate() {
        let machine = sample();
        let root = machine.root_state().unwrap();
        assert_eq!(root.name(), "");
        assert_eq!(root.path(), "");
        assert!(root.superstate().is_none());
        assert!(root.is_root());
        assert_eq!(root.depth(), 0);
    }

    #[test]
    fn paths_join_the_derivation() {
        let machine = sample();
        let c = machine.root_state().unwrap().query_one("A.B.C").unwrap();
        assert_eq!(c.path(), "A.B.C");
        assert_eq!(c.derivation_names(), vec!["A", "B", "C"]);
        assert_eq!(c.depth(), 3);
    }

    #[test]
    fn common_of_siblings_is_their_parent() {
        let machine = sample();
        let root = machine.root_state().unwrap();
        let b = root.query_one("A.B").unwrap();
        let d = root.query_one("A.D").unwrap();
        let a = root.query_one("A").unwrap();
        assert_eq!(b.common(&d), Some(a.clone()));
        assert_eq!(b.common(&b), Some(b.clone()));
        assert_eq!(a.common(&root), Some(root));
    }

    #[test]
    fn mutability_is_inherited_from_the_superstate() {
        let machine: Machine<()> = Machine::new(
            StateExpr::new().state(
                "M",
                StateExpr::new()
                    .attrs(StateAttrs::MUTABLE)
                    .state("Child", StateExpr::new()),
            ),
            MachineOptions::default(),
        );
        let child = machine.root_state().unwrap().query_one("M.Child").unwrap();
        assert!(child.is_mutable());
    }

    #[test]
    fn listener_registration_and_removal() {
        let machine = sample();
        let root = machine.root_state().unwrap();
        let id = root.on(EventType::Custom("ping".to_string()), |_| {});
        assert_eq!(root.listener_count(&EventType::Custom("ping".to_string())), 1);
        assert!(root
            .remove_listener(&EventType::Custom("ping".to_string()), id)
            .is_some());
        assert_eq!(root.listener_count(&EventType::Custom("ping".to_string())), 0);
    }
}
