//! The per-owner state machine controller.
//!
//! A [`Machine`] owns one root state, tracks the current state (or the
//! in-flight transition), and orchestrates changes: target resolution,
//! abstract redirection, guard evaluation, virtualization of
//! protostate-resident targets, domain computation, and the
//! depart/exit/enter/arrive event protocol.
//!
//! The owner is not held by the machine; it holds the machine as an opaque
//! handle and routes stateful calls through [`Machine::call`] or
//! [`Machine::invoke`]. An owner's pre-existing implementations are
//! registered as defaults at construction and relocated to the root when a
//! state first overrides them.

use crate::error::DispatchError;
use crate::event::EventType;
use crate::expr::{StateExpr, TransitionExpr};
use crate::guard::GuardKind;
use crate::method::{MethodContext, MethodFn, MethodSlot};
use crate::query::QueryMatch;
use crate::state::State;
use crate::transition::{Transition, TransitionSource};
use crate::Value;
use indexmap::IndexMap;
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::rc::{Rc, Weak};

/// What a machine is presently in: a settled state, or an in-flight
/// transition.
pub enum Current<O: 'static> {
    State(State<O>),
    Transition(Transition<O>),
}

impl<O> Clone for Current<O> {
    fn clone(&self) -> Self {
        match self {
            Current::State(s) => Current::State(s.clone()),
            Current::Transition(t) => Current::Transition(t.clone()),
        }
    }
}

impl<O> fmt::Debug for Current<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Current::State(s) => f.debug_tuple("State").field(s).finish(),
            Current::Transition(t) => f.debug_tuple("Transition").field(t).finish(),
        }
    }
}

/// Construction options for a [`Machine`].
pub struct MachineOptions<O: 'static> {
    /// The accessor name the machine answers to. Purely descriptive here;
    /// the conventional name is `"state"`.
    pub name: String,
    /// Selector for the state to start in, overriding any `initial`-marked
    /// state.
    pub initial: Option<String>,
    /// The parent behavior template. Protostate resolution walks this
    /// chain.
    pub proto: Option<Machine<O>>,
    /// The owner's pre-existing method implementations, kept as default
    /// behavior for names its states override.
    pub defaults: IndexMap<String, MethodFn<O>>,
}

impl<O> Default for MachineOptions<O> {
    fn default() -> Self {
        MachineOptions {
            name: "state".to_string(),
            initial: None,
            proto: None,
            defaults: IndexMap::new(),
        }
    }
}

impl<O> MachineOptions<O> {
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn initial(mut self, selector: &str) -> Self {
        self.initial = Some(selector.to_string());
        self
    }

    pub fn proto(mut self, proto: Machine<O>) -> Self {
        self.proto = Some(proto);
        self
    }

    /// Register an owner-default implementation.
    pub fn default_method<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&mut O, &MethodContext<O>, &[Value]) -> Value + 'static,
    {
        self.defaults.insert(name.to_string(), Rc::new(f));
        self
    }
}

/// Options for a single change request.
pub struct ChangeOptions<O: 'static> {
    /// Bypass guard evaluation. Conclusivity still blocks.
    pub forced: bool,
    /// Arguments forwarded to the transition's action.
    pub args: Vec<Value>,
    /// Invoked after the transition completes.
    pub success: Option<Rc<dyn Fn(&Machine<O>)>>,
    /// Invoked when a guard refuses the change.
    pub failure: Option<Rc<dyn Fn(&Machine<O>)>>,
}

impl<O> Default for ChangeOptions<O> {
    fn default() -> Self {
        ChangeOptions {
            forced: false,
            args: Vec::new(),
            success: None,
            failure: None,
        }
    }
}

impl<O> ChangeOptions<O> {
    pub fn forced(mut self) -> Self {
        self.forced = true;
        self
    }

    pub fn arg(mut self, value: Value) -> Self {
        self.args.push(value);
        self
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&Machine<O>) + 'static,
    {
        self.success = Some(Rc::new(f));
        self
    }

    pub fn on_failure<F>(mut self, f: F) -> Self
    where
        F: Fn(&Machine<O>) + 'static,
    {
        self.failure = Some(Rc::new(f));
        self
    }
}

/// A change request's target.
pub enum ChangeTarget<O: 'static> {
    /// A path expression, resolved relative to the origin state.
    Path(String),
    /// An explicit state, which must belong to this machine or to one of
    /// its templates.
    State(State<O>),
}

impl<O> From<&str> for ChangeTarget<O> {
    fn from(path: &str) -> Self {
        ChangeTarget::Path(path.to_string())
    }
}

impl<O> From<String> for ChangeTarget<O> {
    fn from(path: String) -> Self {
        ChangeTarget::Path(path)
    }
}

impl<O> From<State<O>> for ChangeTarget<O> {
    fn from(state: State<O>) -> Self {
        ChangeTarget::State(state)
    }
}

impl<O> From<&State<O>> for ChangeTarget<O> {
    fn from(state: &State<O>) -> Self {
        ChangeTarget::State(state.clone())
    }
}

pub(crate) struct MachineCore<O: 'static> {
    name: String,
    root: RefCell<Option<State<O>>>,
    current: RefCell<Option<Current<O>>>,
    transition: RefCell<Option<Transition<O>>>,
    proto: Option<Machine<O>>,
    defaults: RefCell<IndexMap<String, MethodFn<O>>>,
    originals: RefCell<HashSet<String>>,
    destroyed: Cell<bool>,
    tearing_down: Cell<bool>,
}

/// The per-owner controller. Handles are cheap to clone and compare by
/// identity.
pub struct Machine<O: 'static> {
    core: Rc<MachineCore<O>>,
}

impl<O> Clone for Machine<O> {
    fn clone(&self) -> Self {
        Machine {
            core: Rc::clone(&self.core),
        }
    }
}

impl<O> PartialEq for Machine<O> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }
}

impl<O> Eq for Machine<O> {}

impl<O> fmt::Debug for Machine<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("name", &self.core.name)
            .field("current", &self.core.current.borrow())
            .finish()
    }
}

impl<O> Machine<O> {
    /// Construct a machine from a root expression.
    ///
    /// The initial current state is the most deeply nested `initial`-marked
    /// state (or the root), possibly overridden by the `initial` selector
    /// option; an abstract pick is redirected to its default substate, and
    /// a pick resident on a template is virtualized into the local tree.
    pub fn new(expr: StateExpr<O>, options: MachineOptions<O>) -> Machine<O> {
        let core = Rc::new(MachineCore {
            name: options.name,
            root: RefCell::new(None),
            current: RefCell::new(None),
            transition: RefCell::new(None),
            proto: options.proto,
            defaults: RefCell::new(options.defaults),
            originals: RefCell::new(HashSet::new()),
            destroyed: Cell::new(false),
            tearing_down: Cell::new(false),
        });
        let machine = Machine { core };

        let root = State::new_root(&machine.downgrade(), expr.attrs);
        *machine.core.root.borrow_mut() = Some(root.clone());
        root.init(expr);

        let mut current = root.initial_substate(true).unwrap_or_else(|| root.clone());
        if let Some(selector) = &options.initial {
            if let Some(picked) = root.query_one(selector) {
                current = picked;
            }
        }
        while current.is_abstract() {
            match current.default_substate(true) {
                Some(default) => current = default,
                None => break,
            }
        }
        if current.machine().as_ref() != Some(&machine) {
            current = machine.virtualize(&current).unwrap_or(root);
        }
        *machine.core.current.borrow_mut() = Some(Current::State(current));

        machine
    }

    pub(crate) fn from_core(core: Rc<MachineCore<O>>) -> Machine<O> {
        Machine { core }
    }

    pub(crate) fn downgrade(&self) -> Weak<MachineCore<O>> {
        Rc::downgrade(&self.core)
    }

    /// The accessor name this machine was constructed with.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// The parent behavior template, if any.
    pub fn proto(&self) -> Option<Machine<O>> {
        self.core.proto.clone()
    }

    /// The root state. `None` once the machine is destroyed.
    pub fn root_state(&self) -> Option<State<O>> {
        self.core.root.borrow().clone()
    }

    /// The current state or in-flight transition.
    pub fn current(&self) -> Option<Current<O>> {
        self.core.current.borrow().clone()
    }

    /// The current state, when the machine is not mid-transition.
    pub fn current_state(&self) -> Option<State<O>> {
        match self.current()? {
            Current::State(s) => Some(s),
            Current::Transition(_) => None,
        }
    }

    /// The active transition, if one is underway.
    pub fn transition(&self) -> Option<Transition<O>> {
        self.core.transition.borrow().clone()
    }

    pub(crate) fn active_transition(&self) -> Option<Transition<O>> {
        self.transition()
    }

    pub fn is_destroyed(&self) -> bool {
        self.core.destroyed.get()
    }

    pub(crate) fn is_tearing_down(&self) -> bool {
        self.core.tearing_down.get()
    }

    /// The tree position dispatch and queries operate from: the current
    /// state, or an in-flight transition's attachment.
    pub(crate) fn position(&self) -> Option<State<O>> {
        match self.current()? {
            Current::State(s) => Some(s),
            Current::Transition(t) => Some(t.attachment()),
        }
    }

    /// Query a path expression from the current position.
    pub fn query(&self, expr: &str) -> Option<QueryMatch<O>> {
        self.position()?.query(expr)
    }

    pub(crate) fn set_current(&self, current: Current<O>) {
        *self.core.current.borrow_mut() = Some(current);
    }

    // --- Owner defaults -------------------------------------------------

    pub(crate) fn take_default(&self, name: &str) -> Option<MethodFn<O>> {
        self.core.defaults.borrow().get(name).cloned()
    }

    pub(crate) fn mark_original(&self, name: &str) {
        self.core.originals.borrow_mut().insert(name.to_string());
    }

    pub(crate) fn is_original(&self, name: &str) -> bool {
        self.core.originals.borrow().contains(name)
    }

    // --- Dispatch -------------------------------------------------------

    /// Lenient dispatch: resolve `name` against the current state and
    /// invoke it.
    ///
    /// When nothing resolves, a `NoSuchMethod` event and its per-method
    /// channel are emitted on the current position and `None` is returned.
    /// The strict counterpart is [`Machine::invoke`].
    pub fn call(&self, owner: &mut O, name: &str, args: &[Value]) -> Option<Value> {
        if self.is_destroyed() {
            return None;
        }
        let resolved = match self.current()? {
            Current::State(state) => state.resolve_method(name, true, true),
            Current::Transition(transition) => transition.resolve_method(name),
        };
        match resolved {
            Some(resolved) => match resolved.slot {
                MethodSlot::Noop => Some(Value::Null),
                MethodSlot::Fn(f) => {
                    let ctx = MethodContext {
                        state: resolved.context,
                        original: resolved.original,
                    };
                    Some(f(owner, &ctx, args))
                }
            },
            None => {
                tracing::debug!(method = name, "dispatch found no implementation");
                if let Some(position) = self.position() {
                    position.emit_simple(
                        &EventType::NoSuchMethod,
                        vec![
                            Value::String(name.to_string()),
                            Value::Array(args.to_vec()),
                        ],
                    );
                    position.emit_simple(
                        &EventType::no_such_method(name),
                        vec![Value::Array(args.to_vec())],
                    );
                }
                None
            }
        }
    }

    /// Strict dispatch: like [`Machine::call`], but a missing
    /// implementation is a hard, typed failure and emits nothing.
    pub fn invoke(&self, owner: &mut O, name: &str, args: &[Value]) -> Result<Value, DispatchError> {
        if self.is_destroyed() {
            return Err(DispatchError::MachineDestroyed);
        }
        let position = self.position().ok_or(DispatchError::MachineDestroyed)?;
        let resolved = match self.current().ok_or(DispatchError::MachineDestroyed)? {
            Current::State(state) => state.resolve_method(name, true, true),
            Current::Transition(transition) => transition.resolve_method(name),
        };
        let resolved = resolved.ok_or_else(|| DispatchError::NoSuchMethod {
            state: position.path(),
            method: name.to_string(),
        })?;
        match resolved.slot {
            MethodSlot::Noop => Ok(Value::Null),
            MethodSlot::Fn(f) => {
                let ctx = MethodContext {
                    state: resolved.context,
                    original: resolved.original,
                };
                Ok(f(owner, &ctx, args))
            }
        }
    }

    // --- Changes --------------------------------------------------------

    /// Request a change of state.
    ///
    /// Returns the resolved (post-redirection) target when the change is
    /// admitted — it is already current if the transition concluded
    /// synchronously, or pending if an action suspended it. Returns `None`,
    /// with nothing mutated, when the origin is final, the target cannot be
    /// resolved to a state of this machine or its templates, a guard
    /// refuses (also invoking the `failure` callback), or a conclusive
    /// boundary would be crossed.
    pub fn change(
        &self,
        target: impl Into<ChangeTarget<O>>,
        options: ChangeOptions<O>,
    ) -> Option<State<O>> {
        self.change_inner(target.into(), options)
    }

    pub(crate) fn change_forced(&self, target: State<O>) -> Option<State<O>> {
        self.change_inner(
            ChangeTarget::State(target),
            ChangeOptions {
                forced: true,
                ..Default::default()
            },
        )
    }

    fn change_inner(&self, target: ChangeTarget<O>, options: ChangeOptions<O>) -> Option<State<O>> {
        if self.is_destroyed() {
            return None;
        }

        let prior = self.transition();
        let origin = match &prior {
            Some(transition) => transition.origin(),
            None => self.current_state()?,
        };

        // Departures from a final state always fail.
        if origin.is_final() {
            tracing::debug!(from = %origin.path(), "change refused: origin is final");
            return None;
        }

        // Resolve the target to a state belonging to this machine or one
        // of its templates.
        let mut target = match target {
            ChangeTarget::Path(path) => origin.query_one(&path)?,
            ChangeTarget::State(state) => state,
        };
        let target_machine = target.machine()?;
        if target_machine != *self && !self.proto_chain_contains(&target_machine) {
            tracing::debug!(to = %target.path(), "change refused: foreign target");
            return None;
        }

        // An abstract target redirects to its default substate.
        while target.is_abstract() {
            target = match target.default_substate(true) {
                Some(default) => default,
                None => {
                    tracing::debug!("change refused: abstract target has no default substate");
                    return None;
                }
            };
        }

        // Guards must consent unless the change is forced.
        if !options.forced {
            let released = origin
                .guard(GuardKind::Release)
                .map_or(true, |guard| guard.evaluate(&origin, &target));
            let admitted = target
                .guard(GuardKind::Admit)
                .map_or(true, |guard| guard.evaluate(&target, &origin));
            if !released || !admitted {
                tracing::debug!(
                    from = %origin.path(),
                    to = %target.path(),
                    "change refused by guard"
                );
                if let Some(failure) = &options.failure {
                    failure(self);
                }
                return None;
            }
        }

        // A template-resident target is represented locally by a chain of
        // virtual states.
        if target.machine().as_ref() != Some(self) {
            target = self.virtualize(&target)?;
        }

        let source = match self.current()? {
            Current::State(state) => TransitionSource::State(state),
            Current::Transition(transition) => TransitionSource::Transition(transition),
        };
        let position = source.position();
        let domain = position.common(&target)?;

        // A conclusive state, once entered, permits no further exit.
        {
            let mut cursor = position.clone();
            while cursor != domain {
                if cursor.is_conclusive() {
                    tracing::debug!(state = %cursor.path(), "change refused: conclusive boundary");
                    return None;
                }
                cursor = cursor.superstate()?;
            }
        }

        // A still-active prior transition is superseded, not finished.
        if let Some(prior) = &prior {
            prior.abort();
        }

        let template = self.transition_expression_for(&target, &origin);
        let transition = Transition::new(
            self,
            target.clone(),
            source.clone(),
            template,
            options.success.clone(),
            options.forced,
        );
        *self.core.transition.borrow_mut() = Some(transition.clone());

        tracing::debug!(
            from = %origin.path(),
            to = %target.path(),
            domain = %domain.path(),
            "transition departing"
        );

        match &source {
            TransitionSource::State(state) => state.emit_traversal(&EventType::Depart, &transition),
            TransitionSource::Transition(prior) => prior.emit_own(&EventType::Depart, Vec::new()),
        }

        self.set_current(Current::Transition(transition.clone()));
        transition.emit_own(&EventType::Enter, Vec::new());

        // Exit each state from the source position up to, but excluding,
        // the domain, advancing the attachment pointer as we go.
        let mut cursor = position;
        while cursor != domain {
            cursor.emit_traversal(&EventType::Exit, &transition);
            match cursor.superstate() {
                Some(superstate) => {
                    transition.attach_to(superstate.clone());
                    cursor = superstate;
                }
                None => break,
            }
        }

        transition.start(&options.args);
        Some(target)
    }

    /// Conclude an ended transition: trace the enter path from the domain
    /// down to the target, settle the current state, and retire the
    /// transition together with its aborted predecessors.
    pub(crate) fn finish_transition(&self, transition: &Transition<O>) {
        let target = transition.target();
        let domain = transition.attachment();
        let origin = transition.origin();

        let mut path = Vec::new();
        let mut cursor = target.clone();
        while cursor != domain {
            path.push(cursor.clone());
            match cursor.superstate() {
                Some(superstate) => cursor = superstate,
                None => break,
            }
        }
        for state in path.into_iter().rev() {
            transition.attach_to(state.clone());
            state.emit_traversal(&EventType::Enter, transition);
        }

        transition.emit_own(&EventType::Exit, Vec::new());
        self.set_current(Current::State(target.clone()));
        target.emit_traversal(&EventType::Arrive, transition);

        // Virtual states that represented the old origin are stale unless
        // the new target still sits beneath them.
        let mut cursor = origin;
        while cursor.is_virtual() {
            let superstate = cursor.superstate();
            if !target.is_in(&cursor) {
                cursor.destroy_virtual();
            }
            match superstate {
                Some(superstate) => cursor = superstate,
                None => break,
            }
        }

        *self.core.transition.borrow_mut() = None;
        let success = transition.take_success();
        transition.retire();
        tracing::debug!(to = %target.path(), "transition complete");
        if let Some(success) = success {
            success(self);
        }
    }

    // --- Virtualization -------------------------------------------------

    pub(crate) fn proto_chain_contains(&self, machine: &Machine<O>) -> bool {
        let mut cursor = self.proto();
        while let Some(candidate) = cursor {
            if candidate == *machine {
                return true;
            }
            cursor = candidate.proto();
        }
        false
    }

    /// Materialize a local virtual chain representing a template-resident
    /// state, reusing whatever real or still-current virtual prefix of the
    /// path already exists.
    pub(crate) fn virtualize(&self, protostate: &State<O>) -> Option<State<O>> {
        let names = protostate.derivation_names();
        let root = self.root_state()?;
        if names.is_empty() {
            return Some(root);
        }
        let mut state = root;
        let mut index = 0;
        while index < names.len() {
            match state.substate(&names[index], false) {
                Some(next) => {
                    state = next;
                    index += 1;
                }
                None => break,
            }
        }
        for name in &names[index..] {
            state = State::new_virtual(&state, name);
        }
        Some(state)
    }

    // --- Transition-template lookup -------------------------------------

    /// Find the transition template applying to an origin/target pairing,
    /// searching the target, the origin, ancestors of the target up to and
    /// including the root, and ancestors of the origin up to the common
    /// ancestor, in that order. Absent a match, a plain immediate template
    /// is synthesized.
    pub(crate) fn transition_expression_for(
        &self,
        target: &State<O>,
        origin: &State<O>,
    ) -> Rc<TransitionExpr<O>> {
        let root = self.root_state();

        let found = self
            .search_templates(Some(target.clone()), None, target, origin)
            .or_else(|| {
                if origin != target {
                    self.search_templates(Some(origin.clone()), None, target, origin)
                } else {
                    None
                }
            })
            .or_else(|| {
                let root = root.as_ref()?;
                self.search_templates(target.superstate(), Some(root), target, origin)
            })
            .or_else(|| self.search_templates(root.clone(), None, target, origin))
            .or_else(|| {
                if !target.is_in(origin) {
                    let common = origin.common(target)?;
                    self.search_templates(origin.superstate(), Some(&common), target, origin)
                } else {
                    None
                }
            });

        found.unwrap_or_else(|| Rc::new(TransitionExpr::new()))
    }

    fn search_templates(
        &self,
        from: Option<State<O>>,
        until: Option<&State<O>>,
        target: &State<O>,
        origin: &State<O>,
    ) -> Option<Rc<TransitionExpr<O>>> {
        let mut cursor = from;
        while let Some(state) = cursor {
            if until == Some(&state) {
                return None;
            }
            for (_, template) in state.transition_exprs() {
                if template_matches(&state, &template, target, origin) {
                    return Some(template);
                }
            }
            cursor = if until.is_some() {
                state.superstate()
            } else {
                None
            };
        }
        None
    }

    // --- Teardown -------------------------------------------------------

    /// Tear down the machine: the active transition is aborted, the tree is
    /// destroyed bottom-up, and the owner-default methods registered at
    /// construction are handed back, restoring the owner's pre-attachment
    /// behavior.
    pub fn destroy(&self) -> Option<IndexMap<String, MethodFn<O>>> {
        if self.is_destroyed() {
            return None;
        }
        self.core.tearing_down.set(true);
        if let Some(transition) = self.transition() {
            transition.abort();
            transition.retire();
        }
        if let Some(root) = self.root_state() {
            root.destroy_subtree();
        }
        *self.core.transition.borrow_mut() = None;
        *self.core.current.borrow_mut() = None;
        *self.core.root.borrow_mut() = None;
        self.core.tearing_down.set(false);
        self.core.destroyed.set(true);
        tracing::debug!(name = %self.core.name, "machine destroyed");
        Some(self.core.defaults.borrow().clone())
    }
}

fn template_matches<O>(
    holder: &State<O>,
    template: &TransitionExpr<O>,
    target: &State<O>,
    origin: &State<O>,
) -> bool {
    if !template.admit.is_empty() && !template.admit.evaluate(origin, target) {
        return false;
    }
    if !template.release.is_empty() && !template.release.evaluate(target, origin) {
        return false;
    }
    match &template.target {
        Some(selector) => {
            if !holder.test_selector(selector, target) {
                return false;
            }
        }
        None => {
            if holder != target {
                return false;
            }
        }
    }
    if let Some(selector) = &template.origin {
        if !holder.test_selector(selector, origin) {
            return false;
        }
    }
    true
}
