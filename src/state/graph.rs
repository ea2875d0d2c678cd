//! Structural mutation of the state tree.

use crate::attr::StateAttrs;
use crate::event::EventType;
use crate::expr::StateExpr;
use crate::machine::Current;
use crate::method::MethodSlot;
use crate::state::State;
use std::collections::VecDeque;
use std::rc::Rc;

impl<O> State<O> {
    /// Convert a virtual stand-in into a real state, entering it into its
    /// superstate's substate mapping. A real state realizes to itself.
    ///
    /// Fails when the superstate is sealed, or when realization would have
    /// to revive a destroyed ancestor.
    pub fn realize(&self) -> Option<State<O>> {
        if !self.is_virtual() {
            return Some(self.clone());
        }
        if self.is_destroyed() {
            return None;
        }
        let superstate = self.superstate()?;
        if superstate.is_virtual() {
            superstate.realize()?;
        }
        if superstate.is_sealed() || superstate.is_destroyed() {
            return None;
        }

        let mut attrs = self.attrs();
        attrs.remove(StateAttrs::VIRTUAL);
        self.core.attrs.set(attrs);
        superstate
            .core
            .substates
            .borrow_mut()
            .insert(self.name().to_string(), self.clone());
        tracing::debug!(state = %self.path(), "realized virtual state");
        self.emit_local(&EventType::Construct, Vec::new());
        Some(self.clone())
    }

    /// Create a substate from an expression, replacing (and first
    /// destroying) any existing substate of the same name.
    ///
    /// Returns `None` if this state is sealed or destroyed, or if the
    /// displaced substate refuses destruction because a transition is
    /// traversing it.
    pub fn add_substate(&self, name: &str, expr: StateExpr<O>) -> Option<State<O>> {
        if self.is_virtual() {
            return self.realize()?.add_substate(name, expr);
        }
        if self.is_sealed() || self.is_destroyed() {
            tracing::debug!(state = %self.path(), name, "add_substate refused");
            return None;
        }

        let existing = self.core.substates.borrow().get(name).cloned();
        if let Some(existing) = existing {
            if !existing.destroy() {
                return None;
            }
        }

        let substate = State::new_child(self, name, expr.attrs);
        substate.init(expr);
        self.core
            .substates
            .borrow_mut()
            .insert(name.to_string(), substate.clone());
        Some(substate)
    }

    /// Detach the named substate without destroying it.
    ///
    /// Fails while an active transition traverses the substate. If the
    /// current state lies inside it, the machine is first forced off onto
    /// this state.
    pub fn remove_substate(&self, name: &str) -> Option<State<O>> {
        let substate = self.core.substates.borrow().get(name).cloned()?;
        let machine = self.machine()?;

        if let Some(transition) = machine.active_transition() {
            let position = transition.attachment();
            if transition.origin().is_in(&substate)
                || transition.target().is_in(&substate)
                || position.is_in(&substate)
            {
                return None;
            }
        }

        if let Some(Current::State(current)) = machine.current() {
            if current.is_in(&substate) {
                let _ = machine.change_forced(self.clone());
            }
        }

        self.core.substates.borrow_mut().shift_remove(name);
        Some(substate)
    }

    /// Tear down this state and its descendants, bottom-up.
    ///
    /// Destruction is refused while an active transition involves this
    /// state or any of its descendants. Destroying the root tears down the
    /// whole machine.
    pub fn destroy(&self) -> bool {
        if self.is_destroyed() {
            return false;
        }

        let machine = self.machine();
        if let Some(machine) = &machine {
            if let Some(transition) = machine.active_transition() {
                if transition.origin().is_in(self) || transition.target().is_in(self) {
                    return false;
                }
            }
        }

        if self.superstate().is_none() {
            // Root destruction propagates to the machine, unless the
            // machine itself instigated this call.
            if let Some(machine) = &machine {
                if !machine.is_tearing_down() {
                    return machine.destroy().is_some();
                }
            }
            return self.destroy_subtree();
        }

        // Evacuate the machine if the current state lives in this subtree.
        if let Some(machine) = &machine {
            if let Some(Current::State(current)) = machine.current() {
                if current.is_in(self) {
                    if let Some(superstate) = self.superstate() {
                        let _ = machine.change_forced(superstate);
                    }
                }
            }
        }

        let name = self.name().to_string();
        let superstate = self.superstate();
        let destroyed = self.destroy_subtree();
        if destroyed {
            if let Some(superstate) = superstate {
                superstate.core.substates.borrow_mut().shift_remove(&name);
            }
        }
        destroyed
    }

    /// Unconditional teardown of this node and its descendants. The
    /// `destroyed` flag left behind is the signal protostate memoizations
    /// watch to invalidate themselves.
    pub(crate) fn destroy_subtree(&self) -> bool {
        let children: Vec<State<O>> = self.core.substates.borrow().values().cloned().collect();
        for child in children {
            child.destroy_subtree();
        }
        self.core.substates.borrow_mut().clear();

        self.emit_inner(&EventType::Destroy, None, false, &[], None, false, true);
        self.core.events.borrow_mut().clear();

        *self.core.superstate.borrow_mut() = None;
        self.core.destroyed.set(true);
        true
    }

    /// Discard a stale virtual stand-in.
    pub(crate) fn destroy_virtual(&self) {
        debug_assert!(self.is_virtual());
        *self.core.superstate.borrow_mut() = None;
        self.core.destroyed.set(true);
        tracing::trace!(state = %self.core.name, "discarded virtual state");
    }

    /// The substate a transition targeting this abstract state is
    /// redirected to: the first substate marked `default`, or simply the
    /// first substate. The protostate is consulted before falling back to
    /// an unmarked first substate.
    pub fn default_substate(&self, via_proto: bool) -> Option<State<O>> {
        self.default_substate_inner(via_proto, None)
    }

    fn default_substate_inner(&self, via_proto: bool, first: Option<State<O>>) -> Option<State<O>> {
        let substates = self.substates(false, false);
        let first = first.or_else(|| substates.first().cloned());
        for substate in &substates {
            if substate.is_default() {
                return Some(substate.clone());
            }
        }
        if via_proto {
            if let Some(protostate) = self.protostate() {
                return protostate.default_substate_inner(true, first);
            }
        }
        first
    }

    /// Locate the most deeply nested `initial`-marked state by a
    /// depth-within-breadth-first search; the protostate is consulted only
    /// when no local descendant qualifies.
    pub fn initial_substate(&self, via_proto: bool) -> Option<State<O>> {
        let mut queue = VecDeque::new();
        queue.push_back(self.clone());
        while let Some(subject) = queue.pop_front() {
            for substate in subject.substates(false, true) {
                if substate.is_initial() {
                    return substate.initial_substate(false).or(Some(substate));
                }
                queue.push_back(substate);
            }
        }
        if via_proto {
            if let Some(protostate) = self.protostate() {
                return protostate.initial_substate(true);
            }
        }
        None
    }

    /// Reconstruct the canonical expression describing this state's
    /// contents. Feeding the result back through construction yields a tree
    /// of identical shape.
    pub fn express(&self) -> StateExpr<O> {
        let mut expr = StateExpr::new();
        let mut attrs = self.attrs();
        attrs.remove(StateAttrs::VIRTUAL);
        expr.attrs = attrs;
        expr.data = self.core.data.borrow().clone();
        for (name, slot) in self.core.methods.borrow().iter() {
            if let MethodSlot::Fn(f) = slot {
                expr.methods.insert(name.clone(), Rc::clone(f));
            }
        }
        for (kind, list) in self.core.events.borrow().iter() {
            if !list.is_empty() {
                expr.events.insert(kind.clone(), list.snapshot());
            }
        }
        expr.admit = self.core.admit.borrow().clone();
        expr.release = self.core.release.borrow().clone();
        for (name, substate) in self.core.substates.borrow().iter() {
            expr.states.insert(name.clone(), substate.express());
        }
        for (name, template) in self.core.transitions.borrow().iter() {
            expr.transitions.insert(name.clone(), (**template).clone());
        }
        expr
    }

    /// Apply an expression to this existing state: data is overlaid,
    /// methods and guards merge, listeners append, named substates mutate
    /// recursively or are added, transition templates replace. Emits
    /// `Mutate`.
    pub fn mutate(&self, expr: StateExpr<O>) {
        if self.is_virtual() {
            if let Some(real) = self.realize() {
                real.mutate(expr);
            }
            return;
        }

        if !expr.data.is_empty() {
            let mut data = self.core.data.borrow_mut();
            for (key, value) in expr.data {
                data.insert(key, value);
            }
        }
        for (name, f) in expr.methods {
            self.add_method_fn(&name, f);
        }
        for (kind, listeners) in expr.events {
            for listener in listeners {
                self.add_listener(kind.clone(), listener);
            }
        }
        self.core.admit.borrow_mut().merge(&expr.admit);
        self.core.release.borrow_mut().merge(&expr.release);
        for (name, substate_expr) in expr.states {
            let existing = self.core.substates.borrow().get(&name).cloned();
            match existing {
                Some(substate) => substate.mutate(substate_expr),
                None => {
                    self.add_substate(&name, substate_expr);
                }
            }
        }
        for (name, template) in expr.transitions {
            self.add_transition_expr(&name, template);
        }

        self.emit_local(&EventType::Mutate, Vec::new());
    }
}
