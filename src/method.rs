//! Method storage, resolution, and strict application.
//!
//! A state owns a table of method overrides. Resolution for a name walks the
//! protostate chain before the superstate chain at every level, so behavior
//! is inherited from the analogous ancestor-owner state before falling back
//! to the local parent state.
//!
//! The root's table may also hold the owner's pre-existing implementation of
//! an overridden method (its "default"), or a no-op sentinel when the owner
//! had none; the sentinel keeps dispatch silent for names some state defines
//! but no active state currently implements.

use crate::error::DispatchError;
use crate::state::State;
use crate::Value;
use std::fmt;
use std::rc::Rc;

/// A stateful method implementation.
///
/// Methods receive the owner, the binding context, and the call arguments.
pub type MethodFn<O> = Rc<dyn Fn(&mut O, &MethodContext<O>, &[Value]) -> Value>;

/// The binding context of a resolved method.
pub struct MethodContext<O: 'static> {
    /// The state the invocation is bound to: the defining state, or for a
    /// protostate-inherited method the corresponding local state, or the
    /// root for a relocated owner default.
    pub state: State<O>,
    /// True when the resolved function is the owner's pre-existing
    /// implementation relocated to the root.
    pub original: bool,
}

impl<O> fmt::Debug for MethodContext<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodContext")
            .field("state", &self.state)
            .field("original", &self.original)
            .finish()
    }
}

/// A slot in a state's method table.
pub(crate) enum MethodSlot<O: 'static> {
    Fn(MethodFn<O>),
    /// The designated no-op sentinel. Skipped during resolution, but if
    /// nothing else resolves, dispatch silently yields `Value::Null`.
    Noop,
}

impl<O> Clone for MethodSlot<O> {
    fn clone(&self) -> Self {
        match self {
            MethodSlot::Fn(f) => MethodSlot::Fn(Rc::clone(f)),
            MethodSlot::Noop => MethodSlot::Noop,
        }
    }
}

/// A successful resolution.
pub(crate) struct ResolvedMethod<O: 'static> {
    pub slot: MethodSlot<O>,
    pub context: State<O>,
    pub original: bool,
}

impl<O> State<O> {
    /// Resolve `name` from this state, walking the protostate chain before
    /// the superstate chain.
    pub(crate) fn resolve_method(
        &self,
        name: &str,
        via_super: bool,
        via_proto: bool,
    ) -> Option<ResolvedMethod<O>> {
        let own = self.core.methods.borrow().get(name).cloned();

        if let Some(MethodSlot::Fn(f)) = &own {
            let original = self.is_root() && self.machine().is_some_and(|m| m.is_original(name));
            return Some(ResolvedMethod {
                slot: MethodSlot::Fn(Rc::clone(f)),
                context: self.clone(),
                original,
            });
        }

        if via_proto {
            if let Some(protostate) = self.protostate() {
                if let Some(mut resolved) = protostate.resolve_method(name, false, true) {
                    // A protostate-inherited method binds to the local
                    // inheritor, not the defining state.
                    resolved.context = self.clone();
                    resolved.original = false;
                    return Some(resolved);
                }
            }
        }

        if via_super {
            if let Some(superstate) = self.superstate() {
                if let Some(resolved) = superstate.resolve_method(name, true, via_proto) {
                    return Some(resolved);
                }
            }
        }

        // Nothing reachable implements the method; surface the sentinel if
        // this level held one.
        if matches!(own, Some(MethodSlot::Noop)) {
            return Some(ResolvedMethod {
                slot: MethodSlot::Noop,
                context: self.clone(),
                original: false,
            });
        }

        None
    }

    /// Whether this state possesses or inherits an implementation of
    /// `name` (the sentinel does not count).
    pub fn has_method(&self, name: &str) -> bool {
        matches!(
            self.resolve_method(name, true, true),
            Some(ResolvedMethod {
                slot: MethodSlot::Fn(_),
                ..
            })
        )
    }

    /// Whether this state's own table implements `name`.
    pub fn has_own_method(&self, name: &str) -> bool {
        matches!(
            self.core.methods.borrow().get(name),
            Some(MethodSlot::Fn(_))
        )
    }

    /// Names of the methods defined directly on this state.
    pub fn method_names(&self) -> Vec<String> {
        self.core
            .methods
            .borrow()
            .iter()
            .filter(|(_, slot)| matches!(slot, MethodSlot::Fn(_)))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Add a method override to this state.
    ///
    /// The first time a name becomes stateful anywhere in the local
    /// hierarchy, the owner's pre-existing implementation — registered with
    /// the machine as a default — is relocated onto the root so it remains
    /// the behavior when no active state overrides it; absent a default, the
    /// no-op sentinel is installed instead.
    pub fn add_method<F>(&self, name: &str, f: F)
    where
        F: Fn(&mut O, &MethodContext<O>, &[Value]) -> Value + 'static,
    {
        self.add_method_fn(name, Rc::new(f));
    }

    pub(crate) fn add_method_fn(&self, name: &str, f: MethodFn<O>) {
        if self.is_virtual() {
            if let Some(real) = self.realize() {
                real.add_method_fn(name, f);
            }
            return;
        }

        if self.resolve_method(name, true, false).is_none() {
            if let Some(machine) = self.machine() {
                if let Some(root) = machine.root_state() {
                    let root_has_own = root.core.methods.borrow().contains_key(name);
                    if *self != root && !root_has_own {
                        match machine.take_default(name) {
                            Some(original) => {
                                machine.mark_original(name);
                                root.core
                                    .methods
                                    .borrow_mut()
                                    .insert(name.to_string(), MethodSlot::Fn(original));
                            }
                            None => {
                                root.core
                                    .methods
                                    .borrow_mut()
                                    .insert(name.to_string(), MethodSlot::Noop);
                            }
                        }
                    }
                }
            }
        }

        self.core
            .methods
            .borrow_mut()
            .insert(name.to_string(), MethodSlot::Fn(f));
    }

    /// Dissociate the named method from this state, returning it.
    pub fn remove_method(&self, name: &str) -> Option<MethodFn<O>> {
        match self.core.methods.borrow_mut().shift_remove(name) {
            Some(MethodSlot::Fn(f)) => Some(f),
            _ => None,
        }
    }

    /// Strict application: resolve and invoke `name`, or fail with a typed
    /// error. The lenient counterpart is `Machine::call`.
    pub fn apply(&self, owner: &mut O, name: &str, args: &[Value]) -> Result<Value, DispatchError> {
        let resolved =
            self.resolve_method(name, true, true)
                .ok_or_else(|| DispatchError::NoSuchMethod {
                    state: self.path(),
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
}
