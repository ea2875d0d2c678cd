//! Protostate resolution.
//!
//! A state's protostate is the state occupying the identical derivation
//! path on the machine's parent template (and failing that, the template's
//! template, and so on). Resolution is memoized; the memo watches the cached
//! instance's destroyed flag and re-resolves if it trips.

use crate::state::node::WeakState;
use crate::state::State;

pub(crate) enum ProtoCell<O: 'static> {
    Unresolved,
    Cached(WeakState<O>),
}

impl<O> State<O> {
    /// The analogous state on the nearest parent-template machine that has
    /// one, or `None` when no template in the chain carries this state's
    /// derivation path.
    ///
    /// Repeated calls return the identical instance until it is destroyed,
    /// after which resolution is retried from scratch.
    pub fn protostate(&self) -> Option<State<O>> {
        {
            let cell = self.core.protostate.borrow();
            if let ProtoCell::Cached(weak) = &*cell {
                if let Some(cached) = weak.upgrade() {
                    if !cached.is_destroyed() {
                        return Some(cached);
                    }
                }
            }
        }
        *self.core.protostate.borrow_mut() = ProtoCell::Unresolved;

        let machine = self.machine()?;
        let names = self.derivation_names();

        let mut template = machine.proto();
        while let Some(candidate) = template {
            if let Some(found) = descend(&candidate.root_state()?, &names) {
                *self.core.protostate.borrow_mut() = ProtoCell::Cached(found.downgrade());
                return Some(found);
            }
            template = candidate.proto();
        }
        None
    }
}

/// Walk a template root down through a derivation path, one segment at a
/// time, without crossing into further protostates.
fn descend<O>(root: &State<O>, names: &[String]) -> Option<State<O>> {
    let mut cursor = root.clone();
    for name in names {
        cursor = cursor.substate(name, false)?;
    }
    Some(cursor)
}

#[cfg(test)]
mod tests {
    use crate::expr::StateExpr;
    use crate::machine::{Machine, MachineOptions};

    fn base() -> Machine<()> {
        Machine::new(
            StateExpr::new().state("A", StateExpr::new().state("B", StateExpr::new())),
            MachineOptions::default(),
        )
    }

    #[test]
    fn resolves_identical_derivation_path() {
        let base = base();
        let derived: Machine<()> = Machine::new(
            StateExpr::new(),
            MachineOptions::default().proto(base.clone()),
        );

        let root_proto = derived.root_state().unwrap().protostate().unwrap();
        assert_eq!(root_proto, base.root_state().unwrap());
    }

    #[test]
    fn resolution_skips_templates_missing_the_path() {
        let base = base();
        let middle: Machine<()> = Machine::new(
            StateExpr::new(),
            MachineOptions::default().proto(base.clone()),
        );
        let derived: Machine<()> = Machine::new(
            StateExpr::new().state("A", StateExpr::new()),
            MachineOptions::default().proto(middle),
        );

        // "A" exists locally and on `base` but not on `middle`; the
        // protostate search walks past the gap.
        let local_a = derived.root_state().unwrap().substate("A", false).unwrap();
        let proto_a = local_a.protostate().unwrap();
        assert_eq!(
            proto_a,
            base.root_state().unwrap().substate("A", false).unwrap()
        );
    }

    #[test]
    fn memoization_returns_identical_instance() {
        let base = base();
        let derived: Machine<()> = Machine::new(
            StateExpr::new().state("A", StateExpr::new()),
            MachineOptions::default().proto(base),
        );

        let local_a = derived.root_state().unwrap().substate("A", false).unwrap();
        let first = local_a.protostate().unwrap();
        let second = local_a.protostate().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn memo_invalidates_when_cached_instance_is_destroyed() {
        let base = base();
        let derived: Machine<()> = Machine::new(
            StateExpr::new().state("A", StateExpr::new()),
            MachineOptions::default().proto(base.clone()),
        );

        let local_a = derived.root_state().unwrap().substate("A", false).unwrap();
        let proto_a = local_a.protostate().unwrap();
        assert!(!proto_a.is_destroyed());

        // Destroying base's "A" must not leave the memo serving a dead
        // reference.
        assert!(base.root_state().unwrap().substate("A", false).unwrap().destroy());
        assert!(local_a.protostate().is_none());
    }
}
