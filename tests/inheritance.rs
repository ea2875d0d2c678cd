//! Cross-machine inheritance: protostates, virtual states, method
//! resolution order, guard inheritance, and expression round trips.

use protostate::{
    ChangeOptions, EventType, Machine, MachineOptions, StateAttrs, StateExpr, Value,
};
use std::cell::RefCell;
use std::rc::Rc;

struct Widget;

/// A template machine: `A` with substate `B`, methods at several depths.
fn template() -> Machine<Widget> {
    let expr: StateExpr<Widget> = StateExpr::new()
        .method("root_only", |_, _, _| Value::from("template root"))
        .state(
            "A",
            StateExpr::new()
                .method("describe", |_, _, _| Value::from("template A"))
                .state(
                    "B",
                    StateExpr::new().method("describe", |_, _, _| Value::from("template A.B")),
                ),
        );
    Machine::new(expr, MachineOptions::default())
}

#[test]
fn change_into_template_path_materializes_virtual_states() {
    let base = template();
    let derived: Machine<Widget> =
        Machine::new(StateExpr::new(), MachineOptions::default().proto(base.clone()));

    let target = derived.change("A.B", ChangeOptions::default()).unwrap();
    assert_eq!(target.path(), "A.B");

    let current = derived.current_state().unwrap();
    assert!(current.is_virtual());
    assert_eq!(current.path(), "A.B");
    assert!(current.superstate().unwrap().is_virtual());

    // The stand-ins belong to the derived machine, not the template.
    assert_eq!(current.machine(), Some(derived.clone()));
    assert_eq!(
        current.protostate().unwrap().machine(),
        Some(base.clone())
    );
}

#[test]
fn sibling_transition_discards_stale_virtual_states() {
    let base = template();
    let derived: Machine<Widget> = Machine::new(
        StateExpr::new().state("Local", StateExpr::new()),
        MachineOptions::default().proto(base),
    );

    derived.change("A.B", ChangeOptions::default()).unwrap();
    let virtual_b = derived.current_state().unwrap();
    let virtual_a = virtual_b.superstate().unwrap();
    assert!(virtual_b.is_virtual() && virtual_a.is_virtual());

    derived.change("Local", ChangeOptions::default()).unwrap();
    assert!(virtual_b.is_destroyed());
    assert!(virtual_a.is_destroyed());
    assert_eq!(derived.current_state().unwrap().name(), "Local");
}

#[test]
fn dispatch_inherits_methods_through_virtual_states() {
    let base = template();
    let derived: Machine<Widget> =
        Machine::new(StateExpr::new(), MachineOptions::default().proto(base));
    let mut owner = Widget;

    derived.change("A.B", ChangeOptions::default()).unwrap();
    assert_eq!(
        derived.call(&mut owner, "describe", &[]),
        Some(Value::from("template A.B"))
    );
    // Root-level template methods reach the derived owner as well.
    assert_eq!(
        derived.call(&mut owner, "root_only", &[]),
        Some(Value::from("template root"))
    );
}

#[test]
fn protostate_lookup_precedes_superstate_lookup() {
    // The local tree offers `describe` on the parent state; the template
    // offers it on the analogous substate itself. The protostate must win.
    let base = template();
    let derived: Machine<Widget> = Machine::new(
        StateExpr::new().state(
            "A",
            StateExpr::new()
                .method("describe", |_, _, _| Value::from("local A"))
                .state("B", StateExpr::new()),
        ),
        MachineOptions::default().proto(base),
    );
    let mut owner = Widget;

    derived.change("A.B", ChangeOptions::default()).unwrap();
    assert_eq!(
        derived.call(&mut owner, "describe", &[]),
        Some(Value::from("template A.B"))
    );
}

#[test]
fn local_override_shadows_protostate() {
    let base = template();
    let derived: Machine<Widget> = Machine::new(
        StateExpr::new().state(
            "A",
            StateExpr::new().state(
                "B",
                StateExpr::new().method("describe", |_, _, _| Value::from("derived A.B")),
            ),
        ),
        MachineOptions::default().proto(base),
    );
    let mut owner = Widget;

    derived.change("A.B", ChangeOptions::default()).unwrap();
    assert_eq!(
        derived.call(&mut owner, "describe", &[]),
        Some(Value::from("derived A.B"))
    );
}

#[test]
fn protostate_method_binds_to_local_inheritor() {
    let seen: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let probe = Rc::clone(&seen);

    let base: Machine<Widget> = Machine::new(
        StateExpr::new().state(
            "A",
            StateExpr::new().method("whereami", move |_, ctx, _| {
                probe.borrow_mut().push(ctx.state.path());
                Value::Null
            }),
        ),
        MachineOptions::default(),
    );
    let derived: Machine<Widget> =
        Machine::new(StateExpr::new(), MachineOptions::default().proto(base));
    let mut owner = Widget;

    derived.change("A", ChangeOptions::default()).unwrap();
    derived.call(&mut owner, "whereami", &[]);

    // The binding context is the derived machine's virtual counterpart.
    assert_eq!(*seen.borrow(), vec!["A".to_string()]);
    let bound = derived.current_state().unwrap();
    assert!(bound.is_virtual());
}

#[test]
fn guards_are_inherited_from_protostates_only() {
    let base: Machine<Widget> = Machine::new(
        StateExpr::new()
            .state("Open", StateExpr::new().attrs(StateAttrs::INITIAL))
            .state("Shut", StateExpr::new().admit("*", false)),
        MachineOptions::default(),
    );
    let derived: Machine<Widget> = Machine::new(
        StateExpr::new()
            .state("Open", StateExpr::new().attrs(StateAttrs::INITIAL))
            .state("Shut", StateExpr::new()),
        MachineOptions::default().proto(base),
    );

    // The derived `Shut` declares no guard of its own, but inherits the
    // template's refusal.
    assert!(derived.change("Shut", ChangeOptions::default()).is_none());
    assert_eq!(derived.current_state().unwrap().name(), "Open");

    // Forcing still works, proving the rejection came from the guard.
    assert!(derived
        .change("Shut", ChangeOptions::default().forced())
        .is_some());
}

#[test]
fn initial_state_can_come_from_the_template() {
    let base: Machine<Widget> = Machine::new(
        StateExpr::new()
            .state("Idle", StateExpr::new())
            .state("Ready", StateExpr::new().attrs(StateAttrs::INITIAL)),
        MachineOptions::default(),
    );
    let derived: Machine<Widget> =
        Machine::new(StateExpr::new(), MachineOptions::default().proto(base));

    let current = derived.current_state().unwrap();
    assert_eq!(current.name(), "Ready");
    assert!(current.is_virtual());
}

#[test]
fn attributes_copy_from_protostate_at_construction() {
    let base: Machine<Widget> = Machine::new(
        StateExpr::new().state("Stuck", StateExpr::new().attrs(StateAttrs::CONCLUSIVE)),
        MachineOptions::default(),
    );
    let derived: Machine<Widget> = Machine::new(
        StateExpr::new().state("Stuck", StateExpr::new()).state("Out", StateExpr::new()),
        MachineOptions::default().proto(base),
    );

    let local = derived.root_state().unwrap().substate("Stuck", false).unwrap();
    assert!(local.is_conclusive());

    derived.change("Stuck", ChangeOptions::default()).unwrap();
    assert!(derived.change("Out", ChangeOptions::default()).is_none());
}

#[test]
fn protostate_events_fire_after_local_listeners() {
    let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
    let base_log = Rc::clone(&log);
    let derived_log = Rc::clone(&log);

    let base: Machine<Widget> = Machine::new(
        StateExpr::new().state(
            "On",
            StateExpr::new().on(EventType::Arrive, move |_| {
                base_log.borrow_mut().push("template listener")
            }),
        ),
        MachineOptions::default(),
    );
    let derived: Machine<Widget> = Machine::new(
        StateExpr::new().state(
            "On",
            StateExpr::new().on(EventType::Arrive, move |_| {
                derived_log.borrow_mut().push("local listener")
            }),
        ),
        MachineOptions::default().proto(base),
    );

    derived.change("On", ChangeOptions::default()).unwrap();
    assert_eq!(*log.borrow(), vec!["local listener", "template listener"]);
}

#[test]
fn data_merges_superstate_then_protostate_then_own() {
    let base: Machine<Widget> = Machine::new(
        StateExpr::new().state(
            "A",
            StateExpr::new()
                .data("from_proto", Value::from(true))
                .data("shared", Value::from("proto")),
        ),
        MachineOptions::default(),
    );
    let derived: Machine<Widget> = Machine::new(
        StateExpr::new().data("from_super", Value::from(true)).state(
            "A",
            StateExpr::new().data("shared", Value::from("own")),
        ),
        MachineOptions::default().proto(base),
    );

    let a = derived.root_state().unwrap().substate("A", false).unwrap();
    let data = a.data();
    assert_eq!(data.get("from_super"), Some(&Value::from(true)));
    assert_eq!(data.get("from_proto"), Some(&Value::from(true)));
    assert_eq!(data.get("shared"), Some(&Value::from("own")));
}

#[test]
fn query_falls_back_to_protostate_paths() {
    let base = template();
    let derived: Machine<Widget> =
        Machine::new(StateExpr::new(), MachineOptions::default().proto(base.clone()));

    let found = derived
        .root_state()
        .unwrap()
        .query_one("A.B")
        .expect("protostate path should resolve");
    assert_eq!(found.machine(), Some(base));
}

#[test]
fn no_such_method_emits_general_and_specific_events() {
    let general = Rc::new(RefCell::new(Vec::new()));
    let specific = Rc::new(RefCell::new(0usize));
    let general_log = Rc::clone(&general);
    let specific_count = Rc::clone(&specific);

    let machine: Machine<Widget> = Machine::new(StateExpr::new(), MachineOptions::default());
    let root = machine.root_state().unwrap();
    root.on(EventType::NoSuchMethod, move |event| {
        general_log.borrow_mut().push(event.args[0].clone());
    });
    root.on(EventType::no_such_method("missing"), move |_| {
        *specific_count.borrow_mut() += 1;
    });

    let mut owner = Widget;
    assert!(machine.call(&mut owner, "missing", &[]).is_none());
    assert_eq!(*general.borrow(), vec![Value::from("missing")]);
    assert_eq!(*specific.borrow(), 1);

    // The strict entry point fails hard and emits nothing further.
    let err = machine.invoke(&mut owner, "missing", &[]).unwrap_err();
    assert!(matches!(
        err,
        protostate::DispatchError::NoSuchMethod { .. }
    ));
    assert_eq!(*specific.borrow(), 1);
}

#[test]
fn express_round_trip_preserves_shape() {
    let source: StateExpr<Widget> = StateExpr::new()
        .data("kind", Value::from("demo"))
        .state(
            "Idle",
            StateExpr::new()
                .attrs(StateAttrs::INITIAL)
                .method("poke", |_, _, _| Value::from("poked"))
                .admit("Busy", false),
        )
        .state(
            "Busy",
            StateExpr::new().state("Deep", StateExpr::new().attrs(StateAttrs::SEALED)),
        );
    let machine = Machine::new(source, MachineOptions::default());

    let expressed = machine.root_state().unwrap().express();
    let rebuilt = Machine::new(expressed, MachineOptions::default());
    let root = rebuilt.root_state().unwrap();

    assert_eq!(root.data().get("kind"), Some(&Value::from("demo")));
    let idle = root.substate("Idle", false).unwrap();
    assert!(idle.is_initial());
    assert!(idle.has_own_method("poke"));
    assert_eq!(
        idle.guard(protostate::GuardKind::Admit).unwrap().keys(),
        vec!["Busy"]
    );
    let busy = root.substate("Busy", false).unwrap();
    let deep = busy.substate("Deep", false).unwrap();
    assert!(deep.is_sealed());
    assert_eq!(rebuilt.current_state().unwrap().name(), "Idle");

    let mut owner = Widget;
    rebuilt.change("Idle", ChangeOptions::default().forced());
    assert_eq!(
        rebuilt.call(&mut owner, "poke", &[]),
        Some(Value::from("poked"))
    );
}

#[test]
fn protostate_memo_survives_unrelated_mutation() {
    let base = template();
    let derived: Machine<Widget> = Machine::new(
        StateExpr::new().state("A", StateExpr::new()),
        MachineOptions::default().proto(base.clone()),
    );

    let local_a = derived.root_state().unwrap().substate("A", false).unwrap();
    let first = local_a.protostate().unwrap();

    base.root_state()
        .unwrap()
        .add_substate("Unrelated", StateExpr::new())
        .unwrap();
    let second = local_a.protostate().unwrap();
    assert_eq!(first, second);
}

#[test]
fn derivation_and_ancestry_predicates() {
    let machine: Machine<Widget> = Machine::new(
        StateExpr::new().state(
            "A",
            StateExpr::new().state("B", StateExpr::new().state("C", StateExpr::new())),
        ),
        MachineOptions::default(),
    );
    let root = machine.root_state().unwrap();
    let a = root.substate("A", false).unwrap();
    let b = a.substate("B", false).unwrap();
    let c = b.substate("C", false).unwrap();

    assert_eq!(c.derivation_names(), vec!["A", "B", "C"]);
    assert_eq!(c.depth(), 3);
    assert_eq!(c.path(), "A.B.C");
    assert!(a.is_superstate_of(&c));
    assert!(!c.is_superstate_of(&a));
    assert!(c.is_in(&a));
    assert!(a.has(&c));
    assert_eq!(a.common(&c), Some(a.clone()));
    assert_eq!(c.common(&a), Some(a.clone()));
    assert_eq!(c.superstate_named("A"), Some(a.clone()));

    let base = template();
    let derived: Machine<Widget> =
        Machine::new(StateExpr::new(), MachineOptions::default().proto(base.clone()));
    derived.change("A", ChangeOptions::default()).unwrap();
    let proto_a = base.root_state().unwrap().substate("A", false).unwrap();
    assert!(proto_a.is_protostate_of(&derived.current_state().unwrap()));
}
