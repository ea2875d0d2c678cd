//! Property-based tests over randomly shaped state trees.
//!
//! These verify the structural invariants of the graph — single-rootedness,
//! least-common-ancestor minimality, and the exact exit/enter sets of a
//! traversal — across many generated tree shapes.

use proptest::prelude::*;
use protostate::{ChangeOptions, EventType, Machine, MachineOptions, Selector, StateExpr};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

#[derive(Default)]
struct Shape {
    children: BTreeMap<String, Shape>,
}

fn insert_path(shape: &mut Shape, path: &[u8]) {
    if let Some((head, tail)) = path.split_first() {
        let name = ["a", "b", "c"][(*head % 3) as usize].to_string();
        insert_path(shape.children.entry(name).or_default(), tail);
    }
}

fn to_expr(shape: &Shape) -> StateExpr<()> {
    let mut expr = StateExpr::new();
    for (name, child) in &shape.children {
        expr = expr.state(name, to_expr(child));
    }
    expr
}

fn build_machine(paths: &[Vec<u8>]) -> Machine<()> {
    let mut shape = Shape::default();
    for path in paths {
        insert_path(&mut shape, path);
    }
    Machine::new(to_expr(&shape), MachineOptions::default())
}

fn all_states(machine: &Machine<()>) -> Vec<protostate::State<()>> {
    let root = machine.root_state().unwrap();
    let mut states = vec![root.clone()];
    states.extend(root.substates(true, false));
    states
}

fn path_strategy() -> impl Strategy<Value = Vec<Vec<u8>>> {
    proptest::collection::vec(proptest::collection::vec(0u8..3, 1..5), 0..12)
}

proptest! {
    #[test]
    fn derivation_is_finite_and_single_rooted(paths in path_strategy()) {
        let machine = build_machine(&paths);
        let root = machine.root_state().unwrap();
        prop_assert!(root.superstate().is_none());

        for state in all_states(&machine) {
            let derivation = state.derivation();
            prop_assert_eq!(derivation.len(), state.depth());
            prop_assert_eq!(state.root(), Some(root.clone()));
            // The derivation excludes the root and ends at the state.
            if let Some(last) = derivation.last() {
                prop_assert_eq!(last, &state);
            }
            for step in &derivation {
                prop_assert!(step != &root);
            }
        }
    }

    #[test]
    fn common_is_a_minimal_mutual_ancestor(
        paths in path_strategy(),
        i in 0usize..64,
        j in 0usize..64,
    ) {
        let machine = build_machine(&paths);
        let states = all_states(&machine);
        let a = states[i % states.len()].clone();
        let b = states[j % states.len()].clone();

        let common = a.common(&b).unwrap();
        prop_assert!(common.has(&a));
        prop_assert!(common.has(&b));
        prop_assert_eq!(a.common(&b), b.common(&a));

        // No proper descendant of the common ancestor still covers both.
        for child in common.substates(false, false) {
            prop_assert!(!(child.has(&a) && child.has(&b)));
        }
    }

    #[test]
    fn traversal_exits_and_enters_exactly_the_open_paths(
        paths in path_strategy(),
        i in 0usize..64,
        j in 0usize..64,
    ) {
        let machine = build_machine(&paths);
        let states = all_states(&machine);
        let origin = states[i % states.len()].clone();
        let target = states[j % states.len()].clone();

        let exited: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let entered: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        for state in &states {
            let log = Rc::clone(&exited);
            let path = state.path();
            state.on(EventType::Exit, move |_| log.borrow_mut().push(path.clone()));
            let log = Rc::clone(&entered);
            let path = state.path();
            state.on(EventType::Enter, move |_| log.borrow_mut().push(path.clone()));
        }

        machine.change(&origin, ChangeOptions::default()).unwrap();
        exited.borrow_mut().clear();
        entered.borrow_mut().clear();

        machine.change(&target, ChangeOptions::default()).unwrap();
        let domain = origin.common(&target).unwrap();

        // Exited: the open path (origin, domain), leaf upward.
        let mut expected_exits = Vec::new();
        let mut cursor = origin.clone();
        while cursor != domain {
            expected_exits.push(cursor.path());
            cursor = cursor.superstate().unwrap();
        }
        // Entered: the open path (domain, target], top downward.
        let mut expected_enters = Vec::new();
        let mut cursor = target.clone();
        while cursor != domain {
            expected_enters.push(cursor.path());
            cursor = cursor.superstate().unwrap();
        }
        expected_enters.reverse();

        prop_assert_eq!(&*exited.borrow(), &expected_exits);
        prop_assert_eq!(&*entered.borrow(), &expected_enters);
        prop_assert_eq!(machine.current_state(), Some(target));
    }

    #[test]
    fn selector_parse_is_lossless_and_classifies_anchoring(
        tokens in proptest::collection::vec("[a-c*]{1,2}", 1..4),
        relative in proptest::bool::ANY,
    ) {
        let mut source = tokens.join(".");
        if relative {
            source.insert(0, '.');
        }
        let selector = Selector::parse(&source);
        prop_assert_eq!(selector.source(), source.as_str());
        prop_assert_eq!(selector.is_absolute(), !relative);
    }
}
