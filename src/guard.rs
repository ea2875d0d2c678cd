//! Admission and release guards.
//!
//! A guard is an ordered map from path selectors to boolean verdicts or
//! predicates, evaluated against the counterpart state of a proposed
//! transition. Guards are inherited from protostates, never from
//! superstates.

use crate::query::Selector;
use crate::state::State;
use std::fmt;
use std::rc::Rc;

/// The two guard positions on a state.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum GuardKind {
    /// Gates entry into the guarded state.
    Admit,
    /// Gates exit from the guarded state.
    Release,
}

impl GuardKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GuardKind::Admit => "admit",
            GuardKind::Release => "release",
        }
    }
}

/// Context handed to guard predicates.
pub struct GuardContext<O: 'static> {
    /// The state carrying the guard.
    pub state: State<O>,
    /// The counterpart state of the proposed change: the origin for an
    /// `admit` guard, the target for a `release` guard.
    pub against: State<O>,
}

/// A guard predicate.
pub type GuardFn<O> = Rc<dyn Fn(&GuardContext<O>) -> bool>;

/// The verdict bound to a guard selector.
pub enum GuardValue<O: 'static> {
    /// A literal verdict.
    Allow(bool),
    /// A predicate evaluated at change time.
    Predicate(GuardFn<O>),
}

impl<O> GuardValue<O> {
    fn evaluate(&self, ctx: &GuardContext<O>) -> bool {
        match self {
            GuardValue::Allow(verdict) => *verdict,
            GuardValue::Predicate(f) => f(ctx),
        }
    }
}

impl<O> Clone for GuardValue<O> {
    fn clone(&self) -> Self {
        match self {
            GuardValue::Allow(v) => GuardValue::Allow(*v),
            GuardValue::Predicate(f) => GuardValue::Predicate(Rc::clone(f)),
        }
    }
}

impl<O> From<bool> for GuardValue<O> {
    fn from(verdict: bool) -> Self {
        GuardValue::Allow(verdict)
    }
}

impl<O> fmt::Debug for GuardValue<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardValue::Allow(v) => f.debug_tuple("Allow").field(v).finish(),
            GuardValue::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

pub(crate) struct GuardEntry<O: 'static> {
    key: String,
    selectors: Vec<Selector>,
    value: GuardValue<O>,
}

impl<O> Clone for GuardEntry<O> {
    fn clone(&self) -> Self {
        GuardEntry {
            key: self.key.clone(),
            selectors: self.selectors.clone(),
            value: self.value.clone(),
        }
    }
}

/// An ordered, selector-keyed guard map.
///
/// Keys may hold several comma-separated selectors; each is compiled once at
/// insertion. Evaluation walks entries in definition order: within an entry
/// the first selector matching the counterpart decides that entry, entries
/// are ANDed together, and evaluation short-circuits on the first refusal.
/// An empty guard passes vacuously.
pub struct Guard<O: 'static> {
    entries: Vec<GuardEntry<O>>,
}

impl<O> Default for Guard<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O> Clone for Guard<O> {
    fn clone(&self) -> Self {
        Guard {
            entries: self.entries.clone(),
        }
    }
}

impl<O> Guard<O> {
    pub fn new() -> Self {
        Guard {
            entries: Vec::new(),
        }
    }

    /// Bind a verdict to a selector key, replacing any entry under the same
    /// key while preserving definition order for the rest.
    pub fn insert(&mut self, key: &str, value: GuardValue<O>) {
        let selectors = key
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Selector::parse)
            .collect();
        let entry = GuardEntry {
            key: key.to_string(),
            selectors,
            value,
        };
        match self.entries.iter_mut().find(|e| e.key == key) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    /// Remove the entry under `key`, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<GuardValue<O>> {
        let index = self.entries.iter().position(|e| e.key == key)?;
        Some(self.entries.remove(index).value)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// The selector keys in definition order.
    pub fn keys(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.key.as_str()).collect()
    }

    /// Fold another guard's entries into this one, replacing entries that
    /// share a key.
    pub(crate) fn merge(&mut self, other: &Guard<O>) {
        for entry in &other.entries {
            match self.entries.iter_mut().find(|e| e.key == entry.key) {
                Some(existing) => *existing = entry.clone(),
                None => self.entries.push(entry.clone()),
            }
        }
    }

    /// Evaluate this guard held by `state` against a counterpart.
    pub fn evaluate(&self, state: &State<O>, against: &State<O>) -> bool {
        let ctx = GuardContext {
            state: state.clone(),
            against: against.clone(),
        };
        for entry in &self.entries {
            let mut verdict = true;
            for selector in &entry.selectors {
                if state.test_selector(selector, against) {
                    verdict = entry.value.evaluate(&ctx);
                    break;
                }
            }
            if !verdict {
                return false;
            }
        }
        true
    }
}

impl<O> fmt::Debug for Guard<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|e| (&e.key, &e.value)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_guard_passes() {
        let guard: Guard<()> = Guard::new();
        assert!(guard.is_empty());
        // Evaluation against real states is covered in the machine tests;
        // an empty entry list trivially yields a pass.
        assert_eq!(guard.len(), 0);
    }

    #[test]
    fn insert_replaces_same_key_in_place() {
        let mut guard: Guard<()> = Guard::new();
        guard.insert("A", GuardValue::Allow(true));
        guard.insert("B", GuardValue::Allow(true));
        guard.insert("A", GuardValue::Allow(false));
        assert_eq!(guard.keys(), vec!["A", "B"]);
        assert_eq!(guard.len(), 2);
    }

    #[test]
    fn comma_separated_keys_compile_to_multiple_selectors() {
        let mut guard: Guard<()> = Guard::new();
        guard.insert("Red, Green", GuardValue::Allow(false));
        assert_eq!(guard.entries[0].selectors.len(), 2);
        assert_eq!(guard.entries[0].selectors[0].source(), "Red");
        assert_eq!(guard.entries[0].selectors[1].source(), "Green");
    }

    #[test]
    fn remove_returns_value() {
        let mut guard: Guard<()> = Guard::new();
        guard.insert("X", GuardValue::Allow(false));
        assert!(matches!(guard.remove("X"), Some(GuardValue::Allow(false))));
        assert!(guard.remove("X").is_none());
        assert!(guard.is_empty());
    }
}
