//! State attribute flags.
//!
//! Every state carries a small set of attribute flags that constrain how it
//! may participate in the hierarchy and in transitions. Flags are fixed at
//! construction; a subset is inherited from the superstate and the protostate
//! as a one-time copy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Attribute flag set for a state.
///
/// # Example
///
/// ```rust
/// use protostate::StateAttrs;
///
/// let attrs = StateAttrs::ABSTRACT | StateAttrs::SEALED;
/// assert!(attrs.contains(StateAttrs::ABSTRACT));
/// assert!(!attrs.contains(StateAttrs::FINAL));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateAttrs(u16);

impl StateAttrs {
    /// No attributes.
    pub const NORMAL: StateAttrs = StateAttrs(0x0);

    /// A transient stand-in materialized to represent an inherited
    /// protostate locally. Virtual states are never members of their
    /// superstate's substate mapping.
    pub const VIRTUAL: StateAttrs = StateAttrs(0x1);

    /// Contents may change after initialization. Inherited by all
    /// descendant states. (Reserved.)
    pub const MUTABLE: StateAttrs = StateAttrs(0x2);

    /// Candidate default state for a newly constructed machine.
    pub const INITIAL: StateAttrs = StateAttrs(0x4);

    /// Once entered, cannot be exited, although transitions may still
    /// traverse within its substates.
    pub const CONCLUSIVE: StateAttrs = StateAttrs(0x8);

    /// Once entered, no further transitions are allowed.
    pub const FINAL: StateAttrs = StateAttrs(0x10);

    /// Cannot itself be current; transition targets redirect to a
    /// `DEFAULT` substate.
    pub const ABSTRACT: StateAttrs = StateAttrs(0x20);

    /// The redirection target for an abstract superstate.
    pub const DEFAULT: StateAttrs = StateAttrs(0x40);

    /// Cannot gain substates.
    pub const SEALED: StateAttrs = StateAttrs(0x80);

    /// (Reserved.)
    pub const RETAINED: StateAttrs = StateAttrs(0x100);

    /// (Reserved.)
    pub const HISTORY: StateAttrs = StateAttrs(0x200);

    /// (Reserved.)
    pub const SHALLOW: StateAttrs = StateAttrs(0x400);

    /// (Reserved.)
    pub const VERSIONED: StateAttrs = StateAttrs(0x800);

    /// (Reserved.)
    pub const CONCURRENT: StateAttrs = StateAttrs(0x1000);

    /// The subset a substate copies from its protostate at construction.
    pub const HERITABLE: StateAttrs = StateAttrs(
        Self::MUTABLE.0
            | Self::INITIAL.0
            | Self::CONCLUSIVE.0
            | Self::FINAL.0
            | Self::ABSTRACT.0
            | Self::DEFAULT.0
            | Self::SEALED.0
            | Self::RETAINED.0
            | Self::HISTORY.0
            | Self::SHALLOW.0
            | Self::VERSIONED.0
            | Self::CONCURRENT.0,
    );

    /// Check whether every flag in `other` is set.
    pub fn contains(self, other: StateAttrs) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check whether any flag in `other` is set.
    pub fn intersects(self, other: StateAttrs) -> bool {
        self.0 & other.0 != 0
    }

    /// Set every flag in `other`.
    pub fn insert(&mut self, other: StateAttrs) {
        self.0 |= other.0;
    }

    /// Clear every flag in `other`.
    pub fn remove(&mut self, other: StateAttrs) {
        self.0 &= !other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u16 {
        self.0
    }
}

impl BitOr for StateAttrs {
    type Output = StateAttrs;

    fn bitor(self, rhs: StateAttrs) -> StateAttrs {
        StateAttrs(self.0 | rhs.0)
    }
}

impl BitOrAssign for StateAttrs {
    fn bitor_assign(&mut self, rhs: StateAttrs) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for StateAttrs {
    type Output = StateAttrs;

    fn bitand(self, rhs: StateAttrs) -> StateAttrs {
        StateAttrs(self.0 & rhs.0)
    }
}

impl Not for StateAttrs {
    type Output = StateAttrs;

    fn not(self) -> StateAttrs {
        StateAttrs(!self.0)
    }
}

impl fmt::Debug for StateAttrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u16, &str); 13] = [
            (0x1, "VIRTUAL"),
            (0x2, "MUTABLE"),
            (0x4, "INITIAL"),
            (0x8, "CONCLUSIVE"),
            (0x10, "FINAL"),
            (0x20, "ABSTRACT"),
            (0x40, "DEFAULT"),
            (0x80, "SEALED"),
            (0x100, "RETAINED"),
            (0x200, "HISTORY"),
            (0x400, "SHALLOW"),
            (0x800, "VERSIONED"),
            (0x1000, "CONCURRENT"),
        ];

        if self.0 == 0 {
            return write!(f, "NORMAL");
        }
        let mut first = true;
        for (bit, name) in NAMES {
            if self.0 & bit != 0 {
                if !first {
                    write!(f, " | ")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_requires_all_flags() {
        let attrs = StateAttrs::INITIAL | StateAttrs::SEALED;
        assert!(attrs.contains(StateAttrs::INITIAL));
        assert!(attrs.contains(StateAttrs::INITIAL | StateAttrs::SEALED));
        assert!(!attrs.contains(StateAttrs::INITIAL | StateAttrs::FINAL));
    }

    #[test]
    fn heritable_excludes_virtual() {
        assert!(!StateAttrs::HERITABLE.contains(StateAttrs::VIRTUAL));
        assert!(StateAttrs::HERITABLE.contains(StateAttrs::CONCLUSIVE));
        assert!(StateAttrs::HERITABLE.contains(StateAttrs::CONCURRENT));
    }

    #[test]
    fn insert_and_remove_are_inverses() {
        let mut attrs = StateAttrs::NORMAL;
        attrs.insert(StateAttrs::ABSTRACT);
        assert!(attrs.contains(StateAttrs::ABSTRACT));
        attrs.remove(StateAttrs::ABSTRACT);
        assert!(attrs.is_empty());
    }

    #[test]
    fn debug_lists_flag_names() {
        let attrs = StateAttrs::ABSTRACT | StateAttrs::DEFAULT;
        let repr = format!("{attrs:?}");
        assert!(repr.contains("ABSTRACT"));
        assert!(repr.contains("DEFAULT"));
        assert_eq!(format!("{:?}", StateAttrs::NORMAL), "NORMAL");
    }

    #[test]
    fn serializes_as_bit_pattern() {
        let attrs = StateAttrs::INITIAL | StateAttrs::FINAL;
        let json = serde_json::to_string(&attrs).unwrap();
        assert_eq!(json, "20");
        let back: StateAttrs = serde_json::from_str(&json).unwrap();
        assert_eq!(back, attrs);
    }
}
