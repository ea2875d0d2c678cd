//! Path-query selectors.
//!
//! States are addressed by dot-separated path expressions. An expression with
//! a leading `.` is evaluated relative to the invocation context; anything
//! else is absolute and re-evaluated from the root. Additional leading dots
//! ascend one superstate each, `*` names the immediate substates of the
//! preceding token, `**` names all of its descendants, and any other token
//! names a specific substate.
//!
//! Expressions are compiled once into a [`Selector`] and reused, so guard and
//! transition-template matching never re-parses the grammar.

use crate::state::State;
use std::collections::VecDeque;
use std::fmt;

/// One step of a compiled path query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    /// Move to the superstate.
    Ascend,
    /// Move to the named substate.
    Child(String),
    /// All immediate substates.
    AnyChild,
    /// All descendant states.
    AnyDescendants,
}

/// A compiled path-query expression.
///
/// # Example
///
/// ```rust
/// use protostate::Selector;
///
/// let sel = Selector::parse("..Sibling.Child");
/// assert!(!sel.is_absolute());
/// assert_eq!(sel.source(), "..Sibling.Child");
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selector {
    source: String,
    absolute: bool,
    segments: Vec<Segment>,
}

impl Selector {
    /// Compile a path expression.
    ///
    /// The grammar never fails to parse; unrecognized tokens are literal
    /// substate names that will simply fail to resolve.
    pub fn parse(expr: &str) -> Selector {
        let source = expr.to_string();

        // The empty expression addresses the root.
        if expr.is_empty() {
            return Selector {
                source,
                absolute: true,
                segments: Vec::new(),
            };
        }

        // An all-dot expression of n dots ascends n - 1 superstates.
        if expr.chars().all(|c| c == '.') {
            let dots = expr.len();
            return Selector {
                source,
                absolute: false,
                segments: vec![Segment::Ascend; dots - 1],
            };
        }

        let (absolute, body) = match expr.strip_prefix('.') {
            Some(rest) => (false, rest),
            None => (true, expr),
        };

        let segments = body
            .split('.')
            .map(|token| match token {
                "" => Segment::Ascend,
                "*" => Segment::AnyChild,
                "**" => Segment::AnyDescendants,
                name => Segment::Child(name.to_string()),
            })
            .collect();

        Selector {
            source,
            absolute,
            segments,
        }
    }

    /// The original expression text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the expression is evaluated from the root rather than the
    /// invocation context.
    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    pub(crate) fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// `.` and `*` expressions are positional and are not retried over the
    /// rest of the tree when the literal walk fails.
    pub(crate) fn is_positional(&self) -> bool {
        self.source.chars().all(|c| c == '.' || c == '*')
    }

    fn is_all_wildcards(&self) -> bool {
        !self.source.is_empty() && self.source.chars().all(|c| c == '*')
    }

    /// The same walk, re-rooted: used when an absolute expression is
    /// re-evaluated from the root as a relative one.
    fn as_relative(&self) -> Selector {
        Selector {
            source: format!(".{}", self.source),
            absolute: false,
            segments: self.segments.clone(),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// The result of a successful query.
pub enum QueryMatch<O: 'static> {
    /// A literal path resolved to a single state.
    One(State<O>),
    /// A wildcard resolved to a set of states.
    Many(Vec<State<O>>),
}

impl<O> QueryMatch<O> {
    /// The single matched state, if the query was not a wildcard.
    pub fn one(self) -> Option<State<O>> {
        match self {
            QueryMatch::One(state) => Some(state),
            QueryMatch::Many(_) => None,
        }
    }

    /// All matched states.
    pub fn all(self) -> Vec<State<O>> {
        match self {
            QueryMatch::One(state) => vec![state],
            QueryMatch::Many(states) => states,
        }
    }
}

impl<O> fmt::Debug for QueryMatch<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryMatch::One(s) => f.debug_tuple("One").field(s).finish(),
            QueryMatch::Many(s) => f.debug_tuple("Many").field(s).finish(),
        }
    }
}

pub(crate) enum Outcome<O: 'static> {
    Hit(QueryMatch<O>),
    Verdict(bool),
    Miss,
}

impl<O> Outcome<O> {
    fn found(&self) -> bool {
        match self {
            Outcome::Hit(_) => true,
            Outcome::Verdict(v) => *v,
            Outcome::Miss => false,
        }
    }
}

impl<O> State<O> {
    /// Resolve a path expression to a state or set of states, evaluated
    /// first against this context, then over descendants, then ancestors,
    /// then the protostate.
    pub fn query(&self, expr: &str) -> Option<QueryMatch<O>> {
        let selector = Selector::parse(expr);
        match run(self, &selector, None, true, None, true, true) {
            Outcome::Hit(found) => Some(found),
            _ => None,
        }
    }

    /// Resolve a path expression that must name exactly one state.
    pub fn query_one(&self, expr: &str) -> Option<State<O>> {
        self.query(expr).and_then(QueryMatch::one)
    }

    /// Test whether `against` is the state (or among the states) named by
    /// the expression.
    pub fn query_against(&self, expr: &str, against: &State<O>) -> bool {
        let selector = Selector::parse(expr);
        self.test_selector(&selector, against)
    }

    /// Membership test over a precompiled selector.
    pub fn test_selector(&self, selector: &Selector, against: &State<O>) -> bool {
        run(self, selector, Some(against), true, None, true, true).found()
    }

    /// Lookup over a precompiled selector.
    pub fn resolve_selector(&self, selector: &Selector) -> Option<QueryMatch<O>> {
        match run(self, selector, None, true, None, true, true) {
            Outcome::Hit(found) => Some(found),
            _ => None,
        }
    }
}

/// Core query engine. Mirrors the precedence contract: the literal walk from
/// the context, then a breadth-first retry over descendants (skipping any
/// subtree already searched), then ancestors, then the protostate.
fn run<O>(
    ctx: &State<O>,
    selector: &Selector,
    against: Option<&State<O>>,
    descend: bool,
    skip: Option<&State<O>>,
    ascend: bool,
    via_proto: bool,
) -> Outcome<O> {
    // Exceptional forms resolve without a walk.
    if selector.source() == "." {
        return match against {
            Some(a) => Outcome::Verdict(a == ctx),
            None => Outcome::Hit(QueryMatch::One(ctx.clone())),
        };
    }
    if selector.source().is_empty() {
        let Some(root) = ctx.root() else {
            return Outcome::Miss;
        };
        return match against {
            Some(a) => Outcome::Verdict(*a == root),
            None => Outcome::Hit(QueryMatch::One(root)),
        };
    }

    // An absolute wildcard expression compared against the root passes
    // immediately.
    if let Some(a) = against {
        if selector.is_all_wildcards() && ctx.root().as_ref() == Some(a) {
            return Outcome::Verdict(true);
        }
    }

    let (descend, ascend) = if selector.is_positional() {
        (false, false)
    } else {
        (descend, ascend)
    };

    // An absolute expression re-evaluates from the root as a relative one.
    if selector.is_absolute() {
        let Some(root) = ctx.root() else {
            return Outcome::Miss;
        };
        let relative = selector.as_relative();
        return run(&root, &relative, against, descend, None, false, via_proto);
    }

    // The literal walk.
    let mut cursor = Some(ctx.clone());
    let mut failed = false;
    for segment in selector.segments() {
        let Some(at) = cursor.take() else {
            failed = true;
            break;
        };
        match segment {
            Segment::Ascend => cursor = at.superstate(),
            Segment::Child(name) => cursor = at.substate(name, true),
            Segment::AnyChild => {
                return match against {
                    Some(a) => {
                        if a.superstate().as_ref() == Some(&at) {
                            Outcome::Verdict(true)
                        } else {
                            fallback(ctx, selector, against, descend, skip, ascend, via_proto)
                        }
                    }
                    None => Outcome::Hit(QueryMatch::Many(at.substates(false, false))),
                };
            }
            Segment::AnyDescendants => {
                return match against {
                    Some(a) => {
                        if at.is_superstate_of(a) {
                            Outcome::Verdict(true)
                        } else {
                            fallback(ctx, selector, against, descend, skip, ascend, via_proto)
                        }
                    }
                    None => Outcome::Hit(QueryMatch::Many(at.substates(true, false))),
                };
            }
        }
        if cursor.is_none() {
            failed = true;
            break;
        }
    }

    if !failed {
        if let Some(found) = cursor {
            return match against {
                Some(a) => Outcome::Verdict(*a == found),
                None => Outcome::Hit(QueryMatch::One(found)),
            };
        }
    }

    fallback(ctx, selector, against, descend, skip, ascend, via_proto)
}

/// The retry sequence applied after a failed literal walk.
fn fallback<O>(
    ctx: &State<O>,
    selector: &Selector,
    against: Option<&State<O>>,
    descend: bool,
    skip: Option<&State<O>>,
    ascend: bool,
    via_proto: bool,
) -> Outcome<O> {
    // Breadth-first retry over descendants, skipping a subtree the caller
    // has already searched.
    if descend {
        let mut queue: VecDeque<State<O>> = VecDeque::new();
        queue.push_back(ctx.clone());
        while let Some(subject) = queue.pop_front() {
            for substate in subject.substates(false, true) {
                if skip == Some(&substate) {
                    continue;
                }
                let result = run(&substate, selector, against, false, None, false, false);
                if result.found() {
                    return result;
                }
                queue.push_back(substate);
            }
        }
    }

    // Retry from the superstate, marking this subtree as searched.
    if ascend {
        if let Some(superstate) = ctx.superstate() {
            let skip = if descend { Some(ctx) } else { None };
            let result = run(&superstate, selector, against, descend, skip, true, false);
            if result.found() {
                return result;
            }
        }
    }

    // Finally retry on the protostate.
    if via_proto {
        if let Some(protostate) = ctx.protostate() {
            let result = run(&protostate, selector, against, descend, skip, ascend, true);
            if result.found() {
                return result;
            }
        }
    }

    match against {
        Some(_) => Outcome::Verdict(false),
        None => Outcome::Miss,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_relative_and_absolute() {
        let rel = Selector::parse(".A.B");
        assert!(!rel.is_absolute());
        assert_eq!(
            rel.segments(),
            &[
                Segment::Child("A".to_string()),
                Segment::Child("B".to_string())
            ]
        );

        let abs = Selector::parse("A.B");
        assert!(abs.is_absolute());
        assert_eq!(abs.segments().len(), 2);
    }

    #[test]
    fn parse_leading_dots_ascend() {
        assert_eq!(Selector::parse(".").segments().len(), 0);
        assert_eq!(Selector::parse("..").segments(), &[Segment::Ascend]);
        assert_eq!(
            Selector::parse("...").segments(),
            &[Segment::Ascend, Segment::Ascend]
        );
        assert_eq!(
            Selector::parse("..Sibling").segments(),
            &[Segment::Ascend, Segment::Child("Sibling".to_string())]
        );
    }

    #[test]
    fn parse_wildcards() {
        assert_eq!(Selector::parse(".*").segments(), &[Segment::AnyChild]);
        assert_eq!(
            Selector::parse(".**").segments(),
            &[Segment::AnyDescendants]
        );
        assert_eq!(
            Selector::parse("A.*").segments(),
            &[Segment::Child("A".to_string()), Segment::AnyChild]
        );
    }

    #[test]
    fn parse_empty_is_absolute_root() {
        let sel = Selector::parse("");
        assert!(sel.is_absolute());
        assert!(sel.segments().is_empty());
    }

    #[test]
    fn positional_expressions_are_not_retried() {
        assert!(Selector::parse(".").is_positional());
        assert!(Selector::parse("..").is_positional());
        assert!(Selector::parse(".*").is_positional());
        assert!(!Selector::parse(".A").is_positional());
        assert!(!Selector::parse("A.*").is_positional());
    }
}
