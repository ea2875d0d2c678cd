//! In-flight transitions.
//!
//! A transition is the transient, state-like entity a machine adopts while
//! changing between two of its proper states. It acts within the domain of
//! the least common ancestor of its origin and target: while underway it is
//! attached to successive states along the traversal, inheriting method
//! resolution from its attachment point.
//!
//! A transition with an action is the runtime's one suspension point: after
//! `Start` the action holds the handle and concludes it by calling
//! [`Transition::end`] — or it is cancelled implicitly when a newer change
//! supersedes it, chaining it as the newcomer's `source` until that one
//! completes and unwinds the chain.

use crate::event::{self, Event, EventType, Listener, ListenerId, ListenerList};
use crate::expr::TransitionExpr;
use crate::machine::{Machine, MachineCore};
use crate::method::{MethodSlot, ResolvedMethod};
use crate::state::State;
use crate::Value;
use indexmap::IndexMap;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

/// A transition action: performs the work of the change and is responsible
/// for eventually concluding the transition it receives.
pub type ActionFn<O> = Rc<dyn Fn(&Transition<O>, &[Value])>;

pub(crate) enum TransitionSource<O: 'static> {
    State(State<O>),
    Transition(Transition<O>),
}

impl<O> Clone for TransitionSource<O> {
    fn clone(&self) -> Self {
        match self {
            TransitionSource::State(s) => TransitionSource::State(s.clone()),
            TransitionSource::Transition(t) => TransitionSource::Transition(t.clone()),
        }
    }
}

impl<O> TransitionSource<O> {
    /// The tree position the source occupies: a state is its own position,
    /// a superseded transition is wherever its attachment had advanced to.
    pub(crate) fn position(&self) -> State<O> {
        match self {
            TransitionSource::State(s) => s.clone(),
            TransitionSource::Transition(t) => t.attachment(),
        }
    }
}

pub(crate) struct TransitionCore<O: 'static> {
    machine: Weak<MachineCore<O>>,
    target: State<O>,
    origin: State<O>,
    source: RefCell<Option<TransitionSource<O>>>,
    attachment: RefCell<State<O>>,
    expr: Rc<TransitionExpr<O>>,
    events: RefCell<IndexMap<EventType, ListenerList<O>>>,
    aborted: Cell<bool>,
    concluded: Cell<bool>,
    forced: bool,
    success: RefCell<Option<Rc<dyn Fn(&Machine<O>)>>>,
}

/// Handle to an in-flight (or superseded) transition.
pub struct Transition<O: 'static> {
    pub(crate) core: Rc<TransitionCore<O>>,
}

impl<O> Clone for Transition<O> {
    fn clone(&self) -> Self {
        Transition {
            core: Rc::clone(&self.core),
        }
    }
}

impl<O> PartialEq for Transition<O> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }
}

impl<O> Eq for Transition<O> {}

impl<O> fmt::Debug for Transition<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("origin", &self.core.origin)
            .field("target", &self.core.target)
            .field("aborted", &self.core.aborted.get())
            .finish()
    }
}

impl<O> Transition<O> {
    pub(crate) fn new(
        machine: &Machine<O>,
        target: State<O>,
        source: TransitionSource<O>,
        expr: Rc<TransitionExpr<O>>,
        success: Option<Rc<dyn Fn(&Machine<O>)>>,
        forced: bool,
    ) -> Transition<O> {
        let origin = match &source {
            TransitionSource::State(s) => s.clone(),
            TransitionSource::Transition(t) => t.origin(),
        };
        let attachment = source.position();

        let mut events = IndexMap::new();
        for (kind, listeners) in &expr.events {
            let list: &mut ListenerList<O> = events.entry(kind.clone()).or_default();
            for listener in listeners {
                list.add(listener.clone());
            }
        }

        let transition = Transition {
            core: Rc::new(TransitionCore {
                machine: machine.downgrade(),
                target,
                origin,
                source: RefCell::new(Some(source)),
                attachment: RefCell::new(attachment),
                expr,
                events: RefCell::new(events),
                aborted: Cell::new(false),
                concluded: Cell::new(false),
                forced,
                success: RefCell::new(success),
            }),
        };
        transition.emit_own(&EventType::Construct, Vec::new());
        transition
    }

    /// The machine this transition belongs to.
    pub fn machine(&self) -> Option<Machine<O>> {
        self.core.machine.upgrade().map(Machine::from_core)
    }

    /// The intended destination state.
    pub fn target(&self) -> State<O> {
        self.core.target.clone()
    }

    /// The machine's most recent non-transition state.
    pub fn origin(&self) -> State<O> {
        self.core.origin.clone()
    }

    /// The state or superseded transition that immediately preceded this
    /// one.
    pub(crate) fn source(&self) -> Option<TransitionSource<O>> {
        self.core.source.borrow().clone()
    }

    /// The state this transition preceded from, if its source was a state.
    pub fn source_state(&self) -> Option<State<O>> {
        match self.source()? {
            TransitionSource::State(s) => Some(s),
            TransitionSource::Transition(_) => None,
        }
    }

    /// The transition this one superseded, if any. Superseded transitions
    /// chain through their sources and are destroyed together once the
    /// survivor completes.
    pub fn superseded(&self) -> Option<Transition<O>> {
        match self.source()? {
            TransitionSource::State(_) => None,
            TransitionSource::Transition(t) => Some(t),
        }
    }

    /// The state the traversal is presently attached to.
    pub fn attachment(&self) -> State<O> {
        self.core.attachment.borrow().clone()
    }

    pub(crate) fn attach_to(&self, state: State<O>) {
        *self.core.attachment.borrow_mut() = state;
    }

    /// Whether this transition was superseded before completion.
    pub fn is_aborted(&self) -> bool {
        self.core.aborted.get()
    }

    /// Whether the change that created this transition bypassed guards.
    pub fn forced(&self) -> bool {
        self.core.forced
    }

    /// The number of superseded transitions chained beneath this one.
    pub fn depth(&self) -> usize {
        let mut n = 0;
        let mut cursor = self.superseded();
        while let Some(t) = cursor {
            n += 1;
            cursor = t.superseded();
        }
        n
    }

    /// Bind a listener for this transition's own events.
    pub fn on<F>(&self, kind: EventType, f: F) -> ListenerId
    where
        F: Fn(&Event<O>) + 'static,
    {
        self.core
            .events
            .borrow_mut()
            .entry(kind)
            .or_default()
            .add(Listener::Call(Rc::new(f)))
    }

    /// Resolve a method while this transition is current: its own template
    /// methods first, then the attachment chain.
    pub(crate) fn resolve_method(&self, name: &str) -> Option<ResolvedMethod<O>> {
        if let Some(f) = self.core.expr.methods.get(name) {
            return Some(ResolvedMethod {
                slot: MethodSlot::Fn(Rc::clone(f)),
                context: self.attachment(),
                original: false,
            });
        }
        self.attachment().resolve_method(name, true, true)
    }

    /// Begin the transition. With an action supplied, the transition
    /// suspends and the action is responsible for concluding it; otherwise
    /// it concludes immediately.
    pub(crate) fn start(&self, args: &[Value]) {
        self.emit_own(&EventType::Start, args.to_vec());
        match self.core.expr.action.clone() {
            Some(action) => action(self, args),
            None => {
                self.end(args);
            }
        }
    }

    /// Conclude the transition: unless it has been aborted, the enter and
    /// arrive sequence runs and the machine's current state becomes the
    /// target. The transition, and any aborted predecessors chained through
    /// its source, are then retired.
    pub fn end(&self, args: &[Value]) -> Option<State<O>> {
        if !self.core.aborted.get() && !self.core.concluded.get() {
            self.core.concluded.set(true);
            self.emit_own(&EventType::End, args.to_vec());
            let machine = self.machine()?;
            machine.finish_transition(self);
        }
        Some(self.core.target.clone())
    }

    /// Mark this transition as superseded. It is retained only as the
    /// `source` of whatever change displaced it, and is destroyed when that
    /// one completes.
    pub fn abort(&self) {
        if self.core.aborted.get() {
            return;
        }
        self.core.aborted.set(true);
        *self.core.success.borrow_mut() = None;
        tracing::debug!(
            from = %self.core.origin.path(),
            to = %self.core.target.path(),
            "transition aborted"
        );
        self.emit_own(&EventType::Abort, Vec::new());
    }

    pub(crate) fn take_success(&self) -> Option<Rc<dyn Fn(&Machine<O>)>> {
        self.core.success.borrow_mut().take()
    }

    /// Release this transition's references, and those of any aborted
    /// predecessor chain.
    pub(crate) fn retire(&self) {
        let source = self.core.source.borrow_mut().take();
        if let Some(TransitionSource::Transition(previous)) = source {
            previous.retire();
        }
        self.core.events.borrow_mut().clear();
    }

    /// Emit one of the transition's own lifecycle events. These do not
    /// propagate into the state tree.
    pub(crate) fn emit_own(&self, kind: &EventType, args: Vec<Value>) {
        let snapshot = self
            .core
            .events
            .borrow()
            .get(kind)
            .map(ListenerList::snapshot);
        if let Some(listeners) = snapshot {
            let ev = Event {
                kind: kind.clone(),
                state: None,
                transition: Some(self.clone()),
                forced: self.core.forced,
                args,
            };
            if let Some(target) = event::dispatch(&listeners, &ev) {
                if let Some(machine) = self.machine() {
                    let _ = machine.change(target.as_str(), Default::default());
                }
            }
        }
    }
}
