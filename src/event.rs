//! Event types and listener collections.
//!
//! Each state keeps an ordered listener collection per event type. Listeners
//! are tagged: a plain callback, or a path expression naming a state the
//! emitter should change to once the listeners have run.

use crate::state::State;
use crate::transition::Transition;
use crate::Value;
use indexmap::IndexMap;
use std::fmt;
use std::rc::Rc;

/// The event vocabulary of states and transitions.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    /// A state finished construction.
    Construct,
    /// A state's contents changed.
    Mutate,
    /// A state is being torn down.
    Destroy,
    /// The previously current state is being left.
    Depart,
    /// A state on the path up to the transition domain is being exited.
    Exit,
    /// A state on the path down from the domain is being entered.
    Enter,
    /// The transition target became current.
    Arrive,
    /// A transition began.
    Start,
    /// A transition reached its target.
    End,
    /// A transition was superseded before completion.
    Abort,
    /// Dispatch found no implementation for a method name.
    NoSuchMethod,
    /// A user-defined event channel.
    Custom(String),
}

impl EventType {
    /// The per-method channel paired with [`EventType::NoSuchMethod`].
    pub fn no_such_method(name: &str) -> EventType {
        EventType::Custom(format!("noSuchMethod:{name}"))
    }
}

/// Payload handed to every listener.
pub struct Event<O: 'static> {
    /// The event type being emitted.
    pub kind: EventType,
    /// The state in whose context the listener fires. Absent for a
    /// transition's own lifecycle events.
    pub state: Option<State<O>>,
    /// The in-flight transition, for transition-traversal events.
    pub transition: Option<Transition<O>>,
    /// Whether the emitting change bypassed guards.
    pub forced: bool,
    /// Additional arguments supplied by the emitter.
    pub args: Vec<Value>,
}

impl<O> fmt::Debug for Event<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("forced", &self.forced)
            .finish()
    }
}

/// A bound listener callback.
pub type ListenerFn<O> = Rc<dyn Fn(&Event<O>)>;

/// A registered listener.
pub enum Listener<O: 'static> {
    /// Invoke the callback.
    Call(ListenerFn<O>),
    /// After all callbacks for the emission have run, change to the state
    /// named by this path, relative to the emitting state.
    Transit(String),
}

impl<O> Clone for Listener<O> {
    fn clone(&self) -> Self {
        match self {
            Listener::Call(f) => Listener::Call(Rc::clone(f)),
            Listener::Transit(path) => Listener::Transit(path.clone()),
        }
    }
}

impl<O> fmt::Debug for Listener<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Listener::Call(_) => f.write_str("Listener::Call(..)"),
            Listener::Transit(path) => f.debug_tuple("Listener::Transit").field(path).finish(),
        }
    }
}

/// Key returned by [`ListenerList::add`], used for later removal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ListenerId(u64);

/// An ordered collection of listeners for one event type.
///
/// Listeners fire in registration order. Ids are unique within the
/// collection for its lifetime.
pub struct ListenerList<O: 'static> {
    items: IndexMap<u64, Listener<O>>,
    next_id: u64,
}

impl<O> Default for ListenerList<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O> ListenerList<O> {
    pub fn new() -> Self {
        ListenerList {
            items: IndexMap::new(),
            next_id: 0,
        }
    }

    /// Register a listener and return its removal key.
    pub fn add(&mut self, listener: Listener<O>) -> ListenerId {
        self.next_id += 1;
        let id = self.next_id;
        self.items.insert(id, listener);
        ListenerId(id)
    }

    /// Unregister a listener, returning it if it was present.
    pub fn remove(&mut self, id: ListenerId) -> Option<Listener<O>> {
        self.items.shift_remove(&id.0)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Remove all listeners, returning how many were removed.
    pub fn clear(&mut self) -> usize {
        let n = self.items.len();
        self.items.clear();
        n
    }

    /// Clone out the listeners in registration order. Emission iterates a
    /// snapshot so listeners may freely mutate the collection.
    pub(crate) fn snapshot(&self) -> Vec<Listener<O>> {
        self.items.values().cloned().collect()
    }
}

/// Invoke a snapshot of listeners against an event. Returns the pending
/// transit target, if any listener was a [`Listener::Transit`].
pub(crate) fn dispatch<O>(listeners: &[Listener<O>], event: &Event<O>) -> Option<String> {
    let mut transit = None;
    for listener in listeners {
        match listener {
            Listener::Call(f) => f(event),
            Listener::Transit(path) => transit = Some(path.clone()),
        }
    }
    transit
}
