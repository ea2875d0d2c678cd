//! Protostate: a hierarchical state machine runtime with dual inheritance.
//!
//! A [`Machine`] attaches behavioral overrides to a host object (its
//! "owner"): the owner's methods change meaning as the machine moves between
//! declared states. States nest, substates inheriting behavior from their
//! superstates — and they also inherit across machines, from the analogous
//! **protostate** on a parent behavior template, so a derived owner
//! automatically inherits and can override its ancestor's state behavior.
//!
//! # Core concepts
//!
//! - **State**: a named node holding methods, events, guards, substates, and
//!   transition templates for one owner "mode"
//! - **Machine**: the per-owner controller tracking the current state and
//!   the active transition
//! - **Transition**: the transient entity representing an in-progress
//!   change, with a synchronous or explicitly suspended conclusion
//! - **Protostate**: the analogous state found through the machine's
//!   template chain; behavior is inherited from protostates before
//!   superstates
//!
//! # Example
//!
//! ```rust
//! use protostate::{ChangeOptions, Machine, MachineOptions, StateAttrs, StateExpr, Value};
//!
//! struct Lamp;
//!
//! let expr: StateExpr<Lamp> = StateExpr::new()
//!     .state(
//!         "Off",
//!         StateExpr::new()
//!             .attrs(StateAttrs::INITIAL)
//!             .method("describe", |_, _, _| Value::from("dark")),
//!     )
//!     .state(
//!         "On",
//!         StateExpr::new().method("describe", |_, _, _| Value::from("bright")),
//!     );
//!
//! let machine = Machine::new(expr, MachineOptions::default());
//! let mut lamp = Lamp;
//!
//! assert_eq!(
//!     machine.call(&mut lamp, "describe", &[]),
//!     Some(Value::from("dark"))
//! );
//!
//! machine.change("On", ChangeOptions::default());
//! assert_eq!(machine.current_state().unwrap().name(), "On");
//! assert_eq!(
//!     machine.call(&mut lamp, "describe", &[]),
//!     Some(Value::from("bright"))
//! );
//! ```

pub mod attr;
pub mod error;
pub mod event;
pub mod expr;
pub mod guard;
pub mod machine;
pub mod method;
pub mod query;
pub mod state;
pub mod transition;

pub use attr::StateAttrs;
pub use error::DispatchError;
pub use event::{Event, EventType, Listener, ListenerFn, ListenerId, ListenerList};
pub use expr::{StateExpr, TransitionExpr};
pub use guard::{Guard, GuardContext, GuardFn, GuardKind, GuardValue};
pub use machine::{ChangeOptions, ChangeTarget, Current, Machine, MachineOptions};
pub use method::{MethodContext, MethodFn};
pub use query::{QueryMatch, Segment, Selector};
pub use state::{State, WeakState};
pub use transition::{ActionFn, Transition};

/// Payload type for method arguments, results, and state data.
pub type Value = serde_json::Value;
