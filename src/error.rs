//! Error types for strict dispatch.
//!
//! Most operations in this crate report failure by returning `None` or
//! `false` without mutating anything; only the strict dispatch entry points
//! surface typed errors.

use thiserror::Error;

/// Errors raised by strict method dispatch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("state '{state}' has no method '{method}'")]
    NoSuchMethod { state: String, method: String },

    #[error("machine has been destroyed")]
    MachineDestroyed,
}
