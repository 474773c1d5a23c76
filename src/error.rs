//! Error types for the CIP client
//!
//! `CipError` is what callers of the public API see. Connection-level faults
//! never show up here: they are absorbed by the reconnect loop (see
//! [`crate::connection::LinkError`]).

use thiserror::Error;

use crate::join::SignalKind;

/// Errors reported synchronously by [`crate::CipClient`] calls
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CipError {
    /// Signal kind string was not one of `d`, `a`, `s`
    #[error("'{0}' is not a valid signal type")]
    InvalidSignalKind(String),

    /// Direction string was not one of `in`, `out`
    #[error("'{0}' is not a valid signal direction")]
    InvalidDirection(String),

    /// Textual value could not be parsed for the given kind
    #[error("'{value}' is not a valid {kind} value")]
    InvalidValue { kind: SignalKind, value: String },

    /// Value type does not match the requested signal kind
    #[error("cannot set {expected} join with a {actual} value")]
    KindMismatch {
        expected: SignalKind,
        actual: SignalKind,
    },

    /// Join number outside `1..=max` for its kind
    #[error("{kind} join {join} is out of range (1-{max})")]
    JoinOutOfRange {
        kind: SignalKind,
        join: u16,
        max: u16,
    },

    /// Serial text longer than the configured limit
    #[error("serial value is {len} bytes, limit is {max}")]
    SerialTooLong { len: usize, max: usize },

    /// Serial text contains non-ASCII characters
    #[error("serial value must be ASCII")]
    SerialNotAscii,

    /// Operation needs an active connection
    #[error("not currently connected to the control processor")]
    NotConnected,

    /// `start()` was called outside of a Tokio runtime
    #[error("no Tokio runtime available to run the client")]
    NoRuntime,
}
