//! State management - local mirror of processor and client join values
//!
//! The store holds the last applied value of every join in both directions
//! and the latest processor clock reading.

mod store;

pub use store::JoinStateStore;
