//! Distributed entity store for volplugin.
//!
//! Typed records (global configuration, policies and their revisions,
//! volumes, runtime options, use locks) are persisted in a coordination
//! keyspace under one prefix. Two keyspace families are supported behind
//! [`Backend`]: a compare-and-swap keyspace with TTL'd keys and a session
//! keyspace with native session-bound locks.
mod backend;
mod config;
pub mod constants;
mod dump;
mod entity;
mod errors;
mod store;

pub use backend::*;
pub use config::*;
pub use dump::*;
pub use entity::*;
pub use errors::*;
pub use store::*;
