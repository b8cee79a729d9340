//! Shared protocol layer for the Renraku realtime messaging transport.
//!
//! This crate holds everything both sides of the wire agree on: the typed
//! message envelope, identifier newtypes, clock abstraction, and logging setup.

pub mod envelope;
pub mod ids;
pub mod logger;
pub mod time;
