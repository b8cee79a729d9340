//! Server side of the Renraku realtime messaging transport.
//!
//! One WebSocket endpoint carries chat, job-room membership, presence and
//! typing indicators for the marketplace. Storage, payments and the REST API
//! live in other services; this crate only speaks the envelope protocol and
//! hands messages to a persistence hook fire-and-forget.

pub mod config;
pub mod error;
pub mod handler;
pub mod http;
pub mod persistence;
pub mod registry;
pub mod router;
pub mod runner;
mod signal;
pub mod state;

pub use runner::{app, run_server};
