//! binwatch daemon library.
//!
//! The binary in `main.rs` is a thin wrapper; the modules are public so
//! integration tests can assemble and drive a daemon in-process.

pub mod api;
pub mod cli;
pub mod health;
pub mod logging;
pub mod metrics_server;
pub mod orchestrator;
pub mod pid;

pub use orchestrator::{ExitReason, Orchestrator};
