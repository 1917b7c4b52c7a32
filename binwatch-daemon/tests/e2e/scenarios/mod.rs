//! E2E scenarios.

mod config_error;
mod fatal;
mod lifecycle;
