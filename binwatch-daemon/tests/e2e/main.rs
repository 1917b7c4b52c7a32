//! End-to-end tests for binwatch-daemon.
//!
//! Each scenario assembles a real [`Orchestrator`] (store, pipeline,
//! notifier, query API) against a scripted replication source and drives
//! it through `run_until`.
//!
//! - `helpers/`: config builder, binlog session factories, polling
//! - `scenarios/`: lifecycle, fatal-error handling, config rejection
//!
//! ```bash
//! cargo test -p binwatch-daemon --test e2e
//! ```
//!
//! [`Orchestrator`]: binwatch_daemon::Orchestrator

mod helpers;
mod scenarios;
