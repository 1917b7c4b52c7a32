//! # binwatch-cdc-pipeline
//!
//! Turns the decoded replication stream into stored change events and
//! alerts.
//!
//! - [`scope`]: include/exclude matching, projection and masking settings
//! - [`normalizer`]: transaction buffering; emits one batch per commit
//! - [`mask`]: sensitive-column masking
//! - [`rule`]: alert rules, sliding windows and the rule engine
//! - [`pipeline`]: task wiring, backpressure, checkpoints and drain
//!
//! ```text
//! BinlogReader -> ScopeFilter -> Normalizer -> ChangeStore -> RuleEngine -> Alert
//! ```

pub mod error;
pub mod mask;
pub mod normalizer;
pub mod pipeline;
pub mod rule;
pub mod scope;

pub use error::CdcError;
pub use normalizer::Normalizer;
pub use pipeline::{CdcPipeline, CdcPipelineBuilder};
pub use rule::{RuleEngine, RuleLoader, RuleMatcher, SlidingWindow, WindowOutcome};
pub use scope::{Admitted, ScopeDecision, ScopeFilter, ScopeSettings};
