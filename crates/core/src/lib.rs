//! binwatch-core: types, configuration, errors and plugin traits shared by
//! every binwatch crate.
//!
//! Nothing here talks to the network or the disk except configuration
//! loading; the reader, store, pipeline and notifier crates build on these
//! definitions.

pub mod config;
pub mod ddl;
pub mod error;
pub mod event;
pub mod metrics;
pub mod pipeline;
pub mod plugin;
pub mod rule;
pub mod types;

// error
pub use error::{
    BinwatchError, ConfigError, NotifyError, ParseError, PipelineError, PluginError, SourceError,
    StorageError,
};

// config
pub use config::BinwatchConfig;

// stream records
pub use event::{StreamRecord, TransactionBatch};

// health / plugins
pub use pipeline::{BoxFuture, HealthStatus};
pub use plugin::{
    DynPlugin, Plugin, PluginHealth, PluginInfo, PluginRegistry, PluginState, PluginType,
};

// rules
pub use rule::AlertRule;

// domain types
pub use types::{
    Alert, ChangeEvent, Checkpoint, DeliveryStatus, Operation, RawMutation, RowImage, Severity,
    StreamPosition,
};
