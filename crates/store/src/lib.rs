//! # binwatch-store
//!
//! Durable state for binwatch.
//!
//! - [`ChangeStore`]: append-only SQLite log of change events, alerts and
//!   delivery attempts, plus the checkpoint slot committed in the same
//!   transaction as each batch
//! - [`FilePositionStore`]: standalone JSON checkpoint slot
//! - [`PositionStore`]: the slot abstraction both implement

mod alerts;
pub mod error;
pub mod position;
pub mod query;
mod schema;
mod store;

pub use error::StoreError;
pub use position::{FilePositionStore, PositionStore};
pub use query::{
    AlertQuery, ChangeQuery, DEFAULT_LIMIT, DailyCount, DeliveryRecord, StoreStats, TableStats,
    TableSummary,
};
pub use schema::SCHEMA_VERSION;
pub use store::{ChangeStore, pk_text};
