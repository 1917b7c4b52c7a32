//! # binwatch-notifier
//!
//! Delivers alerts raised by the rule engine.
//!
//! ```text
//! alerts (mpsc) -> Suppressor -> Dispatcher -> webhook / email / log
//!                                     |
//!                                     +-> alert_deliveries (ChangeStore)
//! ```
//!
//! Identical (rule id, key) alerts inside the suppression window are
//! recorded as `suppressed` and not sent. Transient channel failures are
//! retried with exponential backoff; when attempts run out the alert is
//! recorded as `failed` and stays queryable.

pub mod channel;
pub mod dispatcher;
pub mod email;
pub mod error;
pub mod log_channel;
pub mod notifier;
pub mod suppress;
pub mod webhook;

pub use channel::{NotificationChannel, build_channel, render_body, render_subject};
pub use dispatcher::{ChannelOutcome, DeliveryResult, Dispatcher, RetryPolicy};
pub use email::EmailChannel;
pub use error::{ChannelError, NotifierError};
pub use log_channel::LogChannel;
pub use notifier::{DEFAULT_DRAIN_TIMEOUT, Notifier, NotifierBuilder, NotifierStats};
pub use suppress::{Suppressor, Verdict};
pub use webhook::WebhookChannel;
