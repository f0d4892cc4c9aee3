//! xsmq – a multi-consumer message queue over an ordered key-value store.
//!
//! Every queue is a pair of sorted sets (Ready and Leased) plus a hash per
//! message. Consumers claim messages with a compare-and-delete transaction,
//! so concurrent `receive` calls never hand out the same message twice, and
//! unacknowledged claims become visible again when their lease lapses.
//!
//! This crate exports
//!  * `core`    – registry, queues, messages and the visibility index
//!  * `store`   – the backend surface plus in-memory and Redis backends
//!  * `config`  – TOML + environment configuration
//!  * `logging` – tracing subscriber setup for binaries and tests

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod config;
pub mod core;
pub mod logging;
pub mod store;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use config::{load_config, Config};
pub use crate::core::error::QueueError;
pub use crate::core::message::{Message, MessageOverrides};
pub use crate::core::names::{MessageId, QueueName};
pub use crate::core::queue::{Queue, QueueSettings, QueueStats};
pub use crate::core::reaper::Reaper;
pub use crate::core::registry::QueueRegistry;
pub use store::{ManualClock, MemoryBackend, StorageBackend};
