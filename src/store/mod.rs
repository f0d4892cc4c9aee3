//! Storage backend abstraction.
//!
//! The queue engine keeps no authoritative state of its own. Everything lives
//! in an ordered key-value store that offers hashes, sets, sorted sets, a
//! shared clock and atomic multi-command execution. This module defines that
//! primitive surface:
//!
//! - [`StorageBackend`]: reads plus [`StorageBackend::exec`] for atomic writes
//! - [`Transaction`]: guard commands followed by body commands
//! - [`TxOutcome`]: whether the body ran
//!
//! Two implementations ship with the crate: [`MemoryBackend`] (in-process) and,
//! behind the `redis` feature, `RedisBackend`.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::{ManualClock, MemoryBackend};
#[cfg(feature = "redis")]
pub use self::redis::RedisBackend;

/// Milliseconds on the backend's shared clock.
pub type Timestamp = i64;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// A single write primitive. Every command produces one integer reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Set hash fields; replies with the number of fields that were new.
    HSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    /// Increment an integer hash field; replies with the new value.
    HIncrBy {
        key: String,
        field: String,
        delta: i64,
    },
    /// Create a hash only if the key is absent; replies 1 if it was created.
    HCreate {
        key: String,
        fields: Vec<(String, String)>,
    },
    /// Set fields on a hash only if it already exists; replies 1 if it did.
    HUpdate {
        key: String,
        fields: Vec<(String, String)>,
    },
    /// Delete a key of any type; replies 1 if it existed.
    Del { key: String },
    /// Insert or rescore a sorted-set member; replies 1 if it was added.
    ZAdd {
        key: String,
        member: String,
        score: Timestamp,
    },
    /// Remove a sorted-set member; replies 1 if it was present.
    ZRem { key: String, member: String },
    /// Add a set member; replies 1 if it was added.
    SAdd { key: String, member: String },
}

/// An atomic unit of work.
///
/// Guards run first. When the sum of their replies is zero the body is
/// skipped and the transaction reports [`TxOutcome::Aborted`]. Only commands
/// that change nothing when they reply zero may be used as guards
/// ([`Command::ZRem`], [`Command::SAdd`], [`Command::Del`],
/// [`Command::HCreate`], [`Command::HUpdate`]), so an aborted
/// transaction leaves the store untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    guards: Vec<Command>,
    body: Vec<Command>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a guard command. Panics in debug builds on a non-idempotent guard.
    pub fn guard(mut self, command: Command) -> Self {
        debug_assert!(
            matches!(
                command,
                Command::ZRem { .. }
                    | Command::SAdd { .. }
                    | Command::Del { .. }
                    | Command::HCreate { .. }
                    | Command::HUpdate { .. }
            ),
            "guard must be a no-op when it replies zero: {command:?}"
        );
        self.guards.push(command);
        self
    }

    pub fn then(mut self, command: Command) -> Self {
        self.body.push(command);
        self
    }

    pub fn then_all<I: IntoIterator<Item = Command>>(mut self, commands: I) -> Self {
        self.body.extend(commands);
        self
    }

    pub fn guards(&self) -> &[Command] {
        &self.guards
    }

    pub fn body(&self) -> &[Command] {
        &self.body
    }

    pub fn is_guarded(&self) -> bool {
        !self.guards.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    /// Replies for the guards followed by the body, in order.
    Applied(Vec<i64>),
    /// The guards affected nothing; the body did not run.
    Aborted,
}

impl TxOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TxOutcome::Applied(_))
    }
}

/// Primitive surface of the ordered key-value store.
///
/// Reads are individually consistent snapshots. Writes go through
/// [`StorageBackend::exec`], which must apply a [`Transaction`] atomically
/// with respect to every other call on any client.
#[async_trait]
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Current time on the shared clock.
    async fn now(&self) -> Result<Timestamp, BackendError>;

    async fn exists(&self, key: &str) -> Result<bool, BackendError>;

    /// All fields of a hash; empty when the key is absent.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, BackendError>;

    /// Members with `score <= max`, ascending by `(score, member)`, at most
    /// `limit` of them (all when `None`).
    async fn zrange_by_score(
        &self,
        key: &str,
        max: Timestamp,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Timestamp)>, BackendError>;

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<Timestamp>, BackendError>;

    async fn zcard(&self, key: &str) -> Result<u64, BackendError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, BackendError>;

    async fn exec(&self, tx: Transaction) -> Result<TxOutcome, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_keeps_guards_and_body_apart() {
        let tx = Transaction::new()
            .guard(Command::ZRem {
                key: "ready".into(),
                member: "A".into(),
            })
            .then(Command::ZAdd {
                key: "leased".into(),
                member: "A".into(),
                score: 10,
            });

        assert!(tx.is_guarded());
        assert_eq!(tx.guards().len(), 1);
        assert_eq!(tx.body().len(), 1);
        assert!(!Transaction::new().is_guarded());
    }
}
