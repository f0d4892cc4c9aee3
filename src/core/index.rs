//! Per-queue visibility index.
//!
//! Two sorted sets drive scheduling:
//!
//! - **Ready**: score is the time a message becomes deliverable.
//! - **Leased**: score is the time an outstanding claim lapses.
//!
//! A live message sits in exactly one of them. Moving a message from Ready to
//! Leased (a *claim*) is a compare-and-delete: the removal from Ready is the
//! guard of the claiming transaction, so when two consumers race for the same
//! head only the one whose removal actually hit gets to write the lease. The
//! loser re-reads the head and tries again, up to a fixed number of attempts.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::core::error::QueueError;
use crate::core::keys::KeySpace;
use crate::core::names::{MessageId, QueueName};
use crate::store::{BackendError, Command, StorageBackend, Timestamp, Transaction};

/// Where a message currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Ready(Timestamp),
    Leased(Timestamp),
}

/// What to do with the head of Ready once it has been inspected.
#[derive(Debug)]
pub enum Candidate<T> {
    /// Take it: the commands run in the same transaction as the removal.
    Claim { commands: Vec<Command>, output: T },
    /// Drop it without delivering (expired, or its record is gone).
    Discard { commands: Vec<Command> },
}

/// Decides, per candidate, what a successful claim writes.
///
/// `receive` leases the message; `pop` deletes it outright.
#[async_trait]
pub trait ClaimTerms: Send + Sync {
    type Output: Send;

    async fn prepare(
        &self,
        id: &MessageId,
        now: Timestamp,
    ) -> Result<Candidate<Self::Output>, QueueError>;
}

#[derive(Debug, Clone)]
pub struct VisibilityIndex {
    backend: Arc<dyn StorageBackend>,
    ready: String,
    leased: String,
}

impl VisibilityIndex {
    pub fn new(backend: Arc<dyn StorageBackend>, keys: &KeySpace, queue: &QueueName) -> Self {
        Self {
            backend,
            ready: keys.ready(queue),
            leased: keys.leased(queue),
        }
    }

    pub fn ready_key(&self) -> &str {
        &self.ready
    }

    pub fn leased_key(&self) -> &str {
        &self.leased
    }

    pub fn add_ready(&self, id: &MessageId, score: Timestamp) -> Command {
        Command::ZAdd {
            key: self.ready.clone(),
            member: id.to_string(),
            score,
        }
    }

    pub fn add_leased(&self, id: &MessageId, until: Timestamp) -> Command {
        Command::ZAdd {
            key: self.leased.clone(),
            member: id.to_string(),
            score: until,
        }
    }

    pub fn remove_ready(&self, id: &MessageId) -> Command {
        Command::ZRem {
            key: self.ready.clone(),
            member: id.to_string(),
        }
    }

    pub fn remove_leased(&self, id: &MessageId) -> Command {
        Command::ZRem {
            key: self.leased.clone(),
            member: id.to_string(),
        }
    }

    pub async fn insert_ready(&self, id: &MessageId, score: Timestamp) -> Result<(), QueueError> {
        self.backend
            .exec(Transaction::new().then(self.add_ready(id, score)))
            .await?;
        Ok(())
    }

    /// Removes `id` from Leased; `false` if it was not leased.
    pub async fn release(&self, id: &MessageId) -> Result<bool, QueueError> {
        let outcome = self
            .backend
            .exec(Transaction::new().guard(self.remove_leased(id)))
            .await?;
        Ok(outcome.is_applied())
    }

    /// Ready entries with `score <= now`, oldest first.
    pub async fn ready_until(
        &self,
        now: Timestamp,
        limit: Option<usize>,
    ) -> Result<Vec<(MessageId, Timestamp)>, QueueError> {
        self.range(&self.ready, now, limit).await
    }

    /// Leased entries whose lease lapsed at or before `now`.
    pub async fn expired_leases(
        &self,
        now: Timestamp,
        limit: Option<usize>,
    ) -> Result<Vec<(MessageId, Timestamp)>, QueueError> {
        self.range(&self.leased, now, limit).await
    }

    async fn range(
        &self,
        key: &str,
        max: Timestamp,
        limit: Option<usize>,
    ) -> Result<Vec<(MessageId, Timestamp)>, QueueError> {
        let members = self.backend.zrange_by_score(key, max, limit).await?;
        members
            .into_iter()
            .map(|(member, score)| {
                MessageId::new(&member)
                    .map(|id| (id, score))
                    .map_err(|e| {
                        QueueError::from(BackendError::Corrupt {
                            key: key.to_string(),
                            reason: e.to_string(),
                        })
                    })
            })
            .collect()
    }

    pub async fn locate(&self, id: &MessageId) -> Result<Option<Slot>, QueueError> {
        if let Some(score) = self.backend.zscore(&self.ready, id.as_str()).await? {
            return Ok(Some(Slot::Ready(score)));
        }
        Ok(self
            .backend
            .zscore(&self.leased, id.as_str())
            .await?
            .map(Slot::Leased))
    }

    /// `(ready, leased)` sizes.
    pub async fn counts(&self) -> Result<(u64, u64), QueueError> {
        let ready = self.backend.zcard(&self.ready).await?;
        let leased = self.backend.zcard(&self.leased).await?;
        Ok((ready, leased))
    }

    /// Claims the earliest ready message.
    ///
    /// Each round reads the head of Ready (`score <= now`, ties by id), asks
    /// `terms` what claiming it means, then runs the claim guarded by the
    /// removal from Ready. A guard that removes nothing means another consumer
    /// won the head; that costs one of `attempts` and the round starts over.
    /// Running out of attempts, or out of ready messages, yields `None`.
    #[tracing::instrument(level = "trace", skip(self, terms), fields(ready = %self.ready))]
    pub async fn claim_earliest<T: ClaimTerms>(
        &self,
        now: Timestamp,
        attempts: usize,
        terms: &T,
    ) -> Result<Option<(MessageId, T::Output)>, QueueError> {
        let mut lost = 0;
        loop {
            let Some((id, _)) = self.ready_until(now, Some(1)).await?.into_iter().next() else {
                return Ok(None);
            };

            match terms.prepare(&id, now).await? {
                Candidate::Claim { commands, output } => {
                    let tx = Transaction::new()
                        .guard(self.remove_ready(&id))
                        .then_all(commands);
                    if self.backend.exec(tx).await?.is_applied() {
                        trace!(%id, "claimed");
                        return Ok(Some((id, output)));
                    }
                    lost += 1;
                    debug!(%id, lost, "lost claim race");
                    if lost >= attempts {
                        debug!("claim attempts exhausted; reporting nothing ready");
                        return Ok(None);
                    }
                }
                Candidate::Discard { commands } => {
                    let tx = Transaction::new()
                        .guard(self.remove_ready(&id))
                        .then_all(commands);
                    if self.backend.exec(tx).await?.is_applied() {
                        debug!(%id, "discarded undeliverable message");
                    }
                }
            }
        }
    }

    /// Returns lapsed leases to Ready with score `now`.
    ///
    /// Each lease moves in its own transaction guarded by the removal from
    /// Leased, so an acknowledge racing the reaper either wins outright or
    /// finds the message back in Ready. `on_requeue` adds commands to each of
    /// those transactions (the message record's hidden flag).
    pub async fn requeue_expired<F>(
        &self,
        now: Timestamp,
        batch: usize,
        on_requeue: F,
    ) -> Result<usize, QueueError>
    where
        F: Fn(&MessageId) -> Vec<Command> + Send + Sync,
    {
        let batch = batch.max(1);
        let mut requeued = 0;
        loop {
            let expired = self.expired_leases(now, Some(batch)).await?;
            let fetched = expired.len();
            let mut moved = 0;
            for (id, lapsed_at) in expired {
                let tx = Transaction::new()
                    .guard(self.remove_leased(&id))
                    .then(self.add_ready(&id, now))
                    .then_all(on_requeue(&id));
                if self.backend.exec(tx).await?.is_applied() {
                    trace!(%id, lapsed_at, "lease lapsed; message ready again");
                    moved += 1;
                }
            }
            requeued += moved;
            if fetched < batch || moved == 0 {
                break;
            }
        }
        if requeued > 0 {
            debug!(leased = %self.leased, requeued, "requeued expired leases");
        }
        Ok(requeued)
    }
}
