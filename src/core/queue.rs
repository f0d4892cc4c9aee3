//! Queue handle: post, peek, receive, pop, acknowledge, move and find.
//!
//! A [`Queue`] is a cheap, cloneable handle. All state lives in the backend;
//! the handle only caches the queue's attributes, which [`Queue::refresh`]
//! re-reads.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::error::QueueError;
use crate::core::index::{Candidate, ClaimTerms, Slot, VisibilityIndex};
use crate::core::message::{flag, Message, MessageOverrides, MessageRecord};
use crate::core::names::{MessageId, QueueName};
use crate::core::Context;
use crate::store::{BackendError, Command, Timestamp, Transaction, TxOutcome};

/// Ready entries `peek` reads in its first pass.
const PEEK_WINDOW: usize = 16;
/// Fresh ids a post draws before reporting a collision.
const POST_ATTEMPTS: usize = 8;

const F_HTIMEOUT: &str = "htimeout";
const F_ETIMEOUT: &str = "etimeout";
const F_PLIMIT: &str = "plimit";
const F_CREATED: &str = "created";
const F_MODIFIED: &str = "modified";
const F_RECEIVED: &str = "received";
const F_SENT: &str = "sent";

/// User-tunable queue settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Default lease length in seconds.
    pub htimeout: i64,
    /// Message lifetime in seconds; `-1` never expires.
    pub etimeout: i64,
    /// Maximum live messages; `-1` is unlimited.
    pub plimit: i64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            htimeout: 30,
            etimeout: -1,
            plimit: -1,
        }
    }
}

impl QueueSettings {
    /// Non-positive `etimeout` and `plimit` both mean "off".
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.htimeout < 0 {
            return Err(QueueError::invalid(
                "htimeout",
                format!("must not be negative, got {}", self.htimeout),
            ));
        }
        Ok(())
    }
}

/// Settings plus bookkeeping, as stored in the queue's config hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueAttributes {
    pub settings: QueueSettings,
    pub created: Timestamp,
    pub modified: Timestamp,
    /// Messages posted or moved in.
    pub received: i64,
    /// Messages acknowledged or popped.
    pub sent: i64,
}

impl QueueAttributes {
    pub(crate) fn fresh(settings: QueueSettings, now: Timestamp) -> Self {
        Self {
            settings,
            created: now,
            modified: now,
            received: 0,
            sent: 0,
        }
    }

    pub(crate) fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (F_HTIMEOUT.to_string(), self.settings.htimeout.to_string()),
            (F_ETIMEOUT.to_string(), self.settings.etimeout.to_string()),
            (F_PLIMIT.to_string(), self.settings.plimit.to_string()),
            (F_CREATED.to_string(), self.created.to_string()),
            (F_MODIFIED.to_string(), self.modified.to_string()),
            (F_RECEIVED.to_string(), self.received.to_string()),
            (F_SENT.to_string(), self.sent.to_string()),
        ]
    }

    pub(crate) fn from_fields(
        key: &str,
        fields: &HashMap<String, String>,
    ) -> Result<Option<Self>, BackendError> {
        if fields.is_empty() {
            return Ok(None);
        }
        let int = |name: &str, default: Option<i64>| match (fields.get(name), default) {
            (Some(raw), _) => raw.parse::<i64>().map_err(|_| BackendError::Corrupt {
                key: key.to_string(),
                reason: format!("field `{name}` is not an integer: {raw}"),
            }),
            (None, Some(default)) => Ok(default),
            (None, None) => Err(BackendError::Corrupt {
                key: key.to_string(),
                reason: format!("missing field `{name}`"),
            }),
        };
        let defaults = QueueSettings::default();

        Ok(Some(Self {
            settings: QueueSettings {
                htimeout: int(F_HTIMEOUT, Some(defaults.htimeout))?,
                etimeout: int(F_ETIMEOUT, Some(defaults.etimeout))?,
                plimit: int(F_PLIMIT, Some(defaults.plimit))?,
            },
            created: int(F_CREATED, None)?,
            modified: int(F_MODIFIED, None)?,
            received: int(F_RECEIVED, Some(0))?,
            sent: int(F_SENT, Some(0))?,
        }))
    }
}

/// Point-in-time view of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: u64,
    pub leased: u64,
    pub received: i64,
    pub sent: i64,
}

impl QueueStats {
    /// Undeleted messages: ready plus leased.
    pub fn live(&self) -> u64 {
        self.ready + self.leased
    }
}

#[derive(Debug, Clone)]
pub struct Queue {
    ctx: Arc<Context>,
    name: QueueName,
    index: VisibilityIndex,
    attrs: Arc<RwLock<QueueAttributes>>,
}

impl Queue {
    pub(crate) fn new(ctx: Arc<Context>, name: QueueName, attrs: QueueAttributes) -> Self {
        let index = VisibilityIndex::new(ctx.backend.clone(), &ctx.keys, &name);
        Self {
            ctx,
            name,
            index,
            attrs: Arc::new(RwLock::new(attrs)),
        }
    }

    /// Loads the handle for `name`, or `None` if the queue does not exist.
    pub(crate) async fn open(
        ctx: &Arc<Context>,
        name: &QueueName,
    ) -> Result<Option<Self>, QueueError> {
        let key = ctx.keys.queue_config(name);
        let fields = ctx.backend.hgetall(&key).await?;
        Ok(QueueAttributes::from_fields(&key, &fields)?
            .map(|attrs| Self::new(ctx.clone(), name.clone(), attrs)))
    }

    /// Handle for another queue sharing this one's collaborators.
    pub(crate) async fn sibling(&self, name: &QueueName) -> Result<Queue, QueueError> {
        Self::open(&self.ctx, name)
            .await?
            .ok_or_else(|| QueueError::QueueNotFound(name.to_string()))
    }

    pub(crate) fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn name(&self) -> &QueueName {
        &self.name
    }

    pub fn index(&self) -> &VisibilityIndex {
        &self.index
    }

    /// Cached attributes as of the last load or refresh.
    pub fn attributes(&self) -> QueueAttributes {
        self.attrs.read().clone()
    }

    pub fn settings(&self) -> QueueSettings {
        self.attrs.read().settings
    }

    fn config_key(&self) -> String {
        self.ctx.keys.queue_config(&self.name)
    }

    fn bump(&self, field: &str) -> Command {
        Command::HIncrBy {
            key: self.config_key(),
            field: field.to_string(),
            delta: 1,
        }
    }

    /// Re-reads the attributes from the backend.
    pub async fn refresh(&self) -> Result<QueueAttributes, QueueError> {
        let key = self.config_key();
        let fields = self.ctx.backend.hgetall(&key).await?;
        let attrs = QueueAttributes::from_fields(&key, &fields)?
            .ok_or_else(|| QueueError::QueueNotFound(self.name.to_string()))?;
        *self.attrs.write() = attrs.clone();
        Ok(attrs)
    }

    /// Rewrites the queue's settings and bumps `modified`.
    pub async fn configure(&self, settings: QueueSettings) -> Result<(), QueueError> {
        settings.validate()?;
        let now = self.ctx.backend.now().await?;
        let tx = Transaction::new().guard(Command::HUpdate {
            key: self.config_key(),
            fields: vec![
                (F_HTIMEOUT.to_string(), settings.htimeout.to_string()),
                (F_ETIMEOUT.to_string(), settings.etimeout.to_string()),
                (F_PLIMIT.to_string(), settings.plimit.to_string()),
                (F_MODIFIED.to_string(), now.to_string()),
            ],
        });
        if !self.ctx.backend.exec(tx).await?.is_applied() {
            return Err(QueueError::QueueNotFound(self.name.to_string()));
        }
        let mut attrs = self.attrs.write();
        attrs.settings = settings;
        attrs.modified = now;
        Ok(())
    }

    /// Posts a new message, ready immediately.
    ///
    /// The record, the Ready entry and the `received` counter are written in
    /// one transaction.
    pub async fn post(
        &self,
        payload: impl Into<String>,
        overrides: MessageOverrides,
    ) -> Result<Message, QueueError> {
        let payload = payload.into();
        if payload.trim().is_empty() {
            return Err(QueueError::invalid("payload", "empty"));
        }
        overrides.validate()?;

        let plimit = overrides.plimit.unwrap_or(self.settings().plimit);
        if plimit > 0 {
            let (ready, leased) = self.index.counts().await?;
            if (ready + leased) as i64 >= plimit {
                return Err(QueueError::LimitExceeded {
                    queue: self.name.to_string(),
                    limit: plimit,
                });
            }
        }

        let mut taken = None;
        for _ in 0..POST_ATTEMPTS {
            let id = self.ctx.ids.next_id()?;
            let now = self.ctx.backend.now().await?;
            let record = MessageRecord {
                id: id.clone(),
                queue: self.name.clone(),
                payload: payload.clone(),
                hidden: false,
                overrides,
                created: now,
                modified: now,
            };

            // The record must not exist yet; another writer may share our worker id.
            let tx = Transaction::new()
                .guard(Command::HCreate {
                    key: self.ctx.keys.message(&id),
                    fields: record.to_fields(),
                })
                .then(self.index.add_ready(&id, now))
                .then(self.bump(F_RECEIVED));
            if self.ctx.backend.exec(tx).await?.is_applied() {
                debug!(queue = %self.name, %id, "posted message");
                return Ok(Message::new(record, self.clone()));
            }
            warn!(queue = %self.name, %id, "message id already taken; drawing another");
            taken = Some(id);
        }
        Err(QueueError::DuplicateId(
            taken.map(|id| id.to_string()).unwrap_or_default(),
        ))
    }

    /// The message `receive` would return next, without claiming it.
    ///
    /// Expired or orphaned entries at the head are skipped, not removed; the
    /// window over Ready doubles until a live entry turns up or Ready runs out.
    pub async fn peek(&self) -> Result<Option<Message>, QueueError> {
        let now = self.settle().await?;
        let etimeout = self.settings().etimeout;

        let mut window = PEEK_WINDOW;
        let mut seen = HashSet::new();
        loop {
            let entries = self.index.ready_until(now, Some(window)).await?;
            let fetched = entries.len();
            for (id, _) in entries {
                if !seen.insert(id.clone()) {
                    continue;
                }
                match self.ctx.load_record(&id).await? {
                    Some(record)
                        if record.queue == self.name && !record.is_expired(etimeout, now) =>
                    {
                        return Ok(Some(Message::new(record, self.clone())));
                    }
                    _ => continue,
                }
            }
            if fetched < window {
                return Ok(None);
            }
            window = window.saturating_mul(2);
        }
    }

    /// Claims the earliest ready message and hides it for the lease.
    ///
    /// Lease length: `lease`, else the message's `htimeout`, else the
    /// queue's. An empty result means nothing was ready, or every attempt
    /// lost its race to another consumer.
    pub async fn receive(&self, lease: Option<Duration>) -> Result<Option<Message>, QueueError> {
        let now = self.settle().await?;
        let terms = LeaseTerms {
            queue: self,
            lease_ms: lease.map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX)),
            settings: self.settings(),
        };
        let claimed = self
            .index
            .claim_earliest(now, self.ctx.claim_attempts, &terms)
            .await?;
        Ok(claimed.map(|(_, (record, until))| Message::leased(record, self.clone(), until)))
    }

    /// Claims the earliest ready message and deletes it in the same
    /// transaction. No lease, no acknowledge.
    pub async fn pop(&self) -> Result<Option<Message>, QueueError> {
        let now = self.settle().await?;
        let terms = PopTerms {
            queue: self,
            settings: self.settings(),
        };
        let claimed = self
            .index
            .claim_earliest(now, self.ctx.claim_attempts, &terms)
            .await?;
        Ok(claimed.map(|(_, record)| Message::new(record, self.clone())))
    }

    /// Finalizes a leased message: deletes it and counts it as sent.
    ///
    /// Fails with `MessageNotFound` unless `id` is currently in this queue's
    /// Leased index.
    pub async fn acknowledge(&self, id: &MessageId) -> Result<(), QueueError> {
        let tx = Transaction::new()
            .guard(self.index.remove_leased(id))
            .then(Command::Del {
                key: self.ctx.keys.message(id),
            })
            .then(self.bump(F_SENT));
        match self.ctx.backend.exec(tx).await? {
            TxOutcome::Applied(_) => Ok(()),
            TxOutcome::Aborted => Err(QueueError::MessageNotFound(id.to_string())),
        }
    }

    /// Deletes a message whether ready or leased. Does not count as sent.
    pub async fn delete(&self, id: &MessageId) -> Result<(), QueueError> {
        let tx = Transaction::new()
            .guard(self.index.remove_ready(id))
            .guard(self.index.remove_leased(id))
            .then(Command::Del {
                key: self.ctx.keys.message(id),
            });
        match self.ctx.backend.exec(tx).await? {
            TxOutcome::Applied(_) => Ok(()),
            TxOutcome::Aborted => Err(QueueError::MessageNotFound(id.to_string())),
        }
    }

    /// Moves a message to `destination`, ready immediately and unhidden.
    ///
    /// Moving to the owning queue is a no-op.
    pub async fn move_message(
        &self,
        id: &MessageId,
        destination: &str,
    ) -> Result<Message, QueueError> {
        let destination = QueueName::new(destination)?;
        if destination == self.name {
            return self
                .find(id, false)
                .await?
                .ok_or_else(|| QueueError::MessageNotFound(id.to_string()));
        }

        let target = self.sibling(&destination).await?;
        let mut record = self
            .ctx
            .load_record(id)
            .await?
            .filter(|record| record.queue == self.name)
            .ok_or_else(|| QueueError::MessageNotFound(id.to_string()))?;

        let now = self.ctx.backend.now().await?;
        let tx = Transaction::new()
            .guard(self.index.remove_ready(id))
            .guard(self.index.remove_leased(id))
            .then(target.index.add_ready(id, now))
            .then(Command::HUpdate {
                key: self.ctx.keys.message(id),
                fields: vec![
                    ("queue".to_string(), destination.to_string()),
                    ("hidden".to_string(), flag(false)),
                    ("modified".to_string(), now.to_string()),
                ],
            })
            .then(target.bump(F_RECEIVED));
        if !self.ctx.backend.exec(tx).await?.is_applied() {
            return Err(QueueError::MessageNotFound(id.to_string()));
        }

        debug!(from = %self.name, to = %destination, %id, "moved message");
        record.queue = destination;
        record.hidden = false;
        record.modified = now;
        Ok(Message::new(record, target))
    }

    /// Looks a message up by id within this queue. With `active_only`,
    /// leased (hidden) messages are not reported.
    pub async fn find(
        &self,
        id: &MessageId,
        active_only: bool,
    ) -> Result<Option<Message>, QueueError> {
        Ok(self
            .ctx
            .load_record(id)
            .await?
            .filter(|record| record.queue == self.name && !(active_only && record.hidden))
            .map(|record| Message::new(record, self.clone())))
    }

    /// Index membership: Ready only with `active_only`, else Ready or Leased.
    pub async fn contains(&self, id: &MessageId, active_only: bool) -> Result<bool, QueueError> {
        Ok(match self.index.locate(id).await? {
            Some(Slot::Ready(_)) => true,
            Some(Slot::Leased(_)) => !active_only,
            None => false,
        })
    }

    /// Ids ready now, oldest first. Diagnostic only: a later `receive` may
    /// lose any of them to another consumer.
    pub async fn pending(&self) -> Result<Vec<MessageId>, QueueError> {
        let now = self.ctx.backend.now().await?;
        Ok(self
            .index
            .ready_until(now, None)
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    /// Returns lapsed leases to Ready; the count moved.
    pub async fn reap(&self) -> Result<usize, QueueError> {
        let now = self.ctx.backend.now().await?;
        self.requeue_expired_at(now).await
    }

    // Every read path settles lapsed leases first and works at the same `now`.
    async fn settle(&self) -> Result<Timestamp, QueueError> {
        let now = self.ctx.backend.now().await?;
        self.requeue_expired_at(now).await?;
        Ok(now)
    }

    /// Returns leases lapsed at or before `now` to Ready; the count moved.
    pub async fn requeue_expired_at(&self, now: Timestamp) -> Result<usize, QueueError> {
        let keys = &self.ctx.keys;
        self.index
            .requeue_expired(now, self.ctx.reap_batch, |id| {
                vec![Command::HUpdate {
                    key: keys.message(id),
                    fields: vec![
                        ("hidden".to_string(), flag(false)),
                        ("modified".to_string(), now.to_string()),
                    ],
                }]
            })
            .await
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let attrs = self.refresh().await?;
        let (ready, leased) = self.index.counts().await?;
        Ok(QueueStats {
            ready,
            leased,
            received: attrs.received,
            sent: attrs.sent,
        })
    }

    /// Decides whether a Ready entry can be delivered. Entries whose record
    /// is gone or owned elsewhere are dropped; expired records are deleted.
    async fn screen(
        &self,
        id: &MessageId,
        now: Timestamp,
        settings: &QueueSettings,
    ) -> Result<Screen, QueueError> {
        let record = match self.ctx.load_record(id).await? {
            Some(record) if record.queue == self.name => record,
            Some(record) => {
                warn!(
                    queue = %self.name,
                    %id,
                    owner = %record.queue,
                    "ready entry owned by another queue"
                );
                return Ok(Screen::Drop(Vec::new()));
            }
            None => {
                warn!(queue = %self.name, %id, "ready entry without a message record");
                return Ok(Screen::Drop(Vec::new()));
            }
        };
        if record.is_expired(settings.etimeout, now) {
            debug!(queue = %self.name, %id, "message expired before delivery");
            return Ok(Screen::Drop(vec![Command::Del {
                key: self.ctx.keys.message(id),
            }]));
        }
        Ok(Screen::Deliver(record))
    }
}

enum Screen {
    Deliver(MessageRecord),
    Drop(Vec<Command>),
}

struct LeaseTerms<'a> {
    queue: &'a Queue,
    lease_ms: Option<i64>,
    settings: QueueSettings,
}

#[async_trait]
impl ClaimTerms for LeaseTerms<'_> {
    type Output = (MessageRecord, Timestamp);

    async fn prepare(
        &self,
        id: &MessageId,
        now: Timestamp,
    ) -> Result<Candidate<Self::Output>, QueueError> {
        let mut record = match self.queue.screen(id, now, &self.settings).await? {
            Screen::Deliver(record) => record,
            Screen::Drop(commands) => return Ok(Candidate::Discard { commands }),
        };

        let lease_ms = self.lease_ms.unwrap_or_else(|| {
            let secs = record.overrides.htimeout.unwrap_or(self.settings.htimeout);
            secs.saturating_mul(1_000)
        });
        let until = now.saturating_add(lease_ms.max(0));
        let commands = vec![
            self.queue.index.add_leased(id, until),
            Command::HUpdate {
                key: self.queue.ctx.keys.message(id),
                fields: vec![
                    ("hidden".to_string(), flag(true)),
                    ("modified".to_string(), now.to_string()),
                ],
            },
        ];
        record.hidden = true;
        record.modified = now;
        Ok(Candidate::Claim {
            commands,
            output: (record, until),
        })
    }
}

struct PopTerms<'a> {
    queue: &'a Queue,
    settings: QueueSettings,
}

#[async_trait]
impl ClaimTerms for PopTerms<'_> {
    type Output = MessageRecord;

    async fn prepare(
        &self,
        id: &MessageId,
        now: Timestamp,
    ) -> Result<Candidate<Self::Output>, QueueError> {
        let record = match self.queue.screen(id, now, &self.settings).await? {
            Screen::Deliver(record) => record,
            Screen::Drop(commands) => return Ok(Candidate::Discard { commands }),
        };
        let commands = vec![
            Command::Del {
                key: self.queue.ctx.keys.message(id),
            },
            self.queue.bump(F_SENT),
        ];
        Ok(Candidate::Claim {
            commands,
            output: record,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_fill_missing_settings_with_defaults() {
        let fields: HashMap<String, String> = [
            ("created", "10"),
            ("modified", "20"),
            ("htimeout", "5"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let attrs = QueueAttributes::from_fields("k", &fields).unwrap().unwrap();
        assert_eq!(attrs.settings.htimeout, 5);
        assert_eq!(attrs.settings.etimeout, -1);
        assert_eq!(attrs.settings.plimit, -1);
        assert_eq!((attrs.received, attrs.sent), (0, 0));
    }

    #[test]
    fn attributes_require_timestamps() {
        let fields: HashMap<String, String> =
            [("htimeout".to_string(), "5".to_string())].into_iter().collect();
        assert!(QueueAttributes::from_fields("k", &fields).is_err());
        assert_eq!(QueueAttributes::from_fields("k", &HashMap::new()).unwrap(), None);
    }

    #[test]
    fn settings_reject_negative_lease() {
        assert!(QueueSettings::default().validate().is_ok());
        let off = QueueSettings { etimeout: 0, plimit: 0, ..Default::default() };
        assert!(off.validate().is_ok());

        let negative_lease = QueueSettings { htimeout: -1, ..Default::default() };
        assert!(matches!(
            negative_lease.validate(),
            Err(QueueError::Validation { field: "htimeout", .. })
        ));
    }

    #[test]
    fn fresh_attributes_round_trip_through_fields() {
        let attrs = QueueAttributes::fresh(QueueSettings::default(), 1_234);
        let fields: HashMap<String, String> = attrs.to_fields().into_iter().collect();
        assert_eq!(QueueAttributes::from_fields("k", &fields).unwrap(), Some(attrs));
    }
}
