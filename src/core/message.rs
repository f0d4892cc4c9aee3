//! Message records and the [`Message`] handle.

use std::collections::HashMap;

use crate::core::error::QueueError;
use crate::core::names::{MessageId, QueueName};
use crate::core::queue::Queue;
use crate::store::{BackendError, Command, Timestamp, Transaction};

const F_QUEUE: &str = "queue";
const F_PAYLOAD: &str = "message";
const F_HIDDEN: &str = "hidden";
const F_HTIMEOUT: &str = "htimeout";
const F_ETIMEOUT: &str = "etimeout";
const F_PLIMIT: &str = "plimit";
const F_CREATED: &str = "created";
const F_MODIFIED: &str = "modified";

/// Per-message overrides of the owning queue's settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageOverrides {
    /// Lease length in seconds.
    pub htimeout: Option<i64>,
    /// Lifetime in seconds from creation; `<= 0` never expires.
    pub etimeout: Option<i64>,
    pub plimit: Option<i64>,
}

impl MessageOverrides {
    pub fn with_htimeout(mut self, secs: i64) -> Self {
        self.htimeout = Some(secs);
        self
    }

    pub fn with_etimeout(mut self, secs: i64) -> Self {
        self.etimeout = Some(secs);
        self
    }

    pub fn with_plimit(mut self, limit: i64) -> Self {
        self.plimit = Some(limit);
        self
    }

    /// Same rule as the queue settings: a lease may not be negative.
    pub fn validate(&self) -> Result<(), QueueError> {
        match self.htimeout {
            Some(secs) if secs < 0 => Err(QueueError::invalid(
                "htimeout",
                format!("must not be negative, got {secs}"),
            )),
            _ => Ok(()),
        }
    }
}

/// The stored form of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub queue: QueueName,
    pub payload: String,
    pub hidden: bool,
    pub overrides: MessageOverrides,
    pub created: Timestamp,
    pub modified: Timestamp,
}

impl MessageRecord {
    pub(crate) fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            (F_QUEUE.to_string(), self.queue.to_string()),
            (F_PAYLOAD.to_string(), self.payload.clone()),
            (F_HIDDEN.to_string(), flag(self.hidden)),
            (F_CREATED.to_string(), self.created.to_string()),
            (F_MODIFIED.to_string(), self.modified.to_string()),
        ];
        let optional = [
            (F_HTIMEOUT, self.overrides.htimeout),
            (F_ETIMEOUT, self.overrides.etimeout),
            (F_PLIMIT, self.overrides.plimit),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                fields.push((name.to_string(), value.to_string()));
            }
        }
        fields
    }

    /// Decodes a stored hash; `None` when the hash is empty (no such record).
    pub(crate) fn from_fields(
        id: &MessageId,
        key: &str,
        fields: &HashMap<String, String>,
    ) -> Result<Option<Self>, BackendError> {
        if fields.is_empty() {
            return Ok(None);
        }
        let corrupt = |reason: String| BackendError::Corrupt {
            key: key.to_string(),
            reason,
        };
        let required = |name: &str| {
            fields
                .get(name)
                .ok_or_else(|| corrupt(format!("missing field `{name}`")))
        };
        let int = |name: &str, raw: &str| {
            raw.parse::<i64>()
                .map_err(|_| corrupt(format!("field `{name}` is not an integer: {raw}")))
        };
        let optional_int = |name: &str| fields.get(name).map(|raw| int(name, raw)).transpose();

        let queue = QueueName::new(required(F_QUEUE)?)
            .map_err(|e| corrupt(format!("field `{F_QUEUE}`: {e}")))?;

        Ok(Some(Self {
            id: id.clone(),
            queue,
            payload: required(F_PAYLOAD)?.clone(),
            hidden: parse_flag(fields.get(F_HIDDEN).map(String::as_str)),
            overrides: MessageOverrides {
                htimeout: optional_int(F_HTIMEOUT)?,
                etimeout: optional_int(F_ETIMEOUT)?,
                plimit: optional_int(F_PLIMIT)?,
            },
            created: int(F_CREATED, required(F_CREATED)?)?,
            modified: int(F_MODIFIED, required(F_MODIFIED)?)?,
        }))
    }

    /// Absolute expiry, if the effective `etimeout` is positive.
    pub fn expires_at(&self, queue_etimeout: i64) -> Option<Timestamp> {
        let etimeout = self.overrides.etimeout.unwrap_or(queue_etimeout);
        (etimeout > 0).then(|| self.created.saturating_add(etimeout.saturating_mul(1_000)))
    }

    pub fn is_expired(&self, queue_etimeout: i64, now: Timestamp) -> bool {
        self.expires_at(queue_etimeout).is_some_and(|at| now >= at)
    }
}

pub(crate) fn flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

// Older writers stored booleans as `true`/`false`.
fn parse_flag(raw: Option<&str>) -> bool {
    matches!(raw, Some("1") | Some("true"))
}

/// A message bound to the queue that owns it.
///
/// The handle carries a snapshot of the record; [`Message::refresh`] reloads
/// it. Lifecycle operations delegate to the owning [`Queue`].
#[derive(Debug, Clone)]
pub struct Message {
    record: MessageRecord,
    queue: Queue,
    lease_expires_at: Option<Timestamp>,
}

impl Message {
    pub(crate) fn new(record: MessageRecord, queue: Queue) -> Self {
        Self {
            record,
            queue,
            lease_expires_at: None,
        }
    }

    pub(crate) fn leased(record: MessageRecord, queue: Queue, until: Timestamp) -> Self {
        Self {
            record,
            queue,
            lease_expires_at: Some(until),
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.record.id
    }

    pub fn payload(&self) -> &str {
        &self.record.payload
    }

    pub fn queue_name(&self) -> &QueueName {
        &self.record.queue
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn hidden(&self) -> bool {
        self.record.hidden
    }

    pub fn overrides(&self) -> &MessageOverrides {
        &self.record.overrides
    }

    pub fn created(&self) -> Timestamp {
        self.record.created
    }

    pub fn modified(&self) -> Timestamp {
        self.record.modified
    }

    /// Lease deadline when this handle came from a `receive`.
    pub fn lease_expires_at(&self) -> Option<Timestamp> {
        self.lease_expires_at
    }

    pub fn record(&self) -> &MessageRecord {
        &self.record
    }

    /// Rewrites the payload and bumps `modified`.
    pub async fn update(&mut self, payload: impl Into<String>) -> Result<(), QueueError> {
        let payload = payload.into();
        if payload.trim().is_empty() {
            return Err(QueueError::invalid("payload", "empty"));
        }
        let ctx = self.queue.context();
        let now = ctx.backend.now().await?;
        let tx = Transaction::new().guard(Command::HUpdate {
            key: ctx.keys.message(self.id()),
            fields: vec![
                (F_PAYLOAD.to_string(), payload.clone()),
                (F_MODIFIED.to_string(), now.to_string()),
            ],
        });
        if !ctx.backend.exec(tx).await?.is_applied() {
            return Err(QueueError::MessageNotFound(self.id().to_string()));
        }
        self.record.payload = payload;
        self.record.modified = now;
        Ok(())
    }

    /// Deletes the message: an acknowledge when this handle holds a lease,
    /// an explicit delete otherwise.
    pub async fn delete(&self) -> Result<(), QueueError> {
        if self.record.hidden {
            self.queue.acknowledge(self.id()).await
        } else {
            self.queue.delete(self.id()).await
        }
    }

    /// Moves the message to `destination`; this handle follows it.
    pub async fn move_to(&mut self, destination: &str) -> Result<(), QueueError> {
        let moved = self.queue.move_message(self.id(), destination).await?;
        *self = moved;
        Ok(())
    }

    /// Reloads every field; fails if the record has been deleted.
    pub async fn refresh(&mut self) -> Result<(), QueueError> {
        let ctx = self.queue.context();
        let record = ctx
            .load_record(self.id())
            .await?
            .ok_or_else(|| QueueError::MessageNotFound(self.id().to_string()))?;
        if record.queue != *self.queue.name() {
            self.queue = self.queue.sibling(&record.queue).await?;
        }
        if !record.hidden {
            self.lease_expires_at = None;
        }
        self.record = record;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> MessageRecord {
        MessageRecord {
            id: MessageId::new("0000000000000ABC").unwrap(),
            queue: QueueName::new("jobs").unwrap(),
            payload: "hello".into(),
            hidden: false,
            overrides: MessageOverrides::default().with_htimeout(5),
            created: 1_000,
            modified: 2_000,
        }
    }

    #[test]
    fn fields_decode_back_to_record() {
        let rec = record();
        let fields: HashMap<String, String> = rec.to_fields().into_iter().collect();

        assert!(!fields.contains_key(F_ETIMEOUT));
        let decoded = MessageRecord::from_fields(&rec.id, "k", &fields).unwrap();
        assert_eq!(decoded, Some(rec));
    }

    #[test]
    fn empty_hash_is_no_record() {
        let id = MessageId::new("0000000000000ABC").unwrap();
        assert_eq!(MessageRecord::from_fields(&id, "k", &HashMap::new()).unwrap(), None);
    }

    #[test]
    fn legacy_boolean_flags_are_understood() {
        let rec = record();
        let mut fields: HashMap<String, String> = rec.to_fields().into_iter().collect();
        fields.insert(F_HIDDEN.into(), "true".into());

        let decoded = MessageRecord::from_fields(&rec.id, "k", &fields).unwrap().unwrap();
        assert!(decoded.hidden);
    }

    #[test]
    fn bad_integer_is_corrupt() {
        let rec = record();
        let mut fields: HashMap<String, String> = rec.to_fields().into_iter().collect();
        fields.insert(F_CREATED.into(), "yesterday".into());

        let err = MessageRecord::from_fields(&rec.id, "k", &fields).unwrap_err();
        assert!(matches!(err, BackendError::Corrupt { .. }));
    }

    #[test]
    fn expiry_prefers_message_override() {
        let mut rec = record();
        assert_eq!(rec.expires_at(-1), None);
        assert_eq!(rec.expires_at(10), Some(11_000));

        rec.overrides.etimeout = Some(2);
        assert_eq!(rec.expires_at(10), Some(3_000));
        assert!(rec.is_expired(10, 3_000));
        assert!(!rec.is_expired(10, 2_999));

        rec.overrides.etimeout = Some(0);
        assert_eq!(rec.expires_at(10), None);
    }

    #[test]
    fn huge_expiry_saturates() {
        let rec = record();
        assert_eq!(rec.expires_at(i64::MAX / 100), Some(i64::MAX));
        assert!(!rec.is_expired(i64::MAX / 100, i64::MAX - 1));
    }

    #[test]
    fn negative_lease_override_is_invalid() {
        assert!(MessageOverrides::default().with_htimeout(0).validate().is_ok());
        let err = MessageOverrides::default().with_htimeout(-1).validate().unwrap_err();
        assert!(matches!(err, QueueError::Validation { field: "htimeout", .. }));
    }
}
