//! Queue engine: registry, per-queue visibility index, and message lifecycle.

pub mod error;
pub mod id;
pub mod index;
pub mod keys;
pub mod message;
pub mod names;
pub mod queue;
pub mod reaper;
pub mod registry;

use std::sync::Arc;

use crate::core::error::QueueError;
use crate::core::id::IdGenerator;
use crate::core::keys::KeySpace;
use crate::core::message::MessageRecord;
use crate::core::names::MessageId;
use crate::store::StorageBackend;

/// Collaborators shared by every handle created from one registry.
#[derive(Debug)]
pub(crate) struct Context {
    pub backend: Arc<dyn StorageBackend>,
    pub ids: Arc<dyn IdGenerator>,
    pub keys: KeySpace,
    /// Lost-race retries inside a single claim.
    pub claim_attempts: usize,
    /// Leases requeued per backend read while reaping.
    pub reap_batch: usize,
}

impl Context {
    pub async fn load_record(&self, id: &MessageId) -> Result<Option<MessageRecord>, QueueError> {
        let key = self.keys.message(id);
        let fields = self.backend.hgetall(&key).await?;
        Ok(MessageRecord::from_fields(id, &key, &fields)?)
    }
}
