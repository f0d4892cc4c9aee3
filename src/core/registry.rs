use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::error::QueueError;
use crate::core::id::{FlakeIdGenerator, IdGenerator};
use crate::core::keys::KeySpace;
use crate::core::message::Message;
use crate::core::names::{MessageId, QueueName};
use crate::core::queue::{Queue, QueueAttributes, QueueSettings};
use crate::core::Context;
use crate::store::{Command, StorageBackend, Transaction};

#[derive(Debug)]
struct CachedHandle {
    queue: Queue,
    loaded_at: Instant,
}

/// Bounded, time-limited cache of queue handles by name.
///
/// Advisory only: [`QueueRegistry::load`] confirms existence with the backend
/// before trusting an entry, and `create`/`exists` never look here.
#[derive(Debug)]
pub struct HandleCache {
    entries: DashMap<QueueName, CachedHandle>,
    capacity: usize,
    ttl: Duration,
}

impl HandleCache {
    /// A `capacity` of zero disables caching.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::with_capacity(capacity),
            capacity,
            ttl,
        }
    }

    /// A handle loaded less than `ttl` ago. Stale entries are dropped.
    pub fn get(&self, name: &QueueName) -> Option<Queue> {
        if let Some(entry) = self.entries.get(name) {
            if entry.loaded_at.elapsed() < self.ttl {
                return Some(entry.queue.clone());
            }
        }
        self.entries
            .remove_if(name, |_, entry| entry.loaded_at.elapsed() >= self.ttl);
        None
    }

    pub fn insert(&self, queue: Queue) {
        if self.capacity == 0 {
            return;
        }
        if !self.entries.contains_key(queue.name()) && self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.entries.insert(
            queue.name().clone(),
            CachedHandle {
                queue,
                loaded_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, name: &QueueName) {
        self.entries.remove(name);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.loaded_at)
            .map(|entry| entry.key().clone());
        if let Some(name) = oldest {
            debug!("🧹 Evicting cached handle for queue '{}'", name);
            self.entries.remove(&name);
        }
    }
}

/// Entry point: creates, loads and lists queues over one backend.
#[derive(Debug)]
pub struct QueueRegistry {
    ctx: Arc<Context>,
    defaults: QueueSettings,
    cache: HandleCache,
}

impl QueueRegistry {
    /// Registry with default configuration.
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self::from_config(backend, &Config::default())
    }

    pub fn from_config(backend: Arc<dyn StorageBackend>, config: &Config) -> Self {
        let ids: Arc<dyn IdGenerator> = match config.engine.worker_id {
            Some(worker) => Arc::new(FlakeIdGenerator::new(worker)),
            None => Arc::new(FlakeIdGenerator::random()),
        };
        let ctx = Context {
            backend,
            ids,
            keys: KeySpace::new(config.store.namespace.as_deref()),
            claim_attempts: config.engine.claim_attempts.max(1),
            reap_batch: config.engine.reap_batch.max(1),
        };
        Self {
            ctx: Arc::new(ctx),
            defaults: config.queue,
            cache: HandleCache::new(
                config.engine.cache_capacity,
                Duration::from_millis(config.engine.cache_ttl_ms),
            ),
        }
    }

    /// Replaces the id source. Handles already cached keep the old one.
    pub fn with_id_generator(self, ids: Arc<dyn IdGenerator>) -> Self {
        let ctx = Context {
            backend: self.ctx.backend.clone(),
            ids,
            keys: self.ctx.keys.clone(),
            claim_attempts: self.ctx.claim_attempts,
            reap_batch: self.ctx.reap_batch,
        };
        let cache = HandleCache::new(self.cache.capacity, self.cache.ttl);
        Self {
            ctx: Arc::new(ctx),
            defaults: self.defaults,
            cache,
        }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.ctx.backend
    }

    pub fn keys(&self) -> &KeySpace {
        &self.ctx.keys
    }

    /// Settings applied when `create` is given none.
    pub fn defaults(&self) -> QueueSettings {
        self.defaults
    }

    pub fn cache(&self) -> &HandleCache {
        &self.cache
    }

    pub async fn exists(&self, name: &str) -> Result<bool, QueueError> {
        let name = QueueName::new(name)?;
        Ok(self.ctx.backend.exists(&self.ctx.keys.queue_config(&name)).await?)
    }

    /// Creates a queue; `Conflict` if it already exists.
    ///
    /// The registry entry and the config hash are written together, guarded
    /// by the registry insert, so two racing creators cannot both succeed.
    pub async fn create(
        &self,
        name: &str,
        settings: Option<QueueSettings>,
    ) -> Result<Queue, QueueError> {
        let name = QueueName::new(name)?;
        let settings = settings.unwrap_or(self.defaults);
        settings.validate()?;

        let config_key = self.ctx.keys.queue_config(&name);
        if self.ctx.backend.exists(&config_key).await? {
            return Err(QueueError::Conflict(name.to_string()));
        }

        let now = self.ctx.backend.now().await?;
        let attrs = QueueAttributes::fresh(settings, now);
        let tx = Transaction::new()
            .guard(Command::SAdd {
                key: self.ctx.keys.registry(),
                member: name.to_string(),
            })
            .then(Command::HSet {
                key: config_key,
                fields: attrs.to_fields(),
            });
        if !self.ctx.backend.exec(tx).await?.is_applied() {
            return Err(QueueError::Conflict(name.to_string()));
        }

        info!(
            queue = %name,
            htimeout = settings.htimeout,
            etimeout = settings.etimeout,
            plimit = settings.plimit,
            "📬 Queue created"
        );
        let queue = Queue::new(self.ctx.clone(), name, attrs);
        self.cache.insert(queue.clone());
        Ok(queue)
    }

    /// Handle for an existing queue; `QueueNotFound` otherwise.
    pub async fn load(&self, name: &str) -> Result<Queue, QueueError> {
        let name = QueueName::new(name)?;
        if !self.ctx.backend.exists(&self.ctx.keys.queue_config(&name)).await? {
            self.cache.invalidate(&name);
            return Err(QueueError::QueueNotFound(name.to_string()));
        }
        if let Some(queue) = self.cache.get(&name) {
            return Ok(queue);
        }

        let queue = Queue::open(&self.ctx, &name)
            .await?
            .ok_or_else(|| QueueError::QueueNotFound(name.to_string()))?;
        self.cache.insert(queue.clone());
        Ok(queue)
    }

    /// Loads `name`, creating it with `settings` when absent. An existing
    /// queue keeps its configuration.
    pub async fn load_or_create(
        &self,
        name: &str,
        settings: Option<QueueSettings>,
    ) -> Result<Queue, QueueError> {
        match self.load(name).await {
            Err(QueueError::QueueNotFound(_)) => {}
            other => return other,
        }
        match self.create(name, settings).await {
            // Lost a create race; the winner's queue is what we want.
            Err(QueueError::Conflict(_)) => self.load(name).await,
            other => other,
        }
    }

    /// Registered queue names, sorted. A snapshot.
    pub async fn list(&self) -> Result<Vec<QueueName>, QueueError> {
        let members = self.ctx.backend.smembers(&self.ctx.keys.registry()).await?;
        let mut names = Vec::with_capacity(members.len());
        for member in members {
            match QueueName::new(&member) {
                Ok(name) => names.push(name),
                Err(e) => warn!(member = %member, error = %e, "skipping malformed registry entry"),
            }
        }
        Ok(names)
    }

    /// Looks a message up by id in whichever queue owns it.
    pub async fn find_message(
        &self,
        id: &str,
        active_only: bool,
    ) -> Result<Option<Message>, QueueError> {
        let id = MessageId::new(id)?;
        let Some(record) = self.ctx.load_record(&id).await? else {
            return Ok(None);
        };
        if active_only && record.hidden {
            return Ok(None);
        }
        match self.load(record.queue.as_str()).await {
            Ok(queue) => queue.find(&id, active_only).await,
            Err(QueueError::QueueNotFound(owner)) => {
                warn!(%id, owner = %owner, "message record names a missing queue");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// One reaper sweep over every registered queue; the total requeued.
    pub async fn reap_all(&self) -> Result<usize, QueueError> {
        let names = self.list().await?;
        let sweeps = names.iter().map(|name| async move {
            match Queue::open(&self.ctx, name).await? {
                Some(queue) => queue.reap().await,
                None => Ok(0),
            }
        });

        let mut total = 0;
        for result in join_all(sweeps).await {
            total += result?;
        }
        if total > 0 {
            debug!(queues = names.len(), requeued = total, "reaper sweep");
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ManualClock, MemoryBackend};

    fn registry() -> QueueRegistry {
        QueueRegistry::new(Arc::new(MemoryBackend::with_clock(ManualClock::new(1_000))))
    }

    #[tokio::test]
    async fn create_registers_name_and_config_together() {
        let registry = registry();
        let queue = registry.create("jobs", None).await.unwrap();

        assert_eq!(queue.attributes().created, 1_000);
        assert_eq!(queue.settings(), QueueSettings::default());
        assert!(registry.exists("jobs").await.unwrap());
        assert_eq!(registry.list().await.unwrap(), vec![QueueName::new("jobs").unwrap()]);
    }

    #[tokio::test]
    async fn create_rejects_bad_names_before_touching_the_backend() {
        let registry = registry();
        let err = registry.create("no spaces", None).await.unwrap_err();
        assert!(matches!(err, QueueError::Validation { .. }));
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_does_not_trust_the_cache() {
        let registry = registry();
        registry.create("jobs", None).await.unwrap();
        assert_eq!(registry.cache().len(), 1);

        // Remove the config hash behind the registry's back.
        let key = registry.keys().queue_config(&QueueName::new("jobs").unwrap());
        registry
            .backend()
            .exec(Transaction::new().then(Command::Del { key }))
            .await
            .unwrap();

        let err = registry.load("jobs").await.unwrap_err();
        assert!(matches!(err, QueueError::QueueNotFound(_)));
        assert!(registry.cache().is_empty());
    }

    #[tokio::test]
    async fn cache_evicts_oldest_when_full() {
        let backend = Arc::new(MemoryBackend::with_clock(ManualClock::new(0)));
        let mut config = Config::default();
        config.engine.cache_capacity = 2;
        let registry = QueueRegistry::from_config(backend, &config);

        for name in ["a", "b", "c"] {
            registry.create(name, None).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(registry.cache().len(), 2);
        assert!(registry.cache().get(&QueueName::new("a").unwrap()).is_none());
        assert!(registry.cache().get(&QueueName::new("c").unwrap()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn cache_entries_expire() {
        let cache = HandleCache::new(4, Duration::from_millis(50));
        let registry = registry();
        let queue = registry.create("jobs", None).await.unwrap();
        cache.insert(queue.clone());

        assert!(cache.get(queue.name()).is_some());
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(cache.get(queue.name()).is_none());
        assert!(cache.is_empty());
    }
}
