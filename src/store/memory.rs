//! In-process [`StorageBackend`].
//!
//! All state sits behind a single mutex, so every call (and in particular
//! every [`Transaction`]) is atomic with respect to every other. The clock is
//! either the system clock or a [`ManualClock`] shared with the caller, which
//! lets tests step over lease and expiry windows without sleeping.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{BackendError, Command, StorageBackend, Timestamp, Transaction, TxOutcome};

/// A clock that only moves when told to.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicI64>);

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self(Arc::new(AtomicI64::new(start)))
    }

    pub fn now(&self) -> Timestamp {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, at: Timestamp) {
        self.0.store(at, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
enum Clock {
    System,
    Manual(ManualClock),
}

impl Clock {
    fn now(&self) -> Result<Timestamp, BackendError> {
        match self {
            Clock::System => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as Timestamp)
                .map_err(|e| BackendError::Unavailable(format!("system clock: {e}"))),
            Clock::Manual(clock) => Ok(clock.now()),
        }
    }
}

#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, Timestamp>,
    ordered: BTreeSet<(Timestamp, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: Timestamp) -> bool {
        match self.scores.insert(member.to_string(), score) {
            Some(previous) => {
                self.ordered.remove(&(previous, member.to_string()));
                self.ordered.insert((score, member.to_string()));
                false
            }
            None => {
                self.ordered.insert((score, member.to_string()));
                true
            }
        }
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.scores.len()
    }
}

#[derive(Debug, Default)]
struct State {
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    zsets: HashMap<String, SortedSet>,
}

impl State {
    fn key_exists(&self, key: &str) -> bool {
        self.hashes.contains_key(key) || self.sets.contains_key(key) || self.zsets.contains_key(key)
    }

    fn apply(&mut self, command: &Command) -> Result<i64, BackendError> {
        let reply = match command {
            Command::HSet { key, fields } => {
                let hash = self.hashes.entry(key.clone()).or_default();
                let mut added = 0;
                for (field, value) in fields {
                    if hash.insert(field.clone(), value.clone()).is_none() {
                        added += 1;
                    }
                }
                added
            }
            Command::HIncrBy { key, field, delta } => {
                let hash = self.hashes.entry(key.clone()).or_default();
                let current = match hash.get(field) {
                    Some(raw) => raw.parse::<i64>().map_err(|_| BackendError::Corrupt {
                        key: key.clone(),
                        reason: format!("field `{field}` is not an integer"),
                    })?,
                    None => 0,
                };
                let next = current + delta;
                hash.insert(field.clone(), next.to_string());
                next
            }
            Command::HCreate { key, fields } => {
                if self.key_exists(key) {
                    0
                } else {
                    self.hashes.insert(key.clone(), fields.iter().cloned().collect());
                    1
                }
            }
            Command::HUpdate { key, fields } => match self.hashes.get_mut(key) {
                Some(hash) => {
                    for (field, value) in fields {
                        hash.insert(field.clone(), value.clone());
                    }
                    1
                }
                None => 0,
            },
            Command::Del { key } => {
                let removed = self.hashes.remove(key).is_some()
                    | self.sets.remove(key).is_some()
                    | self.zsets.remove(key).is_some();
                removed as i64
            }
            Command::ZAdd { key, member, score } => {
                self.zsets.entry(key.clone()).or_default().insert(member, *score) as i64
            }
            Command::ZRem { key, member } => {
                let Some(zset) = self.zsets.get_mut(key) else {
                    return Ok(0);
                };
                let removed = zset.remove(member);
                if zset.scores.is_empty() {
                    self.zsets.remove(key);
                }
                removed as i64
            }
            Command::SAdd { key, member } => {
                self.sets.entry(key.clone()).or_default().insert(member.clone()) as i64
            }
        };
        Ok(reply)
    }
}

/// Shared-nothing, single-process backend.
#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<State>,
    clock: Clock,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Backend driven by the system clock.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock: Clock::System,
        }
    }

    /// Backend driven by `clock`.
    pub fn with_clock(clock: ManualClock) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock: Clock::Manual(clock),
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn now(&self) -> Result<Timestamp, BackendError> {
        self.clock.now()
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.state.lock().key_exists(key))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, BackendError> {
        Ok(self.state.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        max: Timestamp,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Timestamp)>, BackendError> {
        let state = self.state.lock();
        let Some(zset) = state.zsets.get(key) else {
            return Ok(Vec::new());
        };
        Ok(zset
            .ordered
            .iter()
            .take_while(|(score, _)| *score <= max)
            .take(limit.unwrap_or(usize::MAX))
            .map(|(score, member)| (member.clone(), *score))
            .collect())
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<Timestamp>, BackendError> {
        let state = self.state.lock();
        Ok(state
            .zsets
            .get(key)
            .and_then(|zset| zset.scores.get(member).copied()))
    }

    async fn zcard(&self, key: &str) -> Result<u64, BackendError> {
        let state = self.state.lock();
        Ok(state.zsets.get(key).map_or(0, |zset| zset.len() as u64))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, BackendError> {
        let state = self.state.lock();
        let mut members: Vec<String> = state
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn exec(&self, tx: Transaction) -> Result<TxOutcome, BackendError> {
        let mut state = self.state.lock();
        let mut replies = Vec::with_capacity(tx.guards().len() + tx.body().len());

        for guard in tx.guards() {
            replies.push(state.apply(guard)?);
        }
        if tx.is_guarded() && replies.iter().sum::<i64>() == 0 {
            return Ok(TxOutcome::Aborted);
        }
        for command in tx.body() {
            replies.push(state.apply(command)?);
        }
        Ok(TxOutcome::Applied(replies))
    }
}
