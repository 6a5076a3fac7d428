//! Embedded keyspace engine backing the broker.
//!
//! Provides the storage primitives the broker contract needs: strings with
//! TTL, insertion-ordered sets, sorted sets with integer scores, hashes,
//! atomic multi-key batches, and notify-driven blocking waits. Single-node
//! deployments get a dependency-free broker and a hermetic test suite; a
//! networked engine with the same primitives can replace this one behind
//! the broker.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;

use taskmesh_core::QueueError;

/// Store-level failures. Broker operations convert these into the public
/// error taxonomy at the boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key holds a value of a different kind than the operation expects.
    #[error("wrong value kind at key {0}")]
    WrongType(String),
}

impl From<StoreError> for QueueError {
    fn from(e: StoreError) -> Self {
        QueueError::BrokerUnavailable(e.to_string())
    }
}

/// Wakeup cadence while blocked in [`MemoryStore::wait_for`]. Bounds how
/// late a purely time-based visibility change (retry backoff expiring) is
/// observed; mutations wake waiters immediately.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Set of string members that remembers insertion order.
#[derive(Debug, Default)]
pub struct OrderedSet {
    order: Vec<String>,
    index: HashSet<String>,
}

impl OrderedSet {
    fn insert(&mut self, member: &str) -> bool {
        if self.index.insert(member.to_string()) {
            self.order.push(member.to_string());
            true
        } else {
            false
        }
    }

    fn remove(&mut self, member: &str) -> bool {
        if self.index.remove(member) {
            self.order.retain(|m| m != member);
            true
        } else {
            false
        }
    }

    fn contains(&self, member: &str) -> bool {
        self.index.contains(member)
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn members(&self) -> Vec<String> {
        self.order.clone()
    }
}

/// Sorted set of string members ranked by `(score, insertion sequence)`,
/// so equal scores pop in FIFO order.
#[derive(Debug, Default)]
pub struct SortedSet {
    ranked: BTreeMap<(i64, u64), String>,
    scores: HashMap<String, (i64, u64)>,
}

impl SortedSet {
    fn insert(&mut self, score: i64, seq: u64, member: &str) -> bool {
        let fresh = match self.scores.remove(member) {
            Some(old) => {
                self.ranked.remove(&old);
                false
            }
            None => true,
        };
        self.ranked.insert((score, seq), member.to_string());
        self.scores.insert(member.to_string(), (score, seq));
        fresh
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(rank) => {
                self.ranked.remove(&rank);
                true
            }
            None => false,
        }
    }

    fn pop_min(&mut self) -> Option<(String, i64)> {
        let (&(score, seq), _) = self.ranked.iter().next()?;
        let member = self.ranked.remove(&(score, seq))?;
        self.scores.remove(&member);
        Some((member, score))
    }

    fn score(&self, member: &str) -> Option<i64> {
        self.scores.get(member).map(|&(score, _)| score)
    }

    fn len(&self) -> usize {
        self.ranked.len()
    }

    fn members(&self) -> Vec<String> {
        self.ranked.values().cloned().collect()
    }

    fn members_by_score(&self, min: i64, max: i64) -> Vec<String> {
        self.ranked
            .range((min, u64::MIN)..=(max, u64::MAX))
            .map(|(_, member)| member.clone())
            .collect()
    }
}

#[derive(Debug)]
enum Value {
    Str(String),
    Set(OrderedSet),
    Zset(SortedSet),
    Hash(HashMap<String, String>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Set(_) => "set",
            Value::Zset(_) => "zset",
            Value::Hash(_) => "hash",
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// The keyspace itself. Only reachable through [`MemoryStore::atomic`] and
/// [`MemoryStore::wait_for`], so every batch of calls on it is observed
/// together.
#[derive(Debug, Default)]
pub struct Keyspace {
    entries: HashMap<String, Entry>,
    seq: u64,
    /// Bumped by every mutating operation. `MemoryStore::atomic` compares
    /// it across the batch to decide whether waiters need waking.
    version: u64,
}

impl Keyspace {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn bump(&mut self) {
        self.version += 1;
    }

    fn live_entry(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| e.expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    // Callers run the matching typed accessor first, which both surfaces
    // kind mismatches and drops an expired entry under the key.
    fn write_entry(&mut self, key: &str, make: impl FnOnce() -> Value) -> &mut Entry {
        self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: make(),
            expires_at: None,
        })
    }

    fn wrong_type(key: &str) -> StoreError {
        StoreError::WrongType(key.to_string())
    }

    // String keys

    /// Set a string key, clearing any previous TTL.
    pub fn set(&mut self, key: &str, value: &str) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: None,
            },
        );
        self.bump();
    }

    /// Set a string key that expires after `ttl`.
    pub fn set_with_ttl(&mut self, key: &str, value: &str, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Instant::now().checked_add(ttl),
            },
        );
        self.bump();
    }

    /// Set a string key only if absent. Returns whether the write happened.
    pub fn set_nx(&mut self, key: &str, value: &str) -> bool {
        if self.live_entry(key).is_some() {
            return false;
        }
        self.set(key, value);
        true
    }

    pub fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        match self.live_entry(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    pub fn del(&mut self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.bump();
        }
        removed
    }

    pub fn exists(&mut self, key: &str) -> bool {
        self.live_entry(key).is_some()
    }

    // Plain sets (insertion-ordered)

    fn set_value(&mut self, key: &str) -> Result<Option<&mut OrderedSet>, StoreError> {
        match self.live_entry(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Set(s),
                ..
            }) => Ok(Some(s)),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    pub fn sadd(&mut self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.set_value(key)?;
        let entry = self.write_entry(key, || Value::Set(OrderedSet::default()));
        let inserted = match &mut entry.value {
            Value::Set(s) => s.insert(member),
            _ => return Err(Self::wrong_type(key)),
        };
        if inserted {
            self.bump();
        }
        Ok(inserted)
    }

    pub fn srem(&mut self, key: &str, member: &str) -> Result<bool, StoreError> {
        let removed = self.set_value(key)?.is_some_and(|s| s.remove(member));
        if removed {
            self.bump();
        }
        Ok(removed)
    }

    pub fn sismember(&mut self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self.set_value(key)?.is_some_and(|s| s.contains(member)))
    }

    pub fn scard(&mut self, key: &str) -> Result<usize, StoreError> {
        Ok(self.set_value(key)?.map_or(0, |s| s.len()))
    }

    pub fn smembers(&mut self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.set_value(key)?.map_or_else(Vec::new, |s| s.members()))
    }

    /// Move a member between two plain sets. Returns whether the member was
    /// present in the source.
    pub fn smove(&mut self, src: &str, dst: &str, member: &str) -> Result<bool, StoreError> {
        if !self.srem(src, member)? {
            return Ok(false);
        }
        self.sadd(dst, member)?;
        Ok(true)
    }

    // Sorted sets

    fn zset_value(&mut self, key: &str) -> Result<Option<&mut SortedSet>, StoreError> {
        match self.live_entry(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Zset(z),
                ..
            }) => Ok(Some(z)),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    /// Insert or re-score a member. Re-scored members take a fresh position
    /// at the back of their score tier.
    pub fn zadd(&mut self, key: &str, score: i64, member: &str) -> Result<bool, StoreError> {
        self.zset_value(key)?;
        let seq = self.next_seq();
        let entry = self.write_entry(key, || Value::Zset(SortedSet::default()));
        let fresh = match &mut entry.value {
            Value::Zset(z) => z.insert(score, seq, member),
            _ => return Err(Self::wrong_type(key)),
        };
        self.bump();
        Ok(fresh)
    }

    pub fn zrem(&mut self, key: &str, member: &str) -> Result<bool, StoreError> {
        let removed = self.zset_value(key)?.is_some_and(|z| z.remove(member));
        if removed {
            self.bump();
        }
        Ok(removed)
    }

    pub fn zscore(&mut self, key: &str, member: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.zset_value(key)?.and_then(|z| z.score(member)))
    }

    pub fn zcard(&mut self, key: &str) -> Result<usize, StoreError> {
        Ok(self.zset_value(key)?.map_or(0, |z| z.len()))
    }

    /// Pop the member with the smallest `(score, insertion)` rank.
    pub fn zpop_min(&mut self, key: &str) -> Result<Option<(String, i64)>, StoreError> {
        let popped = self.zset_value(key)?.and_then(|z| z.pop_min());
        if popped.is_some() {
            self.bump();
        }
        Ok(popped)
    }

    /// All members in rank order.
    pub fn zmembers(&mut self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.zset_value(key)?.map_or_else(Vec::new, |z| z.members()))
    }

    /// Members with `min <= score <= max`, in rank order.
    pub fn zrange_by_score(
        &mut self,
        key: &str,
        min: i64,
        max: i64,
    ) -> Result<Vec<String>, StoreError> {
        Ok(self
            .zset_value(key)?
            .map_or_else(Vec::new, |z| z.members_by_score(min, max)))
    }

    // Hashes

    fn hash_value(&mut self, key: &str) -> Result<Option<&mut HashMap<String, String>>, StoreError> {
        match self.live_entry(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(Some(h)),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    pub fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.hash_value(key)?;
        let entry = self.write_entry(key, || Value::Hash(HashMap::new()));
        match &mut entry.value {
            Value::Hash(h) => {
                h.insert(field.to_string(), value.to_string());
            }
            _ => return Err(Self::wrong_type(key)),
        }
        self.bump();
        Ok(())
    }

    pub fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self.hash_value(key)?.and_then(|h| h.get(field).cloned()))
    }

    pub fn hdel(&mut self, key: &str, field: &str) -> Result<bool, StoreError> {
        let removed = self
            .hash_value(key)?
            .is_some_and(|h| h.remove(field).is_some());
        if removed {
            self.bump();
        }
        Ok(removed)
    }

    // Maintenance

    /// Drop every expired entry, returning the removed keys.
    pub fn purge_expired(&mut self) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.entries.remove(key);
        }
        if !expired.is_empty() {
            self.bump();
        }
        expired
    }
}

struct StoreInner {
    keyspace: Mutex<Keyspace>,
    changed: Notify,
}

/// Handle to the shared keyspace. Cloning is cheap; all clones observe the
/// same state.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                keyspace: Mutex::new(Keyspace::default()),
                changed: Notify::new(),
            }),
        }
    }

    /// Run a batch of keyspace operations under the lock. Everything the
    /// closure does is observed together; waiters are woken afterwards if
    /// the batch mutated any state.
    pub fn atomic<R>(&self, f: impl FnOnce(&mut Keyspace) -> R) -> R {
        let (out, mutated) = {
            let mut keyspace = self.inner.keyspace.lock();
            let before = keyspace.version;
            let out = f(&mut keyspace);
            (out, keyspace.version != before)
        };
        if mutated {
            self.inner.changed.notify_waiters();
        }
        out
    }

    /// Block until `f` yields a value or `timeout` lapses. `f` runs as an
    /// atomic batch on every keyspace mutation and on a short poll tick
    /// (the tick is what makes time-based visibility changes observable).
    pub async fn wait_for<R>(
        &self,
        timeout: Duration,
        mut f: impl FnMut(&mut Keyspace) -> Option<R>,
    ) -> Option<R> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut notified = pin!(self.inner.changed.notified());
            // Register interest before checking, so a mutation between the
            // check and the await still wakes us.
            notified.as_mut().enable();

            // Evaluated outside `atomic` so the waiter does not wake
            // itself: a successful claim only removes work, and new work
            // arrives through `atomic`, which wakes the enabled waiter.
            let outcome = {
                let mut keyspace = self.inner.keyspace.lock();
                f(&mut keyspace)
            };
            if let Some(out) = outcome {
                return Some(out);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let tick = WAIT_POLL_INTERVAL.min(deadline - now);
            tokio::select! {
                _ = notified.as_mut() => {}
                _ = tokio::time::sleep(tick) => {}
            }
        }
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
