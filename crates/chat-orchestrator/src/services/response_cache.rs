use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::config::CacheConfig;
use crate::models::chat::{AnswerResult, UserType};

/// `(user type, case-folded and trimmed question)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    user_type: UserType,
    question: String,
}

impl CacheKey {
    pub fn new(user_type: UserType, question: &str) -> Self {
        Self {
            user_type,
            question: question.trim().to_lowercase(),
        }
    }

    pub fn question(&self) -> &str {
        &self.question
    }
}

struct CacheEntry {
    answer: Arc<AnswerResult>,
    created_at: Instant,
    /// Position in the recency order.
    tick: u64,
}

/// Exact LRU: `order` maps a monotonically increasing tick to its key, so the
/// first element is always the least recently used.
#[derive(Default)]
struct LruIndex {
    entries: HashMap<CacheKey, CacheEntry>,
    order: BTreeMap<u64, CacheKey>,
    next_tick: u64,
}

impl LruIndex {
    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        Some(entry)
    }

    fn evict_lru(&mut self) -> Option<CacheKey> {
        let (_, key) = self.order.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Process-wide memo of normal answers, bounded by size and age.
pub struct ResponseCache {
    enabled: bool,
    max_entries: usize,
    ttl: Duration,
    index: Mutex<LruIndex>,
    flights: DashMap<CacheKey, Arc<AsyncMutex<()>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            enabled: config.enabled && config.max_entries > 0,
            max_entries: config.max_entries,
            ttl: Duration::from_secs(config.ttl_minutes * 60),
            index: Mutex::new(LruIndex::default()),
            flights: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<AnswerResult>> {
        self.get_at(key, Instant::now())
    }

    /// A hit refreshes recency; the TTL clock keeps running from creation.
    pub fn get_at(&self, key: &CacheKey, now: Instant) -> Option<Arc<AnswerResult>> {
        if !self.enabled {
            return None;
        }

        let mut index = self.index.lock();

        let expired = match index.entries.get(key) {
            Some(entry) => now.saturating_duration_since(entry.created_at) > self.ttl,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if expired {
            index.remove(key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!("Cache entry expired for '{}'", key.question);
            return None;
        }

        let tick = index.bump();
        let entry = index.entries.get_mut(key)?;
        let old_tick = std::mem::replace(&mut entry.tick, tick);
        let answer = entry.answer.clone();
        index.order.remove(&old_tick);
        index.order.insert(tick, key.clone());

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(answer)
    }

    pub fn put(&self, key: CacheKey, answer: Arc<AnswerResult>) {
        self.put_at(key, answer, Instant::now())
    }

    /// Replaces any existing entry; evicts the LRU entry first when full.
    pub fn put_at(&self, key: CacheKey, answer: Arc<AnswerResult>, now: Instant) {
        if !self.enabled {
            return;
        }

        let mut index = self.index.lock();
        index.remove(&key);

        while index.entries.len() >= self.max_entries {
            match index.evict_lru() {
                Some(evicted) => debug!("Evicted LRU cache entry '{}'", evicted.question),
                None => break,
            }
        }

        let tick = index.bump();
        index.order.insert(tick, key.clone());
        index.entries.insert(
            key,
            CacheEntry {
                answer,
                created_at: now,
                tick,
            },
        );
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.index.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.index.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes concurrent misses on the same key so only one of them
    /// reaches the backends. Returns `None` when caching is disabled.
    pub async fn single_flight(&self, key: &CacheKey) -> Option<FlightGuard<'_>> {
        if !self.enabled {
            return None;
        }

        let lock = self
            .flights
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();

        let guard = lock.lock_owned().await;
        Some(FlightGuard {
            flights: &self.flights,
            key: key.clone(),
            guard: Some(guard),
        })
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            enabled: self.enabled,
            entries: self.len(),
            max_entries: self.max_entries,
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}

/// Held by the caller that computes an answer for a key.
pub struct FlightGuard<'a> {
    flights: &'a DashMap<CacheKey, Arc<AsyncMutex<()>>>,
    key: CacheKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map still holds the lock once nobody waits on it.
        self.flights
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}
