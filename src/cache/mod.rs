//! In-memory cache shared by the storage facade and derived snapshots.
//!
//! Entries carry a TTL and a set of dependency tags. Writers invalidate by tag, so a
//! single save of `word_progress_de` drops every summary or analytics snippet that was
//! derived from it without the writer knowing those snapshots exist. Capacity is
//! bounded by entry count and estimated bytes; the least recently accessed entry goes
//! first.

pub mod keys;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;

pub const NO_DEPENDENCIES: &[&str] = &[];

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Value,
    pub timestamp: i64,
    pub ttl: Duration,
    pub dependencies: HashSet<String>,
    pub access_count: u64,
    pub last_access: i64,
    pub size: usize,
    access_seq: u64,
}

impl CacheEntry {
    pub fn expires_at(&self) -> i64 {
        self.timestamp
            .saturating_add(i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX))
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
    pub size_bytes: usize,
    pub max_size_bytes: usize,
    /// Share of the byte budget in use, 0.0..=1.0.
    pub memory_usage: f64,
    pub oldest_entry: Option<i64>,
    pub newest_entry: Option<i64>,
    pub hit_rate: f64,
}

impl CacheStats {
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// access sequence -> key, oldest access first
    lru: BTreeMap<u64, String>,
    /// dependency tag -> keys declaring it
    tags: HashMap<String, HashSet<String>>,
    size_bytes: usize,
    access_seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl CacheInner {
    fn next_seq(&mut self) -> u64 {
        self.access_seq += 1;
        self.access_seq
    }

    fn touch(&mut self, key: &str, now_ms: i64) -> Option<Value> {
        let seq = self.next_seq();
        let entry = self.entries.get_mut(key)?;
        self.lru.remove(&entry.access_seq);
        entry.access_seq = seq;
        entry.access_count += 1;
        entry.last_access = now_ms;
        self.lru.insert(seq, key.to_string());
        Some(entry.value.clone())
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.lru.remove(&entry.access_seq);
        for tag in &entry.dependencies {
            if let Some(keys) = self.tags.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
        self.size_bytes = self.size_bytes.saturating_sub(entry.size);
        Some(entry)
    }

    fn evict_lru(&mut self) -> bool {
        let Some((_, key)) = self.lru.pop_first() else {
            return false;
        };
        if self.remove(&key).is_some() {
            self.evictions += 1;
        }
        true
    }
}

pub struct DependencyCache {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<CacheInner>,
}

impl DependencyCache {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn with_system_clock(config: CacheConfig) -> Self {
        Self::new(config, Arc::new(SystemClock))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();

        let Some(expired) = inner.entries.get(key).map(|entry| entry.is_expired(now)) else {
            inner.misses += 1;
            return None;
        };

        if expired {
            inner.remove(key);
            inner.expirations += 1;
            inner.misses += 1;
            return None;
        }

        inner.hits += 1;
        inner.touch(key, now)
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(err) => {
                warn!(key = %key, error = %err, "cached value has unexpected shape, dropping it");
                self.invalidate(key);
                None
            }
        }
    }

    /// Stores `value`, replacing any previous entry. Returns `false` when the value
    /// alone exceeds the byte budget and was not cached.
    pub fn set<I>(&self, key: &str, value: Value, ttl: Option<Duration>, dependencies: I) -> bool
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let size = estimate_size(key, &value);
        let dependencies: HashSet<String> = dependencies
            .into_iter()
            .map(|tag| tag.as_ref().to_string())
            .collect();
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();

        inner.remove(key);

        if size > self.config.max_size_bytes {
            debug!(key = %key, size, "value larger than cache budget, not cached");
            return false;
        }

        while !inner.entries.is_empty()
            && (inner.entries.len() + 1 > self.config.max_entries
                || inner.size_bytes + size > self.config.max_size_bytes)
        {
            if !inner.evict_lru() {
                break;
            }
        }

        for tag in &dependencies {
            inner
                .tags
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }

        let seq = inner.next_seq();
        inner.lru.insert(seq, key.to_string());
        inner.size_bytes += size;
        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                timestamp: now,
                ttl: ttl.unwrap_or(self.config.default_ttl),
                dependencies,
                access_count: 0,
                last_access: now,
                size,
                access_seq: seq,
            },
        );
        true
    }

    pub fn set_as<T, I>(&self, key: &str, value: &T, ttl: Option<Duration>, dependencies: I) -> bool
    where
        T: Serialize,
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        match serde_json::to_value(value) {
            Ok(json) => self.set(key, json, ttl, dependencies),
            Err(err) => {
                warn!(key = %key, error = %err, "value could not be serialized for cache");
                false
            }
        }
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    pub fn invalidate_by_dependency(&self, tag: &str) -> usize {
        let mut inner = self.inner.lock();
        let Some(keys) = inner.tags.remove(tag) else {
            return 0;
        };
        let mut removed = 0;
        for key in keys {
            if inner.remove(&key).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(tag = %tag, removed, "invalidated cache entries by dependency");
        }
        removed
    }

    pub fn invalidate_by_pattern(&self, pattern: &Regex) -> usize {
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner
            .entries
            .keys()
            .filter(|key| pattern.is_match(key))
            .cloned()
            .collect();
        keys.iter().filter(|key| inner.remove(key).is_some()).count()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.lru.clear();
        inner.tags.clear();
        inner.size_bytes = 0;
    }

    /// Drops every expired entry regardless of access pattern.
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        inner.expirations += expired.len() as u64;
        expired.len()
    }

    /// Whether `key` is cached and fresh, without counting a hit or miss.
    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        self.inner
            .lock()
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.inner.lock().entries.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().entries.keys().cloned().collect()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let lookups = inner.hits + inner.misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            inner.hits as f64 / lookups as f64
        };
        let memory_usage = if self.config.max_size_bytes == 0 {
            0.0
        } else {
            inner.size_bytes as f64 / self.config.max_size_bytes as f64
        };

        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
            entries: inner.entries.len(),
            size_bytes: inner.size_bytes,
            max_size_bytes: self.config.max_size_bytes,
            memory_usage,
            oldest_entry: inner.entries.values().map(|e| e.timestamp).min(),
            newest_entry: inner.entries.values().map(|e| e.timestamp).max(),
            hit_rate,
        }
    }

    /// Runs `cleanup_expired` every `cleanup_interval` until `shutdown` fires.
    pub fn spawn_cleanup(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = self.config.cleanup_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("cache cleanup task stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = cache.cleanup_expired();
                        if removed > 0 {
                            debug!(removed, "cache cleanup sweep");
                        }
                    }
                }
            }
        })
    }
}

fn estimate_size(key: &str, value: &Value) -> usize {
    let serialized = serde_json::to_string(value).map(|s| s.len()).unwrap_or(0);
    key.len() + serialized
}
