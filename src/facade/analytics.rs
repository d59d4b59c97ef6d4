use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::StorageFacade;
use crate::cache::keys::{self, ANY_WRITE_TAG, STORAGE_ANALYTICS_KEY};
use crate::cache::CacheStats;
use crate::compression::CompressionStats;
use crate::storage::{StorageResult, StoreMetrics};

const HIGH_LATENCY_MS: f64 = 500.0;
const HIGH_MEMORY_USAGE: f64 = 0.9;
const MIN_LOOKUPS_FOR_HIT_RATE: u64 = 10;
const LOW_COMPRESSION_SAVINGS: f64 = 0.1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageAnalytics {
    pub generated_at: DateTime<Utc>,
    pub cache: CacheStats,
    pub compression: CompressionStats,
    pub compression_savings: f64,
    pub store: StoreMetrics,
    pub average_latency_ms: f64,
    pub keys_by_prefix: BTreeMap<String, usize>,
    pub total_keys: usize,
    pub health_score: f64,
    pub recommendations: Vec<String>,
    pub alerts: Vec<String>,
}

/// 0-100: half from cache hit rate, half from how fast storage answers.
pub fn health_score(hit_rate: f64, average_latency_ms: f64) -> f64 {
    let latency_score = 100.0 / (100.0 + average_latency_ms.max(0.0));
    (50.0 * hit_rate.clamp(0.0, 1.0) + 50.0 * latency_score).clamp(0.0, 100.0)
}

fn advise(
    cache: &CacheStats,
    compression: &CompressionStats,
    store: &StoreMetrics,
) -> (Vec<String>, Vec<String>) {
    let mut recommendations = Vec::new();
    let mut alerts = Vec::new();

    if cache.lookups() >= MIN_LOOKUPS_FOR_HIT_RATE && cache.hit_rate < 0.7 {
        recommendations.push(format!(
            "Cache hit rate is {:.0}%; consider longer TTLs for progress data",
            cache.hit_rate * 100.0
        ));
    }
    if cache.evictions > cache.entries as u64 && cache.evictions > 0 {
        recommendations.push("Frequent cache evictions; raise CACHE_MAX_ENTRIES or CACHE_MAX_SIZE_BYTES".to_string());
    }
    if compression.compressed > 0 && compression.savings() < LOW_COMPRESSION_SAVINGS {
        recommendations.push("Compression saves little; raise COMPRESSION_MIN_SIZE_BYTES".to_string());
    }
    if compression.failures > 0 {
        recommendations.push(format!(
            "{} native compression failures fell back to the dictionary codec",
            compression.failures
        ));
    }

    if cache.memory_usage > HIGH_MEMORY_USAGE {
        alerts.push(format!("Cache memory usage at {:.0}%", cache.memory_usage * 100.0));
    }
    if store.average_latency_ms() > HIGH_LATENCY_MS {
        alerts.push(format!(
            "Average storage latency {:.0}ms exceeds {:.0}ms",
            store.average_latency_ms(),
            HIGH_LATENCY_MS
        ));
    }
    if store.failures > 0 {
        alerts.push(format!("{} storage operations failed", store.failures));
    }
    if store.fallbacks > 0 {
        alerts.push(format!(
            "Remote storage offline; {} operations served from the local store",
            store.fallbacks
        ));
    }

    (recommendations, alerts)
}

impl StorageFacade {
    /// Short-lived snapshot; any storage write drops it.
    pub async fn get_storage_analytics(&self) -> StorageResult<StorageAnalytics> {
        if let Some(snapshot) = self.cache.get_as::<StorageAnalytics>(STORAGE_ANALYTICS_KEY) {
            return StorageResult::ok(snapshot);
        }

        let listed = self.store.get_keys(None).await;
        let metadata = listed.metadata.clone();
        let all_keys = match listed.into_result() {
            Ok(all_keys) => all_keys.unwrap_or_default(),
            Err(err) => return StorageResult::failed(err),
        };

        let mut keys_by_prefix = BTreeMap::new();
        for key in &all_keys {
            *keys_by_prefix
                .entry(keys::key_prefix(key).to_string())
                .or_insert(0usize) += 1;
        }

        let cache = self.cache.stats();
        let compression = self.store.codec().stats();
        let store = self.store.metrics();
        let (recommendations, alerts) = advise(&cache, &compression, &store);

        let snapshot = StorageAnalytics {
            generated_at: self.clock.now(),
            health_score: health_score(cache.hit_rate, store.average_latency_ms()),
            average_latency_ms: store.average_latency_ms(),
            compression_savings: compression.savings(),
            total_keys: all_keys.len(),
            keys_by_prefix,
            cache,
            compression,
            store,
            recommendations,
            alerts,
        };

        self.cache.set_as(
            STORAGE_ANALYTICS_KEY,
            &snapshot,
            Some(self.config.analytics_ttl),
            [ANY_WRITE_TAG],
        );
        StorageResult {
            metadata,
            ..StorageResult::ok(snapshot)
        }
    }
}
