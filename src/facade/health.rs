use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::StorageFacade;
use crate::storage::{StorageResult, TierHealth};

/// Pending writes above this mark the storage as degraded.
pub const DEGRADED_QUEUE_DEPTH: usize = 100;
pub const UNHEALTHY_QUEUE_DEPTH: usize = 500;
pub const MIN_HEALTHY_HIT_RATE: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageHealth {
    pub status: HealthStatus,
    pub cache_hit_rate: f64,
    pub cache_lookups: u64,
    pub pending_changes: usize,
    pub backend: TierHealth,
    pub issues: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

/// `hit_rate` is `None` until the cache has served a lookup.
pub fn classify(pending_changes: usize, hit_rate: Option<f64>, backend_healthy: bool) -> (HealthStatus, Vec<String>) {
    let mut issues = Vec::new();
    let mut status = HealthStatus::Healthy;

    if !backend_healthy {
        issues.push("storage backend is unreachable".to_string());
        status = HealthStatus::Unhealthy;
    }
    if pending_changes > UNHEALTHY_QUEUE_DEPTH {
        issues.push(format!("{pending_changes} changes waiting to be saved"));
        status = HealthStatus::Unhealthy;
    } else if pending_changes > DEGRADED_QUEUE_DEPTH {
        issues.push(format!("{pending_changes} changes waiting to be saved"));
        status = status.max(HealthStatus::Degraded);
    }
    if let Some(rate) = hit_rate {
        if rate < MIN_HEALTHY_HIT_RATE {
            issues.push(format!("cache hit rate {:.0}% below {:.0}%", rate * 100.0, MIN_HEALTHY_HIT_RATE * 100.0));
            status = status.max(HealthStatus::Degraded);
        }
    }
    (status, issues)
}

impl StorageFacade {
    pub async fn get_storage_health(&self, pending_changes: usize) -> StorageResult<StorageHealth> {
        let backend = self.store.health_check().await;
        let cache = self.cache.stats();
        let lookups = cache.lookups();
        let hit_rate = (lookups > 0).then_some(cache.hit_rate);
        let (status, issues) = classify(pending_changes, hit_rate, backend.healthy);

        StorageResult::ok(StorageHealth {
            status,
            cache_hit_rate: cache.hit_rate,
            cache_lookups: lookups,
            pending_changes,
            backend,
            issues,
            checked_at: self.clock.now(),
        })
    }
}
