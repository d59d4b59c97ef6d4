//! Language-scoped storage surface used by the rest of the app.
//!
//! Every method returns a [`StorageResult`]; nothing here panics or propagates an
//! error. Reads go through the dependency cache, writes go to the tiered store and
//! then refresh the cache and everything derived from the written key.

pub mod analytics;
pub mod export;
pub mod health;

pub use analytics::StorageAnalytics;
pub use export::{ExportDocument, ExportMetadata, ImportReport};
pub use health::{HealthStatus, StorageHealth};

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::autosave::{ChangeSink, FlushWrite};
use crate::cache::keys::{
    self, ACHIEVEMENTS_KEY, ANY_WRITE_TAG, GAME_STATE_KEY, SESSION_STATE_KEY, USER_PREFERENCES_KEY,
};
use crate::cache::DependencyCache;
use crate::clock::Clock;
use crate::config::FacadeConfig;
use crate::models::{GameState, LanguageProgress, SessionState, UserPreferences};
use crate::storage::{BatchItem, SetOptions, StorageError, StorageResult, TieredStore};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageSummary {
    pub language_code: String,
    pub total_words: usize,
    pub practiced_words: usize,
    pub total_xp: u64,
}

impl LanguageSummary {
    pub fn from_progress(language_code: &str, progress: &LanguageProgress) -> Self {
        Self {
            language_code: language_code.to_string(),
            total_words: progress.len(),
            practiced_words: progress.values().filter(|p| p.is_practiced()).count(),
            total_xp: progress.values().map(|p| u64::from(p.xp)).sum(),
        }
    }
}

pub struct StorageFacade {
    store: Arc<TieredStore>,
    cache: Arc<DependencyCache>,
    clock: Arc<dyn Clock>,
    config: FacadeConfig,
}

impl StorageFacade {
    pub fn new(
        store: Arc<TieredStore>,
        cache: Arc<DependencyCache>,
        clock: Arc<dyn Clock>,
        config: FacadeConfig,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            config,
        }
    }

    pub fn store(&self) -> &Arc<TieredStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<DependencyCache> {
        &self.cache
    }

    // ========== word progress ==========

    pub async fn save_word_progress(&self, language: &str, progress: &LanguageProgress) -> StorageResult<()> {
        if let Err(err) = validate_language(language) {
            return StorageResult::failed(err);
        }
        let key = keys::word_progress_key(language);
        let result = self
            .store
            .set(&key, Some(language), progress, SetOptions::default())
            .await;
        if result.success {
            self.refresh_progress_views(language, &key, progress);
        }
        result
    }

    /// Absent progress loads as an empty map.
    pub async fn load_word_progress(&self, language: &str) -> StorageResult<LanguageProgress> {
        if let Err(err) = validate_language(language) {
            return StorageResult::failed(err);
        }
        let key = keys::word_progress_key(language);
        let result = self
            .read_cached::<LanguageProgress>(&key, Some(language), self.config.progress_ttl)
            .await;
        if result.success && result.data.is_none() {
            return StorageResult {
                data: Some(LanguageProgress::new()),
                ..result
            };
        }
        result
    }

    /// Updates the cached view of `language` without writing. Used when persistence
    /// is left to the auto-save queue.
    pub fn stage_word_progress(&self, language: &str, progress: &LanguageProgress) -> StorageResult<()> {
        if let Err(err) = validate_language(language) {
            return StorageResult::failed(err);
        }
        let key = keys::word_progress_key(language);
        self.refresh_progress_views(language, &key, progress);
        StorageResult::ok(())
    }

    pub async fn save_multiple_language_progress(
        &self,
        progress_by_language: &HashMap<String, LanguageProgress>,
    ) -> StorageResult<usize> {
        let mut items = Vec::with_capacity(progress_by_language.len());
        for (language, progress) in progress_by_language {
            if let Err(err) = validate_language(language) {
                return StorageResult::failed(err);
            }
            let value = match serde_json::to_value(progress) {
                Ok(value) => value,
                Err(err) => return StorageResult::failed(StorageError::from(err)),
            };
            items.push(BatchItem {
                key: keys::word_progress_key(language),
                language: Some(language.clone()),
                value,
                options: SetOptions::default(),
            });
        }

        let result = self.store.set_batch(items).await;
        if result.success {
            for (language, progress) in progress_by_language {
                let key = keys::word_progress_key(language);
                self.refresh_progress_views(language, &key, progress);
            }
        }
        result
    }

    /// Languages that fail to load are left out of the map and logged.
    pub async fn load_multiple_language_progress(
        &self,
        languages: &[String],
    ) -> StorageResult<BTreeMap<String, LanguageProgress>> {
        let mut out = BTreeMap::new();
        for language in languages {
            let result = self.load_word_progress(language).await;
            match (result.success, result.data) {
                (true, Some(progress)) => {
                    out.insert(language.clone(), progress);
                }
                _ => warn!(
                    language = %language,
                    error = ?result.error,
                    "skipping language that failed to load"
                ),
            }
        }
        StorageResult::ok(out)
    }

    /// Languages with stored word progress.
    pub async fn available_languages(&self) -> StorageResult<Vec<String>> {
        self.store.get_keys(None).await.map(|all| {
            all.iter()
                .filter_map(|key| keys::language_from_progress_key(key))
                .map(str::to_string)
                .collect()
        })
    }

    pub async fn language_summary(&self, language: &str) -> StorageResult<LanguageSummary> {
        if let Err(err) = validate_language(language) {
            return StorageResult::failed(err);
        }
        let summary_key = keys::language_summary_key(language);
        if let Some(summary) = self.cache.get_as::<LanguageSummary>(&summary_key) {
            return StorageResult::ok(summary);
        }

        let loaded = self.load_word_progress(language).await;
        let metadata = loaded.metadata.clone();
        let progress = match loaded.into_result() {
            Ok(progress) => progress.unwrap_or_default(),
            Err(err) => return StorageResult::failed(err),
        };
        let summary = LanguageSummary::from_progress(language, &progress);
        self.cache.set_as(
            &summary_key,
            &summary,
            Some(self.config.summary_ttl),
            [keys::word_progress_key(language)],
        );
        StorageResult {
            metadata,
            ..StorageResult::ok(summary)
        }
    }

    // ========== singletons ==========

    pub async fn save_game_state(&self, state: &GameState) -> StorageResult<()> {
        self.write_record(GAME_STATE_KEY, None, state).await
    }

    pub async fn load_game_state(&self) -> StorageResult<GameState> {
        self.read_cached(GAME_STATE_KEY, None, self.config.progress_ttl).await
    }

    pub async fn save_session_state(&self, state: &SessionState) -> StorageResult<()> {
        self.write_record(SESSION_STATE_KEY, None, state).await
    }

    pub async fn load_session_state(&self) -> StorageResult<SessionState> {
        self.read_cached(SESSION_STATE_KEY, None, self.config.progress_ttl).await
    }

    pub async fn save_user_preferences(&self, preferences: &UserPreferences) -> StorageResult<()> {
        self.write_record(USER_PREFERENCES_KEY, None, preferences).await
    }

    pub async fn load_user_preferences(&self) -> StorageResult<UserPreferences> {
        self.read_cached(USER_PREFERENCES_KEY, None, self.config.progress_ttl).await
    }

    pub async fn save_achievements(&self, achievements: &Value) -> StorageResult<()> {
        self.write_record(ACHIEVEMENTS_KEY, None, achievements).await
    }

    pub async fn load_achievements(&self) -> StorageResult<Value> {
        self.read_cached(ACHIEVEMENTS_KEY, None, self.config.progress_ttl).await
    }

    pub async fn save_analytics(&self, language: &str, analytics: &Value) -> StorageResult<()> {
        if let Err(err) = validate_language(language) {
            return StorageResult::failed(err);
        }
        self.write_record(&keys::analytics_key(language), Some(language), analytics)
            .await
    }

    pub async fn load_analytics(&self, language: &str) -> StorageResult<Value> {
        if let Err(err) = validate_language(language) {
            return StorageResult::failed(err);
        }
        self.read_cached(&keys::analytics_key(language), Some(language), self.config.analytics_ttl)
            .await
    }

    // ========== internals ==========

    async fn write_record<T: Serialize>(
        &self,
        key: &str,
        language: Option<&str>,
        value: &T,
    ) -> StorageResult<()> {
        let result = self.store.set(key, language, value, SetOptions::default()).await;
        if result.success {
            self.invalidate_dependents(key);
            self.cache
                .set_as(key, value, Some(self.config.progress_ttl), [key]);
        }
        result
    }

    async fn read_cached<T: DeserializeOwned + Serialize>(
        &self,
        key: &str,
        language: Option<&str>,
        ttl: Duration,
    ) -> StorageResult<T> {
        if let Some(cached) = self.cache.get_as::<T>(key) {
            return StorageResult::ok(cached);
        }
        let result = self.store.get::<T>(key, language).await;
        if let Some(data) = &result.data {
            self.cache.set_as(key, data, Some(ttl), [key]);
        }
        result
    }

    fn invalidate_dependents(&self, key: &str) {
        let dropped = self.cache.invalidate_by_dependency(key)
            + self.cache.invalidate_by_dependency(ANY_WRITE_TAG);
        if dropped > 0 {
            debug!(key = %key, dropped, "invalidated derived cache entries");
        }
    }

    fn refresh_progress_views(&self, language: &str, key: &str, progress: &LanguageProgress) {
        self.invalidate_dependents(key);
        self.cache
            .set_as(key, progress, Some(self.config.progress_ttl), [key]);
        let summary = LanguageSummary::from_progress(language, progress);
        self.cache.set_as(
            &keys::language_summary_key(language),
            &summary,
            Some(self.config.summary_ttl),
            [key],
        );
    }

    fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }
}

impl ChangeSink for StorageFacade {
    fn apply(&self, write: FlushWrite) -> impl Future<Output = Result<(), StorageError>> + Send {
        async move {
            let result = match write {
                FlushWrite::WordProgress { language, data } => {
                    let progress: LanguageProgress = serde_json::from_value(data)?;
                    self.save_word_progress(&language, &progress).await
                }
                FlushWrite::GameState(data) => self.write_record(GAME_STATE_KEY, None, &data).await,
                FlushWrite::SessionState(data) => self.write_record(SESSION_STATE_KEY, None, &data).await,
                FlushWrite::Achievements(data) => self.write_record(ACHIEVEMENTS_KEY, None, &data).await,
            };
            result.into_result().map(|_| ())
        }
    }
}

fn validate_language(language: &str) -> Result<(), StorageError> {
    if keys::is_valid_language_code(language) {
        Ok(())
    } else {
        Err(StorageError::InvalidData(format!("invalid language code: {language:?}")))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::clock::ManualClock;
    use crate::compression::CompressionCodec;
    use crate::config::{CacheConfig, CompressionConfig};
    use crate::storage::LocalProvider;

    pub fn facade() -> (StorageFacade, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let codec = Arc::new(CompressionCodec::new(CompressionConfig::default()));
        let store = Arc::new(TieredStore::local_only(
            LocalProvider::in_memory().unwrap(),
            codec,
            clock.clone(),
        ));
        let cache = Arc::new(DependencyCache::new(CacheConfig::default(), clock.clone()));
        (
            StorageFacade::new(store, cache, clock.clone(), FacadeConfig::default()),
            clock,
        )
    }
}
