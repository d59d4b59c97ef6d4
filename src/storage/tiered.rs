//! Routes storage operations to the primary tier and wraps stored values.
//!
//! When a remote tier is configured it is primary; the SQLite tier is always present
//! and serves as fallback once the remote reports `Offline`. Values are stored as an
//! envelope: either the plain JSON value, or a base64 payload produced by the
//! compression codec. Envelopes can carry an expiry and read as absent past it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::local::LocalProvider;
use super::remote::RemoteProvider;
use super::{ResultMetadata, SetOptions, StorageError, StorageProvider, StorageResult};
use crate::clock::Clock;
use crate::compression::{decompress_bytes, CompressionAlgorithm, CompressionCodec};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase", rename_all_fields = "camelCase")]
enum Envelope {
    Plain {
        value: Value,
        stored_at: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<i64>,
    },
    Compressed {
        algorithm: CompressionAlgorithm,
        payload: String,
        original_size: usize,
        stored_at: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<i64>,
    },
}

/// Whether `raw` is envelope text written by this store.
pub(super) fn is_envelope(raw: &str) -> bool {
    serde_json::from_str::<Envelope>(raw).is_ok()
}

impl Envelope {
    /// Stored text that is not an envelope is taken as a bare JSON value.
    fn parse(raw: &str) -> Result<Self, StorageError> {
        if let Ok(envelope) = serde_json::from_str::<Envelope>(raw) {
            return Ok(envelope);
        }
        let value: Value = serde_json::from_str(raw)?;
        Ok(Envelope::Plain {
            value,
            stored_at: 0,
            expires_at: None,
        })
    }

    fn is_expired(&self, now_ms: i64) -> bool {
        let expires_at = match self {
            Envelope::Plain { expires_at, .. } | Envelope::Compressed { expires_at, .. } => *expires_at,
        };
        expires_at.is_some_and(|at| now_ms >= at)
    }

    fn is_compressed(&self) -> bool {
        matches!(self, Envelope::Compressed { .. })
    }

    fn open(self) -> Result<Value, StorageError> {
        match self {
            Envelope::Plain { value, .. } => Ok(value),
            Envelope::Compressed {
                algorithm, payload, ..
            } => {
                let bytes = BASE64
                    .decode(payload)
                    .map_err(|e| StorageError::InvalidData(format!("bad base64 payload: {e}")))?;
                let text = decompress_bytes(algorithm, &bytes)?;
                Ok(serde_json::from_str(&text)?)
            }
        }
    }
}

enum Decoded {
    Live { value: Value, compressed: bool },
    Expired,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreMetrics {
    pub operations: u64,
    pub failures: u64,
    pub fallbacks: u64,
    pub total_latency_ms: f64,
}

impl StoreMetrics {
    pub fn average_latency_ms(&self) -> f64 {
        if self.operations == 0 {
            return 0.0;
        }
        self.total_latency_ms / self.operations as f64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierHealth {
    pub provider: StorageProvider,
    pub healthy: bool,
    pub latency_ms: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BatchItem {
    pub key: String,
    pub language: Option<String>,
    pub value: Value,
    pub options: SetOptions,
}

pub struct TieredStore {
    local: LocalProvider,
    remote: Option<RemoteProvider>,
    codec: Arc<CompressionCodec>,
    clock: Arc<dyn Clock>,
    allow_local_fallback: bool,
    metrics: Mutex<StoreMetrics>,
}

impl TieredStore {
    pub fn new(
        local: LocalProvider,
        remote: Option<RemoteProvider>,
        codec: Arc<CompressionCodec>,
        clock: Arc<dyn Clock>,
        allow_local_fallback: bool,
    ) -> Self {
        Self {
            local,
            remote,
            codec,
            clock,
            allow_local_fallback,
            metrics: Mutex::new(StoreMetrics::default()),
        }
    }

    pub fn local_only(local: LocalProvider, codec: Arc<CompressionCodec>, clock: Arc<dyn Clock>) -> Self {
        Self::new(local, None, codec, clock, true)
    }

    pub fn local(&self) -> &LocalProvider {
        &self.local
    }

    pub fn primary(&self) -> StorageProvider {
        if self.remote.is_some() {
            StorageProvider::Remote
        } else {
            StorageProvider::Local
        }
    }

    pub fn codec(&self) -> &Arc<CompressionCodec> {
        &self.codec
    }

    pub fn metrics(&self) -> StoreMetrics {
        *self.metrics.lock()
    }

    pub async fn get_value(&self, key: &str, language: Option<&str>) -> StorageResult<Value> {
        let (result, mut meta) = self
            .route(
                "get",
                self.remote.as_ref().map(|remote| remote.get(language, key)),
                |local| local.get(key),
            )
            .await;

        let raw = match result {
            Ok(Some(raw)) => raw,
            Ok(None) => return StorageResult::empty().with_metadata(meta),
            Err(err) => return StorageResult::failed(err).with_metadata(meta),
        };

        match self.decode(&raw) {
            Ok(Decoded::Live { value, compressed }) => {
                meta.compressed = compressed;
                StorageResult::ok(value).with_metadata(meta)
            }
            Ok(Decoded::Expired) => {
                debug!(key = %key, "stored value expired");
                self.delete_from(meta.provider, key, language).await;
                StorageResult::empty().with_metadata(meta)
            }
            Err(err) => {
                warn!(key = %key, error = %err, "stored value could not be decoded");
                StorageResult::failed(err).with_metadata(meta)
            }
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str, language: Option<&str>) -> StorageResult<T> {
        let StorageResult {
            success,
            data,
            error,
            metadata,
        } = self.get_value(key, language).await;
        if !success {
            return StorageResult {
                success,
                data: None,
                error,
                metadata,
            };
        }
        let typed = match data {
            None => StorageResult::empty(),
            Some(value) => match serde_json::from_value::<T>(value) {
                Ok(typed) => StorageResult::ok(typed),
                Err(err) => {
                    warn!(key = %key, error = %err, "stored value has unexpected shape");
                    StorageResult::failed(StorageError::from(err))
                }
            },
        };
        StorageResult {
            metadata,
            ..typed
        }
    }

    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        language: Option<&str>,
        value: &T,
        options: SetOptions,
    ) -> StorageResult<()> {
        let (raw, compressed) = match self.encode(value, &options) {
            Ok(encoded) => encoded,
            Err(err) => return StorageResult::failed(err),
        };

        let (result, mut meta) = self
            .route(
                "set",
                self.remote
                    .as_ref()
                    .map(|remote| remote.set(language, key, &raw, options.priority)),
                |local| local.set(key, language, &raw),
            )
            .await;
        meta.compressed = compressed;
        StorageResult::from(result).with_metadata(meta)
    }

    pub async fn delete(&self, key: &str, language: Option<&str>) -> StorageResult<bool> {
        let (result, meta) = self
            .route(
                "delete",
                self.remote.as_ref().map(|remote| remote.delete(language, key)),
                |local| local.delete(key),
            )
            .await;
        StorageResult::from(result).with_metadata(meta)
    }

    /// Honours envelope expiry, so an expired key does not exist.
    pub async fn exists(&self, key: &str, language: Option<&str>) -> StorageResult<bool> {
        let result = self.get_value(key, language).await;
        let found = result.data.is_some();
        StorageResult {
            success: result.success,
            data: result.success.then_some(found),
            error: result.error,
            metadata: result.metadata,
        }
    }

    pub async fn get_batch(
        &self,
        keys: &[String],
        language: Option<&str>,
    ) -> StorageResult<HashMap<String, Value>> {
        let (result, meta) = self
            .route(
                "get_batch",
                self.remote
                    .as_ref()
                    .map(|remote| remote.get_batch(language, keys)),
                |local| local.get_batch(keys),
            )
            .await;

        let raw = match result {
            Ok(raw) => raw,
            Err(err) => return StorageResult::failed(err).with_metadata(meta),
        };

        let mut values = HashMap::with_capacity(raw.len());
        for (key, text) in raw {
            match self.decode(&text) {
                Ok(Decoded::Live { value, .. }) => {
                    values.insert(key, value);
                }
                Ok(Decoded::Expired) => self.delete_from(meta.provider, &key, language).await,
                Err(err) => warn!(key = %key, error = %err, "skipping undecodable value in batch"),
            }
        }
        StorageResult::ok(values).with_metadata(meta)
    }

    /// Writes high-priority items first.
    pub async fn set_batch(&self, mut items: Vec<BatchItem>) -> StorageResult<usize> {
        items.sort_by(|a, b| b.options.priority.cmp(&a.options.priority));

        let mut rows = Vec::with_capacity(items.len());
        let mut priorities = Vec::with_capacity(items.len());
        let mut any_compressed = false;
        for item in &items {
            match self.encode(&item.value, &item.options) {
                Ok((raw, compressed)) => {
                    any_compressed |= compressed;
                    rows.push((item.key.clone(), item.language.clone(), raw));
                    priorities.push(item.options.priority);
                }
                Err(err) => return StorageResult::failed(err),
            }
        }

        let (result, mut meta) = self
            .route(
                "set_batch",
                self.remote.as_ref().map(|remote| remote.set_batch(&rows, &priorities)),
                |local| local.set_batch(&rows),
            )
            .await;
        meta.compressed = any_compressed;
        StorageResult::from(result).with_metadata(meta)
    }

    pub async fn get_keys(&self, language: Option<&str>) -> StorageResult<Vec<String>> {
        let (result, meta) = self
            .route(
                "get_keys",
                self.remote.as_ref().map(|remote| remote.keys(language)),
                |local| local.keys(language),
            )
            .await;
        StorageResult::from(result).with_metadata(meta)
    }

    pub async fn clear(&self, language: Option<&str>) -> StorageResult<usize> {
        let (result, meta) = self
            .route(
                "clear",
                self.remote.as_ref().map(|remote| remote.clear(language)),
                |local| local.clear(language),
            )
            .await;
        StorageResult::from(result).with_metadata(meta)
    }

    /// Probes the primary tier only; a reachable local fallback does not make an
    /// unreachable remote healthy.
    pub async fn health_check(&self) -> TierHealth {
        let started = Instant::now();
        let (provider, result) = match &self.remote {
            Some(remote) => (StorageProvider::Remote, remote.ping().await),
            None => (StorageProvider::Local, self.local.ping()),
        };
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        if let Err(err) = &result {
            warn!(provider = provider.as_str(), error = %err, "storage health check failed");
        }
        TierHealth {
            provider,
            healthy: result.is_ok(),
            latency_ms,
            error: result.err().map(|e| e.to_string()),
        }
    }

    async fn route<T, Fut, L>(
        &self,
        operation: &'static str,
        remote: Option<Fut>,
        local: L,
    ) -> (Result<T, StorageError>, ResultMetadata)
    where
        Fut: Future<Output = Result<T, StorageError>>,
        L: FnOnce(&LocalProvider) -> Result<T, StorageError>,
    {
        let started = Instant::now();
        let (result, provider, fallback_used) = match remote {
            None => (local(&self.local), StorageProvider::Local, false),
            Some(call) => match call.await {
                Err(err) if err.is_offline() && self.allow_local_fallback => {
                    warn!(operation, error = %err, "remote storage offline, serving from local store");
                    (local(&self.local), StorageProvider::Local, true)
                }
                other => (other, StorageProvider::Remote, false),
            },
        };
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        {
            let mut metrics = self.metrics.lock();
            metrics.operations += 1;
            metrics.total_latency_ms += latency_ms;
            if fallback_used {
                metrics.fallbacks += 1;
            }
            if result.is_err() {
                metrics.failures += 1;
            }
        }
        if let Err(err) = &result {
            warn!(operation, provider = provider.as_str(), error = %err, "storage operation failed");
        }

        (
            result,
            ResultMetadata {
                provider,
                latency_ms,
                compressed: false,
                fallback_used,
            },
        )
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T, options: &SetOptions) -> Result<(String, bool), StorageError> {
        let value = serde_json::to_value(value)?;
        let stored_at = self.clock.now_ms();
        let expires_at = options
            .ttl
            .map(|ttl| stored_at.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)));

        if options.compress != Some(false) {
            let text = serde_json::to_string(&value)?;
            if self.codec.should_compress(text.len()) {
                let compressed = self.codec.compress(&text);
                if compressed.is_compressed() {
                    let envelope = Envelope::Compressed {
                        algorithm: compressed.algorithm,
                        payload: BASE64.encode(&compressed.payload),
                        original_size: compressed.original_size,
                        stored_at,
                        expires_at,
                    };
                    return Ok((serde_json::to_string(&envelope)?, true));
                }
            }
        }

        let envelope = Envelope::Plain {
            value,
            stored_at,
            expires_at,
        };
        Ok((serde_json::to_string(&envelope)?, false))
    }

    fn decode(&self, raw: &str) -> Result<Decoded, StorageError> {
        let envelope = Envelope::parse(raw)?;
        if envelope.is_expired(self.clock.now_ms()) {
            return Ok(Decoded::Expired);
        }
        let compressed = envelope.is_compressed();
        Ok(Decoded::Live {
            value: envelope.open()?,
            compressed,
        })
    }

    async fn delete_from(&self, provider: StorageProvider, key: &str, language: Option<&str>) {
        let result = match (provider, &self.remote) {
            (StorageProvider::Remote, Some(remote)) => remote.delete(language, key).await,
            _ => self.local.delete(key),
        };
        if let Err(err) = result {
            debug!(key = %key, error = %err, "failed to drop expired value");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{CompressionConfig, RemoteConfig};
    use crate::storage::Priority;
    use serde_json::json;
    use std::time::Duration;

    fn store() -> (TieredStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(10_000));
        let codec = Arc::new(CompressionCodec::new(CompressionConfig::default()));
        let store = TieredStore::local_only(LocalProvider::in_memory().unwrap(), codec, clock.clone());
        (store, clock)
    }

    fn large_progress() -> Value {
        let mut map = serde_json::Map::new();
        for i in 0..120 {
            map.insert(
                format!("basic-nouns:{i}"),
                json!({"wordId": format!("basic-nouns:{i}"), "xp": i, "timesCorrect": 1, "timesIncorrect": 0}),
            );
        }
        Value::Object(map)
    }

    #[tokio::test]
    async fn set_then_get_reports_local_provider() {
        let (store, _) = store();
        let result = store.set("game_state", None, &json!({"level": 2}), SetOptions::default()).await;
        assert!(result.success);

        let read = store.get_value("game_state", None).await;
        assert_eq!(read.data, Some(json!({"level": 2})));
        let meta = read.metadata.unwrap();
        assert_eq!(meta.provider, StorageProvider::Local);
        assert!(!meta.fallback_used);
    }

    #[tokio::test]
    async fn large_values_are_compressed_transparently() {
        let (store, _) = store();
        let value = large_progress();
        let written = store
            .set("word_progress_de", Some("de"), &value, SetOptions::default())
            .await;
        assert!(written.metadata.as_ref().unwrap().compressed);

        let read = store.get_value("word_progress_de", Some("de")).await;
        assert!(read.metadata.as_ref().unwrap().compressed);
        assert_eq!(read.data, Some(value));
    }

    #[tokio::test]
    async fn compression_can_be_disabled_per_write() {
        let (store, _) = store();
        let written = store
            .set("word_progress_de", Some("de"), &large_progress(), SetOptions::uncompressed())
            .await;
        assert!(!written.metadata.unwrap().compressed);
    }

    #[tokio::test]
    async fn expired_values_read_as_absent() {
        let (store, clock) = store();
        let options = SetOptions {
            ttl: Some(Duration::from_millis(100)),
            ..SetOptions::default()
        };
        store.set("session_state", None, &json!({"a": 1}), options).await;
        assert_eq!(store.exists("session_state", None).await.data, Some(true));

        clock.advance_ms(100);
        let read = store.get_value("session_state", None).await;
        assert!(read.success);
        assert!(read.data.is_none());
        assert_eq!(store.get_keys(None).await.data, Some(Vec::<String>::new()));
    }

    #[tokio::test]
    async fn bare_json_is_read_without_envelope() {
        let (store, _) = store();
        store.local.set("legacy", None, "{\"xp\":3}").unwrap();
        assert_eq!(store.get_value("legacy", None).await.data, Some(json!({"xp": 3})));
    }

    #[tokio::test]
    async fn batch_writes_and_reads() {
        let (store, _) = store();
        let items = vec![
            BatchItem {
                key: "word_progress_de".into(),
                language: Some("de".into()),
                value: json!({"a": 1}),
                options: SetOptions::default(),
            },
            BatchItem {
                key: "word_progress_es".into(),
                language: Some("es".into()),
                value: json!({"b": 2}),
                options: SetOptions::with_priority(Priority::High),
            },
        ];
        assert_eq!(store.set_batch(items).await.data, Some(2));

        let keys = vec!["word_progress_de".to_string(), "word_progress_es".to_string(), "missing".to_string()];
        let values = store.get_batch(&keys, None).await.data.unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(store.get_keys(Some("es")).await.data, Some(vec!["word_progress_es".to_string()]));
        assert_eq!(store.clear(Some("de")).await.data, Some(1));
    }

    #[tokio::test]
    async fn typed_get_reports_shape_mismatch() {
        let (store, _) = store();
        store.set("k", None, &json!("text"), SetOptions::default()).await;
        let typed = store.get::<Vec<u32>>("k", None).await;
        assert!(!typed.success);
        assert!(typed.metadata.is_some());
    }

    #[tokio::test]
    async fn offline_remote_falls_back_to_local() {
        let clock = Arc::new(ManualClock::new(0));
        let codec = Arc::new(CompressionCodec::new(CompressionConfig::default()));
        let config = RemoteConfig {
            enabled: true,
            base_url: "http://127.0.0.1:9".into(),
            timeout: Duration::from_millis(200),
            max_retries: 0,
            base_retry_delay: Duration::from_millis(1),
            ..RemoteConfig::default()
        };
        let remote = RemoteProvider::new(&config, "user-1").unwrap();
        let store = TieredStore::new(LocalProvider::in_memory().unwrap(), Some(remote), codec, clock, true);

        let written = store.set("game_state", None, &json!({"level": 1}), SetOptions::default()).await;
        assert!(written.success);
        assert!(written.fallback_used());

        let health = store.health_check().await;
        assert_eq!(health.provider, StorageProvider::Remote);
        assert!(!health.healthy);
        assert_eq!(store.metrics().fallbacks, 1);
    }

    #[tokio::test]
    async fn offline_remote_without_fallback_fails() {
        let clock = Arc::new(ManualClock::new(0));
        let codec = Arc::new(CompressionCodec::new(CompressionConfig::default()));
        let config = RemoteConfig {
            enabled: true,
            base_url: "http://127.0.0.1:9".into(),
            timeout: Duration::from_millis(200),
            max_retries: 0,
            ..RemoteConfig::default()
        };
        let remote = RemoteProvider::new(&config, "user-1").unwrap();
        let store = TieredStore::new(LocalProvider::in_memory().unwrap(), Some(remote), codec, clock, false);

        let result = store.get_value("game_state", None).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("offline"));
    }
}
