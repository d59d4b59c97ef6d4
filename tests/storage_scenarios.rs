//! End-to-end storage behaviour: facade, cache, tiered store and auto-save together.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use danci_core::autosave::{AutoSaveQueue, ChangeType};
use danci_core::cache::DependencyCache;
use danci_core::clock::{Clock, ManualClock};
use danci_core::compression::CompressionCodec;
use danci_core::config::{AutoSaveConfig, CacheConfig, CompressionConfig, FacadeConfig, RemoteConfig};
use danci_core::facade::StorageFacade;
use danci_core::models::{LanguageProgress, WordProgress};
use danci_core::storage::{LocalProvider, Priority, RemoteProvider, SetOptions, TieredStore};

const START_MS: i64 = 1_700_000_000_000;

fn facade_over(local: LocalProvider, clock: Arc<ManualClock>) -> Arc<StorageFacade> {
    let codec = Arc::new(CompressionCodec::new(CompressionConfig::default()));
    let store = Arc::new(TieredStore::local_only(local, codec, clock.clone()));
    let cache = Arc::new(DependencyCache::new(CacheConfig::default(), clock.clone()));
    Arc::new(StorageFacade::new(store, cache, clock, FacadeConfig::default()))
}

fn offline_remote() -> RemoteProvider {
    let config = RemoteConfig {
        enabled: true,
        base_url: "http://127.0.0.1:9".into(),
        timeout: Duration::from_millis(200),
        max_retries: 0,
        base_retry_delay: Duration::from_millis(1),
        ..RemoteConfig::default()
    };
    RemoteProvider::new(&config, "user-1").unwrap()
}

#[tokio::test]
async fn language_progress_never_leaks_across_languages() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("progress.db");
    let clock = Arc::new(ManualClock::new(START_MS));

    let facade = facade_over(LocalProvider::open(&path).unwrap(), clock.clone());
    let mut de = LanguageProgress::new();
    de.insert(
        "basic-nouns:1".into(),
        WordProgress {
            xp: 15,
            times_correct: 3,
            ..WordProgress::new("basic-nouns:1")
        },
    );
    assert!(facade.save_word_progress("de", &de).await.success);

    let es = facade.load_word_progress("es").await;
    assert!(es.success);
    assert!(es.data.unwrap().is_empty());

    let reopened = facade_over(LocalProvider::open(&path).unwrap(), clock);
    let loaded = reopened.load_word_progress("de").await.data.unwrap();
    assert_eq!(loaded["basic-nouns:1"].xp, 15);
    assert!(reopened.load_word_progress("es").await.data.unwrap().is_empty());
    assert_eq!(reopened.available_languages().await.data.unwrap(), ["de"]);
}

#[tokio::test]
async fn rapid_game_state_changes_become_one_write() {
    let clock = Arc::new(ManualClock::new(START_MS));
    let facade = facade_over(LocalProvider::in_memory().unwrap(), clock.clone());
    let queue = AutoSaveQueue::new(AutoSaveConfig::default(), facade.clone(), clock.clone());

    for level in [10, 20, 30] {
        queue
            .queue_change(ChangeType::GameState, json!({ "level": level }), None, Priority::Medium)
            .await;
        clock.advance_ms(10);
    }
    assert_eq!(queue.pending_count(), 1);

    let report = queue.flush().await;
    assert_eq!(report.written, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(queue.pending_count(), 0);

    facade.cache().clear();
    assert_eq!(facade.load_game_state().await.data.unwrap().level, 30);
}

#[test]
fn dependency_invalidation_is_exact() {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(START_MS));
    let cache = DependencyCache::new(CacheConfig::default(), clock);
    for key in ["summary_de", "mastery_de", "groups_de"] {
        cache.set(key, json!(key), None, ["word_progress_de"]);
    }
    cache.set("summary_es", json!(1), None, ["word_progress_es"]);
    cache.set("untagged", json!(2), None, danci_core::cache::NO_DEPENDENCIES);

    assert_eq!(cache.invalidate_by_dependency("word_progress_de"), 3);
    assert!(!cache.contains("summary_de"));
    assert!(!cache.contains("mastery_de"));
    assert!(!cache.contains("groups_de"));
    assert!(cache.contains("summary_es"));
    assert!(cache.contains("untagged"));
    assert_eq!(cache.invalidate_by_dependency("word_progress_de"), 0);
}

#[test]
fn entries_expire_exactly_at_ttl() {
    let clock = Arc::new(ManualClock::new(START_MS));
    let cache = DependencyCache::new(CacheConfig::default(), clock.clone());
    cache.set("k", json!("v"), Some(Duration::from_secs(1)), danci_core::cache::NO_DEPENDENCIES);

    clock.advance_ms(999);
    assert_eq!(cache.get("k"), Some(json!("v")));
    clock.advance_ms(1);
    assert_eq!(cache.get("k"), None);
    assert_eq!(cache.stats().expirations, 1);
}

#[test]
fn least_recently_used_entry_is_evicted_first() {
    let clock = Arc::new(ManualClock::new(START_MS));
    let config = CacheConfig {
        max_entries: 3,
        ..CacheConfig::default()
    };
    let cache = DependencyCache::new(config, clock.clone());
    for key in ["a", "b", "c"] {
        cache.set(key, json!(key), None, danci_core::cache::NO_DEPENDENCIES);
        clock.advance_ms(1);
    }
    assert!(cache.get("a").is_some());
    cache.set("d", json!("d"), None, danci_core::cache::NO_DEPENDENCIES);

    assert!(!cache.contains("b"));
    assert!(cache.contains("a"));
    assert!(cache.contains("c"));
    assert!(cache.contains("d"));
    assert_eq!(cache.stats().evictions, 1);
}

#[tokio::test]
async fn offline_remote_falls_back_to_local() {
    let clock = Arc::new(ManualClock::new(START_MS));
    let codec = Arc::new(CompressionCodec::new(CompressionConfig::default()));
    let store = TieredStore::new(
        LocalProvider::in_memory().unwrap(),
        Some(offline_remote()),
        codec,
        clock,
        true,
    );

    let written = store
        .set("game_state", None, &json!({"level": 4}), SetOptions::default())
        .await;
    assert!(written.success);
    assert!(written.fallback_used());

    let read = store.get_value("game_state", None).await;
    assert_eq!(read.data, Some(json!({"level": 4})));
    assert!(read.fallback_used());
    assert!(store.metrics().fallbacks >= 2);
}

#[tokio::test]
async fn large_progress_is_compressed_and_reads_back() {
    let clock = Arc::new(ManualClock::new(START_MS));
    let facade = facade_over(LocalProvider::in_memory().unwrap(), clock);
    let progress: LanguageProgress = (0..300)
        .map(|i| {
            let id = format!("basic-nouns:{i}");
            (id.clone(), WordProgress { xp: i, ..WordProgress::new(id) })
        })
        .collect();

    assert!(facade.save_word_progress("ja", &progress).await.success);
    assert!(facade.store().codec().stats().compressed > 0);

    facade.cache().clear();
    assert_eq!(facade.load_word_progress("ja").await.data.unwrap(), progress);
}
