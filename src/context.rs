//! Application root. Builds one instance of every service and owns the background
//! tasks that keep them tidy.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::account::AccountClient;
use crate::autosave::{AutoSaveQueue, FlushReport};
use crate::cache::DependencyCache;
use crate::clock::{Clock, SystemClock};
use crate::compression::CompressionCodec;
use crate::config::AppConfig;
use crate::facade::{ExportDocument, ImportReport, StorageFacade, StorageHealth};
use crate::learning::{LanguageDataStore, SchedulerEngine};
use crate::storage::{LocalProvider, RemoteProvider, StorageError, StorageResult, TieredStore};

pub struct AppContext {
    pub config: AppConfig,
    pub clock: Arc<dyn Clock>,
    pub cache: Arc<DependencyCache>,
    pub store: Arc<TieredStore>,
    pub facade: Arc<StorageFacade>,
    pub autosave: Arc<AutoSaveQueue<StorageFacade>>,
    pub scheduler: Arc<SchedulerEngine>,
    pub language_data: Arc<LanguageDataStore>,
    pub account: Option<Arc<AccountClient>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Result<Self, StorageError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: AppConfig, clock: Arc<dyn Clock>) -> Result<Self, StorageError> {
        let local = match &config.local.path {
            Some(path) => LocalProvider::open(path)?,
            None => LocalProvider::in_memory()?,
        };

        let remote = if config.remote.enabled {
            let user_id = config.remote.user_id.clone().unwrap_or_else(|| {
                let generated = Uuid::new_v4().to_string();
                warn!(user_id = %generated, "REMOTE_USER_ID not set, using a generated id");
                generated
            });
            Some(RemoteProvider::new(&config.remote, user_id)?)
        } else {
            None
        };

        let account = if config.remote.enabled {
            match AccountClient::new(&config.remote, &config.account, clock.clone()) {
                Ok(client) => Some(Arc::new(client)),
                Err(err) => {
                    warn!(error = %err, "account linking unavailable");
                    None
                }
            }
        } else {
            None
        };

        let codec = Arc::new(CompressionCodec::new(config.compression.clone()));
        let cache = Arc::new(DependencyCache::new(config.cache.clone(), clock.clone()));
        let store = Arc::new(TieredStore::new(
            local,
            remote,
            codec,
            clock.clone(),
            config.remote.allow_local_fallback,
        ));
        let facade = Arc::new(StorageFacade::new(
            store.clone(),
            cache.clone(),
            clock.clone(),
            config.facade.clone(),
        ));
        let autosave = Arc::new(AutoSaveQueue::new(
            config.autosave.clone(),
            facade.clone(),
            clock.clone(),
        ));
        let scheduler = Arc::new(SchedulerEngine::new(
            facade.clone(),
            autosave.clone(),
            clock.clone(),
        ));
        let language_data = Arc::new(LanguageDataStore::new(config.data_dir.clone()));
        let (shutdown_tx, _) = broadcast::channel(1);

        info!(
            primary = store.primary().as_str(),
            local = store.local().location(),
            autosave = config.autosave.enabled,
            "application context ready"
        );

        Ok(Self {
            config,
            clock,
            cache,
            store,
            facade,
            autosave,
            scheduler,
            language_data,
            account,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Starts the cache sweep and the auto-save timers. Needs a tokio runtime.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if tasks.is_empty() {
            tasks.push(self.cache.spawn_cleanup(self.shutdown_tx.subscribe()));
        }
        drop(tasks);
        self.autosave.start();
    }

    pub async fn health(&self) -> StorageResult<StorageHealth> {
        self.facade
            .get_storage_health(self.autosave.pending_count())
            .await
    }

    /// Exports after flushing, so languages that only exist in queued changes are
    /// included.
    pub async fn export_data(&self) -> StorageResult<ExportDocument> {
        self.flush_before("export").await;
        self.facade.export_data().await
    }

    /// Flushes queued changes before importing so they cannot land afterwards and
    /// overwrite the imported sections.
    pub async fn import_data(&self, document: &ExportDocument) -> StorageResult<ImportReport> {
        self.flush_before("import").await;
        self.facade.import_data(document).await
    }

    async fn flush_before(&self, operation: &'static str) {
        let report = self.autosave.flush().await;
        if report.failed > 0 {
            warn!(operation, failed = report.failed, "pending changes could not be saved first");
        }
    }

    /// Flushes pending changes and stops every background task.
    pub async fn shutdown(&self) -> FlushReport {
        let report = self.autosave.stop().await;
        let _ = self.shutdown_tx.send(());
        let handles: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "background task ended abnormally");
            }
        }
        info!(written = report.written, failed = report.failed, "application context shut down");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autosave::ChangeType;
    use crate::learning::AnswerOutcome;
    use crate::learning::quiz::QuizMode;
    use crate::models::WordProgress;
    use crate::storage::Priority;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn builds_local_only_context_and_flushes_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.local.path = Some(dir.path().join("store.db"));
        config.data_dir = dir.path().to_path_buf();

        let ctx = AppContext::new(config.clone()).unwrap();
        assert!(ctx.account.is_none());
        ctx.start();
        ctx.autosave
            .queue_change(ChangeType::GameState, json!({"level": 3}), None, Priority::High)
            .await;
        let report = ctx.shutdown().await;
        assert_eq!(report.written, 1);

        let reopened = AppContext::new(config).unwrap();
        let state = reopened.facade.load_game_state().await.data.unwrap();
        assert_eq!(state.level, 3);
        assert!(reopened.health().await.data.unwrap().backend.healthy);
    }

    fn answer() -> AnswerOutcome {
        AnswerOutcome {
            correct: true,
            quiz_mode: QuizMode::MultipleChoice,
            direction: None,
            response_time_ms: 900,
        }
    }

    #[tokio::test]
    async fn export_includes_languages_still_in_the_queue() {
        let ctx = AppContext::new(AppConfig::default()).unwrap();
        ctx.scheduler.record_answer("fr", "w1", &answer()).await;
        assert_eq!(ctx.autosave.pending_count(), 1);

        let doc = ctx.export_data().await.data.unwrap();
        assert!(doc.word_progress["fr"].contains_key("w1"));
        assert_eq!(ctx.autosave.pending_count(), 0);
    }

    #[tokio::test]
    async fn queued_answers_do_not_overwrite_an_import() {
        let ctx = AppContext::new(AppConfig::default()).unwrap();
        let mut doc = ctx.export_data().await.data.unwrap();
        doc.word_progress.insert(
            "fr".into(),
            [("imported".to_string(), WordProgress::new("imported"))].into_iter().collect(),
        );

        ctx.scheduler.record_answer("fr", "w1", &answer()).await;
        assert!(ctx.import_data(&doc).await.success);
        ctx.autosave.flush().await;
        ctx.cache.clear();

        let fr = ctx.facade.load_word_progress("fr").await.data.unwrap();
        assert_eq!(fr.keys().collect::<Vec<_>>(), ["imported"]);
        ctx.shutdown().await;
    }
}
