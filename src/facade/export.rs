use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::{LanguageSummary, StorageFacade};
use crate::cache::keys;
use crate::models::{GameState, LanguageProgress, SessionState, UserPreferences};
use crate::storage::{SetOptions, StorageError, StorageResult};

pub const EXPORT_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMetadata {
    pub total_languages: usize,
    pub language_stats: BTreeMap<String, LanguageSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub version: String,
    pub export_date: DateTime<Utc>,
    #[serde(default)]
    pub word_progress: BTreeMap<String, LanguageProgress>,
    #[serde(default)]
    pub game_state: Option<GameState>,
    #[serde(default)]
    pub session_state: Option<SessionState>,
    #[serde(default)]
    pub user_preferences: Option<UserPreferences>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub achievements: Option<Value>,
    pub metadata: ExportMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub backup_key: String,
    pub languages_imported: usize,
    pub sections_imported: usize,
}

impl StorageFacade {
    pub async fn export_data(&self) -> StorageResult<ExportDocument> {
        let languages = match self.available_languages().await.into_result() {
            Ok(languages) => languages.unwrap_or_default(),
            Err(err) => return StorageResult::failed(err),
        };

        let mut word_progress = BTreeMap::new();
        for language in &languages {
            match self.load_word_progress(language).await.into_result() {
                Ok(progress) => {
                    word_progress.insert(language.clone(), progress.unwrap_or_default());
                }
                Err(err) => return StorageResult::failed(err),
            }
        }

        let game_state = match self.load_game_state().await.into_result() {
            Ok(state) => state,
            Err(err) => return StorageResult::failed(err),
        };
        let session_state = match self.load_session_state().await.into_result() {
            Ok(state) => state,
            Err(err) => return StorageResult::failed(err),
        };
        let user_preferences = match self.load_user_preferences().await.into_result() {
            Ok(preferences) => preferences,
            Err(err) => return StorageResult::failed(err),
        };
        let achievements = match self.load_achievements().await.into_result() {
            Ok(achievements) => achievements,
            Err(err) => return StorageResult::failed(err),
        };

        let language_stats = word_progress
            .iter()
            .map(|(language, progress)| (language.clone(), LanguageSummary::from_progress(language, progress)))
            .collect();

        StorageResult::ok(ExportDocument {
            version: EXPORT_VERSION.to_string(),
            export_date: self.clock.now(),
            metadata: ExportMetadata {
                total_languages: word_progress.len(),
                language_stats,
            },
            word_progress,
            game_state,
            session_state,
            user_preferences,
            achievements,
        })
    }

    /// Backs up the current data under `migration_backup_{ts}`, then writes every
    /// section of `document`. Stops at the first failed section.
    pub async fn import_data(&self, document: &ExportDocument) -> StorageResult<ImportReport> {
        for language in document.word_progress.keys() {
            if !keys::is_valid_language_code(language) {
                return StorageResult::failed(StorageError::InvalidData(format!(
                    "invalid language code in import: {language:?}"
                )));
            }
        }

        let current = match self.export_data().await.into_result() {
            Ok(Some(current)) => current,
            Ok(None) => return StorageResult::failed(StorageError::NotFound("current export".into())),
            Err(err) => return StorageResult::failed(err),
        };
        let backup_key = keys::migration_backup_key(self.now_ms());
        let backup = self
            .store
            .set(&backup_key, None, &current, SetOptions::default())
            .await;
        if !backup.success {
            warn!(error = ?backup.error, "import aborted, backup could not be written");
            return backup.discard();
        }

        let mut report = ImportReport {
            backup_key,
            languages_imported: 0,
            sections_imported: 0,
        };

        for (language, progress) in &document.word_progress {
            let result = self.save_word_progress(language, progress).await;
            if !result.success {
                return result.discard();
            }
            report.languages_imported += 1;
        }
        if !document.word_progress.is_empty() {
            report.sections_imported += 1;
        }

        if let Some(state) = &document.game_state {
            let result = self.save_game_state(state).await;
            if !result.success {
                return result.discard();
            }
            report.sections_imported += 1;
        }
        if let Some(state) = &document.session_state {
            let result = self.save_session_state(state).await;
            if !result.success {
                return result.discard();
            }
            report.sections_imported += 1;
        }
        if let Some(preferences) = &document.user_preferences {
            let result = self.save_user_preferences(preferences).await;
            if !result.success {
                return result.discard();
            }
            report.sections_imported += 1;
        }
        if let Some(achievements) = &document.achievements {
            let result = self.save_achievements(achievements).await;
            if !result.success {
                return result.discard();
            }
            report.sections_imported += 1;
        }

        info!(
            backup = %report.backup_key,
            languages = report.languages_imported,
            sections = report.sections_imported,
            "import finished"
        );
        StorageResult::ok(report)
    }
}
