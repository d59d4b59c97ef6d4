use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::cache::keys::is_valid_language_code;
use crate::models::Word;

#[derive(Debug, Error)]
pub enum LanguageDataError {
    #[error("Invalid language code: {0:?}")]
    InvalidCode(String),

    #[error("No word list for {code} at {}", path.display())]
    NotFound { code: String, path: PathBuf },

    #[error("Failed to read word list for {code}: {source}")]
    Io {
        code: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed word list for {code}: {source}")]
    Parse {
        code: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Word lists read from `{data_dir}/{code}.json`, each loaded once and shared.
pub struct LanguageDataStore {
    data_dir: PathBuf,
    loaded: RwLock<HashMap<String, Arc<Vec<Word>>>>,
}

impl LanguageDataStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            loaded: RwLock::new(HashMap::new()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub async fn get_or_load(&self, code: &str) -> Result<Arc<Vec<Word>>, LanguageDataError> {
        if !is_valid_language_code(code) {
            return Err(LanguageDataError::InvalidCode(code.to_string()));
        }
        if let Some(words) = self.loaded.read().await.get(code) {
            return Ok(words.clone());
        }

        let path = self.data_dir.join(format!("{code}.json"));
        let raw = tokio::fs::read(&path).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                LanguageDataError::NotFound {
                    code: code.to_string(),
                    path: path.clone(),
                }
            } else {
                LanguageDataError::Io {
                    code: code.to_string(),
                    source,
                }
            }
        })?;
        let words: Vec<Word> = serde_json::from_slice(&raw).map_err(|source| LanguageDataError::Parse {
            code: code.to_string(),
            source,
        })?;
        info!(language = %code, words = words.len(), "word list loaded");

        // A concurrent load may have won; keep whichever landed first.
        let mut loaded = self.loaded.write().await;
        let words = loaded
            .entry(code.to_string())
            .or_insert_with(|| Arc::new(words))
            .clone();
        Ok(words)
    }

    pub async fn is_loaded(&self, code: &str) -> bool {
        self.loaded.read().await.contains_key(code)
    }

    pub async fn loaded_languages(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.loaded.read().await.keys().cloned().collect();
        codes.sort();
        codes
    }

    pub async fn evict(&self, code: &str) -> bool {
        let removed = self.loaded.write().await.remove(code).is_some();
        if removed {
            debug!(language = %code, "word list evicted");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_list(dir: &TempDir, code: &str, body: &str) {
        std::fs::write(dir.path().join(format!("{code}.json")), body).unwrap();
    }

    #[tokio::test]
    async fn loads_once_and_shares() {
        let dir = TempDir::new().unwrap();
        write_list(
            &dir,
            "de",
            r#"[{"id":"basic-nouns:1","term":"Haus","definition":"house","sentence":"Das Haus ist alt."}]"#,
        );
        let store = LanguageDataStore::new(dir.path());

        let first = store.get_or_load("de").await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(first[0].has_sentence_context());
        assert!(store.is_loaded("de").await);

        std::fs::remove_file(dir.path().join("de.json")).unwrap();
        let second = store.get_or_load("de").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        assert!(store.evict("de").await);
        assert!(matches!(
            store.get_or_load("de").await,
            Err(LanguageDataError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn rejects_bad_codes_and_bad_json() {
        let dir = TempDir::new().unwrap();
        write_list(&dir, "es", "{not json");
        let store = LanguageDataStore::new(dir.path());

        assert!(matches!(
            store.get_or_load("../es").await,
            Err(LanguageDataError::InvalidCode(_))
        ));
        assert!(matches!(
            store.get_or_load("es").await,
            Err(LanguageDataError::Parse { .. })
        ));
        assert!(store.loaded_languages().await.is_empty());
    }
}
