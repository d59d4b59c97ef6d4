//! SQLite-backed key/value tier.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use super::StorageError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL,
    language_code TEXT,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_kv_store_language ON kv_store(language_code);
";

/// Synchronous store holding raw envelope text per key. Every method is a short,
/// single-statement transaction, so callers on the async side run them inline.
#[derive(Clone)]
pub struct LocalProvider {
    conn: Arc<Mutex<Connection>>,
    location: String,
}

impl LocalProvider {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let location = path.as_ref().to_string_lossy().to_string();
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::InvalidData(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
        }

        let connection = Connection::open(&path)?;
        connection.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )?;
        connection.execute_batch(SCHEMA)?;
        info!(path = %location, "local store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(connection)),
            location,
        })
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        let connection = Connection::open_in_memory()?;
        connection.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(connection)),
            location: ":memory:".to_string(),
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|e| StorageError::LockError(e.to_string()))
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set(&self, key: &str, language: Option<&str>, value: &str) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO kv_store (key, value, language_code, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                language_code = excluded.language_code,
                updated_at = excluded.updated_at",
            params![key, value, language, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let conn = self.lock()?;
        let affected = conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(affected > 0)
    }

    pub fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let conn = self.lock()?;
        let found: i64 = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM kv_store WHERE key = ?1)",
            params![key],
            |row| row.get(0),
        )?;
        Ok(found == 1)
    }

    pub fn get_batch(&self, keys: &[String]) -> Result<HashMap<String, String>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached("SELECT value FROM kv_store WHERE key = ?1")?;
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            let value = stmt
                .query_row(params![key], |row| row.get::<_, String>(0))
                .optional()?;
            if let Some(value) = value {
                out.insert(key.clone(), value);
            }
        }
        Ok(out)
    }

    /// Writes all rows in one transaction; either every row lands or none does.
    pub fn set_batch(&self, rows: &[(String, Option<String>, String)]) -> Result<usize, StorageError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock()?;
        let now = Utc::now().timestamp_millis();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO kv_store (key, value, language_code, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    language_code = excluded.language_code,
                    updated_at = excluded.updated_at",
            )?;
            for (key, language, value) in rows {
                stmt.execute(params![key, value, language, now])?;
            }
        }
        tx.commit()?;
        debug!(rows = rows.len(), "local batch write committed");
        Ok(rows.len())
    }

    /// Keys in insertion-independent sorted order, optionally limited to one language.
    pub fn keys(&self, language: Option<&str>) -> Result<Vec<String>, StorageError> {
        let conn = self.lock()?;
        let keys = match language {
            Some(language) => {
                let mut stmt =
                    conn.prepare("SELECT key FROM kv_store WHERE language_code = ?1 ORDER BY key")?;
                let rows = stmt.query_map(params![language], |row| row.get::<_, String>(0))?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare("SELECT key FROM kv_store ORDER BY key")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(keys)
    }

    pub fn clear(&self, language: Option<&str>) -> Result<usize, StorageError> {
        let conn = self.lock()?;
        let removed = match language {
            Some(language) => conn.execute(
                "DELETE FROM kv_store WHERE language_code = ?1",
                params![language],
            )?,
            None => conn.execute("DELETE FROM kv_store", [])?,
        };
        Ok(removed)
    }

    pub fn ping(&self) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crud_round_trip() {
        let store = LocalProvider::in_memory().unwrap();
        assert_eq!(store.get("k").unwrap(), None);

        store.set("k", None, "v1").unwrap();
        store.set("k", None, "v2").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v2"));
        assert!(store.exists("k").unwrap());

        assert!(store.delete("k").unwrap());
        assert!(!store.delete("k").unwrap());
        assert!(!store.exists("k").unwrap());
    }

    #[test]
    fn keys_and_clear_filter_by_language() {
        let store = LocalProvider::in_memory().unwrap();
        store
            .set_batch(&[
                ("word_progress_de".into(), Some("de".into()), "{}".into()),
                ("analytics_de".into(), Some("de".into()), "{}".into()),
                ("word_progress_es".into(), Some("es".into()), "{}".into()),
                ("game_state".into(), None, "{}".into()),
            ])
            .unwrap();

        assert_eq!(
            store.keys(Some("de")).unwrap(),
            vec!["analytics_de".to_string(), "word_progress_de".to_string()]
        );
        assert_eq!(store.keys(None).unwrap().len(), 4);

        assert_eq!(store.clear(Some("de")).unwrap(), 2);
        assert_eq!(store.keys(None).unwrap().len(), 2);
    }

    #[test]
    fn batch_get_skips_missing() {
        let store = LocalProvider::in_memory().unwrap();
        store.set("a", None, "1").unwrap();
        let found = store
            .get_batch(&["a".to_string(), "b".to_string()])
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found.get("a").map(String::as_str), Some("1"));
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.db");
        {
            let store = LocalProvider::open(&path).unwrap();
            store.set("game_state", None, "{\"level\":3}").unwrap();
        }
        let reopened = LocalProvider::open(&path).unwrap();
        assert_eq!(
            reopened.get("game_state").unwrap().as_deref(),
            Some("{\"level\":3}")
        );
        assert!(reopened.ping().is_ok());
    }
}
