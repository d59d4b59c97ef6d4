use std::time::Duration;

pub const GAME_STATE_KEY: &str = "game_state";
pub const SESSION_STATE_KEY: &str = "session_state";
pub const USER_PREFERENCES_KEY: &str = "user_preferences";
pub const ACHIEVEMENTS_KEY: &str = "achievements";
pub const STORAGE_ANALYTICS_KEY: &str = "storage_analytics";

pub const WORD_PROGRESS_PREFIX: &str = "word_progress_";
pub const ANALYTICS_PREFIX: &str = "analytics_";
pub const LANGUAGE_SUMMARY_PREFIX: &str = "language_summary_";
pub const MIGRATION_BACKUP_PREFIX: &str = "migration_backup_";

/// Tag carried by every derived snapshot that must be dropped after any write.
pub const ANY_WRITE_TAG: &str = "storage:any_write";

/// Mastery is time dependent, so anything derived from it stays short lived.
pub const MASTERY_SNAPSHOT_TTL: Duration = Duration::from_secs(60);

pub fn word_progress_key(language_code: &str) -> String {
    format!("{}{}", WORD_PROGRESS_PREFIX, language_code)
}

pub fn analytics_key(language_code: &str) -> String {
    format!("{}{}", ANALYTICS_PREFIX, language_code)
}

pub fn language_summary_key(language_code: &str) -> String {
    format!("{}{}", LANGUAGE_SUMMARY_PREFIX, language_code)
}

pub fn migration_backup_key(timestamp_ms: i64) -> String {
    format!("{}{}", MIGRATION_BACKUP_PREFIX, timestamp_ms)
}

pub fn mastery_snapshot_key(language_code: &str) -> String {
    format!("mastery_snapshot_{}", language_code)
}

/// Language codes end up inside storage keys and remote paths.
pub fn is_valid_language_code(code: &str) -> bool {
    !code.is_empty()
        && code.len() <= 16
        && code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Returns the language of a `word_progress_{lang}` key.
pub fn language_from_progress_key(key: &str) -> Option<&str> {
    key.strip_prefix(WORD_PROGRESS_PREFIX)
        .filter(|lang| is_valid_language_code(lang))
}

/// Groups keys like `word_progress_de` under `word_progress`.
pub fn key_prefix(key: &str) -> &str {
    for prefix in [
        WORD_PROGRESS_PREFIX,
        ANALYTICS_PREFIX,
        LANGUAGE_SUMMARY_PREFIX,
        MIGRATION_BACKUP_PREFIX,
    ] {
        if key.starts_with(prefix) {
            return prefix.trim_end_matches('_');
        }
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_language_prefixed() {
        assert_eq!(word_progress_key("de"), "word_progress_de");
        assert_eq!(analytics_key("es"), "analytics_es");
        assert_eq!(language_from_progress_key("word_progress_de"), Some("de"));
        assert_eq!(language_from_progress_key("game_state"), None);
    }

    #[test]
    fn language_codes_are_validated() {
        assert!(is_valid_language_code("de"));
        assert!(is_valid_language_code("pt-BR"));
        assert!(!is_valid_language_code(""));
        assert!(!is_valid_language_code("de/../es"));
    }

    #[test]
    fn prefixes_group_keys() {
        assert_eq!(key_prefix("word_progress_de"), "word_progress");
        assert_eq!(key_prefix("migration_backup_123"), "migration_backup");
        assert_eq!(key_prefix("game_state"), "game_state");
    }
}
