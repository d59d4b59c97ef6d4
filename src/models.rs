//! Persisted records.
//!
//! Field names follow the camelCase JSON the client already writes. Records that the
//! UI extends freely keep unknown fields in `extra` so they survive a round trip.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QuizDirection {
    TermToDefinition,
    DefinitionToTerm,
}

impl QuizDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            QuizDirection::TermToDefinition => "termToDefinition",
            QuizDirection::DefinitionToTerm => "definitionToTerm",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectionProgress {
    #[serde(default)]
    pub correct: u32,
    #[serde(default)]
    pub incorrect: u32,
    #[serde(default)]
    pub xp: u32,
    #[serde(default)]
    pub streak: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WordProgress {
    pub word_id: String,
    /// Only ever grows on write; decay is derived at read time.
    #[serde(default)]
    pub xp: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_practiced: Option<DateTime<Utc>>,
    #[serde(default)]
    pub times_correct: u32,
    #[serde(default)]
    pub times_incorrect: u32,
    #[serde(default)]
    pub correct_streak: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term_to_definition: Option<DirectionProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition_to_term: Option<DirectionProgress>,
    /// Direction pinned for this word; sessions pick one at random when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<QuizDirection>,
}

impl WordProgress {
    pub fn new(word_id: impl Into<String>) -> Self {
        Self {
            word_id: word_id.into(),
            ..Self::default()
        }
    }

    pub fn is_practiced(&self) -> bool {
        self.times_correct + self.times_incorrect > 0
    }

    pub fn attempts(&self) -> u32 {
        self.times_correct + self.times_incorrect
    }

    pub fn direction_mut(&mut self, direction: QuizDirection) -> &mut DirectionProgress {
        let slot = match direction {
            QuizDirection::TermToDefinition => &mut self.term_to_definition,
            QuizDirection::DefinitionToTerm => &mut self.definition_to_term,
        };
        slot.get_or_insert_with(DirectionProgress::default)
    }
}

/// Word id -> progress for one language. Ordered so exports are stable.
pub type LanguageProgress = BTreeMap<String, WordProgress>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    #[serde(default)]
    pub level: u32,
    #[serde(default)]
    pub score: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_language: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub words_practiced: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPreferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_goal: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Vocabulary entry from a language data file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Word {
    pub id: String,
    pub term: String,
    pub definition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl Word {
    pub fn has_sentence_context(&self) -> bool {
        self.sentence.as_deref().is_some_and(|s| !s.trim().is_empty())
    }
}
