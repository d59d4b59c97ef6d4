use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::grouping::WordGroup;
use super::mastery::{word_mastery, LearningPhase};
use super::quiz::{select_quiz_mode, QuizMode, SessionContext};
use super::review::ReviewCandidate;
use crate::models::{LanguageProgress, QuizDirection, Word};

const LOW_ACCURACY: f64 = 70.0;
const HIGH_ACCURACY: f64 = 90.0;
const HIGH_STRUGGLING_SHARE: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemSource {
    Group,
    Review,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionWord {
    pub word_id: String,
    pub source: ItemSource,
    pub quiz_mode: QuizMode,
    pub direction: QuizDirection,
    pub mastery: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningSession {
    pub id: String,
    pub language_code: String,
    pub group_id: Option<String>,
    pub words: Vec<SessionWord>,
    pub review_words: Vec<SessionWord>,
    pub session_type: SessionContext,
    pub created_at: DateTime<Utc>,
}

impl LearningSession {
    pub fn len(&self) -> usize {
        self.words.len() + self.review_words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty() && self.review_words.is_empty()
    }
}

fn random_direction<R: Rng + ?Sized>(rng: &mut R) -> QuizDirection {
    if rng.random_bool(0.5) {
        QuizDirection::TermToDefinition
    } else {
        QuizDirection::DefinitionToTerm
    }
}

struct SessionBuilder<'a, R: Rng + ?Sized> {
    progress: &'a LanguageProgress,
    catalog: HashMap<&'a str, &'a Word>,
    now: DateTime<Utc>,
    rng: &'a mut R,
}

impl<R: Rng + ?Sized> SessionBuilder<'_, R> {
    fn item(&mut self, word_id: &str, source: ItemSource, context: SessionContext) -> SessionWord {
        let record = self.progress.get(word_id);
        let mastery = record.map_or(0.0, |record| word_mastery(record, self.now));
        let quiz_mode = select_quiz_mode(mastery, context, self.catalog.get(word_id).copied(), self.rng);
        let direction = match record.and_then(|record| record.direction) {
            Some(direction) => direction,
            None => random_direction(self.rng),
        };
        SessionWord {
            word_id: word_id.to_string(),
            source,
            quiz_mode,
            direction,
            mastery,
        }
    }
}

/// Group words plus due reviews, each with a quiz mode and direction.
pub fn create_learning_session<R: Rng + ?Sized>(
    language: &str,
    group: Option<&WordGroup>,
    reviews: &[ReviewCandidate],
    progress: &LanguageProgress,
    catalog: &[Word],
    now: DateTime<Utc>,
    rng: &mut R,
) -> LearningSession {
    let group_context = match group.map(|group| group.phase) {
        Some(LearningPhase::Introduction) => SessionContext::Introduction,
        Some(_) => SessionContext::Practice,
        None => SessionContext::Review,
    };

    let mut builder = SessionBuilder {
        progress,
        catalog: catalog.iter().map(|word| (word.id.as_str(), word)).collect(),
        now,
        rng,
    };

    let group_ids: HashSet<&str> = group
        .map(|group| group.word_ids.iter().map(String::as_str).collect())
        .unwrap_or_default();
    let words: Vec<SessionWord> = group
        .map(|group| group.word_ids.as_slice())
        .unwrap_or_default()
        .iter()
        .map(|id| builder.item(id, ItemSource::Group, group_context))
        .collect();
    let review_words: Vec<SessionWord> = reviews
        .iter()
        .filter(|candidate| !group_ids.contains(candidate.word_id.as_str()))
        .map(|candidate| builder.item(&candidate.word_id, ItemSource::Review, SessionContext::Review))
        .collect();

    let session_type = if words.is_empty() {
        SessionContext::Review
    } else {
        group_context
    };

    LearningSession {
        id: Uuid::new_v4().to_string(),
        language_code: language.to_string(),
        group_id: group.map(|group| group.id.clone()),
        words,
        review_words,
        session_type,
        created_at: now,
    }
}

/// Group and review items shuffled together so neither block comes first.
pub fn interleave_session_words<R: Rng + ?Sized>(session: &LearningSession, rng: &mut R) -> Vec<SessionWord> {
    let mut items: Vec<SessionWord> = session
        .words
        .iter()
        .chain(session.review_words.iter())
        .cloned()
        .collect();
    items.shuffle(rng);
    items
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResult {
    pub word_id: String,
    pub correct: bool,
    pub quiz_mode: QuizMode,
    pub response_time_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAnalysis {
    pub total_answers: usize,
    pub correct_answers: usize,
    /// Percent, 0-100.
    pub accuracy: f64,
    pub struggling_words: Vec<String>,
    pub struggling_share: f64,
    pub fastest_mode: Option<QuizMode>,
    pub average_response_ms: f64,
    pub recommendations: Vec<String>,
}

pub fn analyze_session_performance(results: &[SessionResult]) -> SessionAnalysis {
    if results.is_empty() {
        return SessionAnalysis::default();
    }

    let total_answers = results.len();
    let correct_answers = results.iter().filter(|result| result.correct).count();
    let accuracy = correct_answers as f64 / total_answers as f64 * 100.0;

    let mut seen = HashSet::new();
    let mut struggling = HashSet::new();
    let mut struggling_words = Vec::new();
    for result in results {
        seen.insert(result.word_id.as_str());
        if !result.correct && struggling.insert(result.word_id.as_str()) {
            struggling_words.push(result.word_id.clone());
        }
    }
    let struggling_share = struggling_words.len() as f64 / seen.len() as f64;

    let mut timings: HashMap<QuizMode, (u64, u64)> = HashMap::new();
    for result in results {
        let slot = timings.entry(result.quiz_mode).or_default();
        slot.0 += result.response_time_ms;
        slot.1 += 1;
    }
    let fastest_mode = QuizMode::ALL
        .into_iter()
        .filter_map(|mode| {
            timings
                .get(&mode)
                .map(|(total, count)| (mode, *total as f64 / *count as f64))
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(mode, _)| mode);
    let average_response_ms =
        results.iter().map(|result| result.response_time_ms as f64).sum::<f64>() / total_answers as f64;

    let mut recommendations = Vec::new();
    if accuracy < LOW_ACCURACY {
        recommendations.push("Accuracy is low; practice these words with easier quiz modes".to_string());
    }
    if struggling_share > HIGH_STRUGGLING_SHARE {
        recommendations.push("Many words were missed; try smaller word groups".to_string());
    }
    if accuracy > HIGH_ACCURACY {
        recommendations.push("Strong session; move on to harder quiz modes".to_string());
    }

    SessionAnalysis {
        total_answers,
        correct_answers,
        accuracy,
        struggling_words,
        struggling_share,
        fastest_mode,
        average_response_ms,
        recommendations,
    }
}
