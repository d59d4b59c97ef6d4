use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::grouping::{create_word_groups, ScoredWord, WordGroup};
use super::mastery::{word_mastery, LearningPhase};
use super::quiz::QuizMode;
use super::review::select_words_for_review;
use super::session::{create_learning_session, LearningSession};
use crate::autosave::{AutoSaveQueue, ChangeType};
use crate::cache::keys::{self, MASTERY_SNAPSHOT_TTL};
use crate::clock::Clock;
use crate::facade::StorageFacade;
use crate::models::{LanguageProgress, QuizDirection, Word, WordProgress};
use crate::storage::{Priority, StorageError, StorageResult};

pub const DEFAULT_MAX_REVIEWS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerOutcome {
    pub correct: bool,
    pub quiz_mode: QuizMode,
    #[serde(default)]
    pub direction: Option<QuizDirection>,
    #[serde(default)]
    pub response_time_ms: u64,
}

/// Ties the pure scheduling functions to stored progress.
///
/// Answers are applied to the cached progress right away and persisted through the
/// auto-save queue, so a burst of answers becomes one storage write.
pub struct SchedulerEngine {
    facade: Arc<StorageFacade>,
    queue: Arc<AutoSaveQueue<StorageFacade>>,
    clock: Arc<dyn Clock>,
    rng: Mutex<StdRng>,
    max_reviews: usize,
    /// Serializes read-modify-queue of a language map across answers.
    answers: tokio::sync::Mutex<()>,
}

impl SchedulerEngine {
    pub fn new(
        facade: Arc<StorageFacade>,
        queue: Arc<AutoSaveQueue<StorageFacade>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            facade,
            queue,
            clock,
            rng: Mutex::new(StdRng::from_os_rng()),
            max_reviews: DEFAULT_MAX_REVIEWS,
            answers: tokio::sync::Mutex::new(()),
        }
    }

    /// Deterministic sessions for tests and replays.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn with_max_reviews(mut self, max_reviews: usize) -> Self {
        self.max_reviews = max_reviews;
        self
    }

    pub fn queue(&self) -> &Arc<AutoSaveQueue<StorageFacade>> {
        &self.queue
    }

    /// Word id -> current mastery, cached briefly and dropped whenever the
    /// language's progress changes.
    pub async fn mastery_snapshot(&self, language: &str) -> StorageResult<BTreeMap<String, f64>> {
        let snapshot_key = keys::mastery_snapshot_key(language);
        if let Some(snapshot) = self.facade.cache().get_as::<BTreeMap<String, f64>>(&snapshot_key) {
            return StorageResult::ok(snapshot);
        }

        let progress = match self.load_progress(language).await {
            Ok(progress) => progress,
            Err(err) => return StorageResult::failed(err),
        };
        let now = self.clock.now();
        let snapshot: BTreeMap<String, f64> = progress
            .iter()
            .map(|(id, record)| (id.clone(), word_mastery(record, now)))
            .collect();

        self.facade.cache().set_as(
            &snapshot_key,
            &snapshot,
            Some(MASTERY_SNAPSHOT_TTL),
            [keys::word_progress_key(language)],
        );
        StorageResult::ok(snapshot)
    }

    pub async fn word_groups(&self, language: &str, words: &[Word]) -> StorageResult<Vec<WordGroup>> {
        let snapshot = match self.mastery_snapshot(language).await.into_result() {
            Ok(snapshot) => snapshot.unwrap_or_default(),
            Err(err) => return StorageResult::failed(err),
        };
        let scored: Vec<ScoredWord> = words
            .iter()
            .map(|word| ScoredWord::new(word.id.clone(), snapshot.get(&word.id).copied().unwrap_or(0.0)))
            .collect();
        StorageResult::ok(create_word_groups(&scored))
    }

    /// The weakest unmastered group plus whatever is due for review.
    pub async fn plan_session(
        &self,
        language: &str,
        words: &[Word],
        now: DateTime<Utc>,
    ) -> StorageResult<LearningSession> {
        let progress = match self.load_progress(language).await {
            Ok(progress) => progress,
            Err(err) => return StorageResult::failed(err),
        };

        let scored: Vec<ScoredWord> = words
            .iter()
            .map(|word| {
                let mastery = progress.get(&word.id).map_or(0.0, |record| word_mastery(record, now));
                ScoredWord::new(word.id.clone(), mastery)
            })
            .collect();
        let groups = create_word_groups(&scored);
        let active = groups
            .iter()
            .find(|group| group.phase != LearningPhase::Mastery)
            .or_else(|| groups.first());
        let reviews = select_words_for_review(&progress, now, self.max_reviews);

        let session = {
            let mut rng = self.rng.lock();
            create_learning_session(language, active, &reviews, &progress, words, now, &mut *rng)
        };
        info!(
            language = %language,
            session_id = %session.id,
            group = ?session.group_id,
            words = session.words.len(),
            reviews = session.review_words.len(),
            "session planned"
        );
        StorageResult::ok(session)
    }

    /// Applies one answer, stages the new progress in the cache and queues it for saving.
    pub async fn record_answer(
        &self,
        language: &str,
        word_id: &str,
        outcome: &AnswerOutcome,
    ) -> StorageResult<WordProgress> {
        let _answer = self.answers.lock().await;
        let mut progress = match self.load_progress(language).await {
            Ok(progress) => progress,
            Err(err) => return StorageResult::failed(err),
        };

        let record = progress
            .entry(word_id.to_string())
            .or_insert_with(|| WordProgress::new(word_id));
        apply_outcome(record, outcome, self.clock.now());
        let updated = record.clone();

        let staged = self.facade.stage_word_progress(language, &progress);
        if !staged.success {
            return staged.discard();
        }
        let data = match serde_json::to_value(&progress) {
            Ok(data) => data,
            Err(err) => return StorageResult::failed(StorageError::from(err)),
        };
        self.queue
            .queue_change(ChangeType::WordProgress, data, Some(language), Priority::Medium)
            .await;

        debug!(
            language = %language,
            word_id = %word_id,
            correct = outcome.correct,
            mode = %outcome.quiz_mode,
            xp = updated.xp,
            "answer recorded"
        );
        StorageResult::ok(updated)
    }

    /// Unsaved progress in the queue wins over the cache and the store.
    async fn load_progress(&self, language: &str) -> Result<LanguageProgress, StorageError> {
        if let Some(data) = self.queue.latest_data(ChangeType::WordProgress, Some(language)) {
            return serde_json::from_value(data).map_err(StorageError::from);
        }
        let result = self.facade.load_word_progress(language).await;
        if result.fallback_used() {
            warn!(language = %language, "progress served from local fallback");
        }
        result.into_result().map(Option::unwrap_or_default)
    }
}

fn apply_outcome(record: &mut WordProgress, outcome: &AnswerOutcome, now: DateTime<Utc>) {
    let reward = outcome.quiz_mode.xp_reward();
    if outcome.correct {
        record.xp = record.xp.saturating_add(reward);
        record.times_correct += 1;
        record.correct_streak += 1;
    } else {
        record.times_incorrect += 1;
        record.correct_streak = 0;
    }

    if let Some(direction) = outcome.direction {
        let sub = record.direction_mut(direction);
        if outcome.correct {
            sub.correct += 1;
            sub.xp = sub.xp.saturating_add(reward);
            sub.streak += 1;
        } else {
            sub.incorrect += 1;
            sub.streak = 0;
        }
    }
    record.last_practiced = Some(now);
}
