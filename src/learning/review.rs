use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::mastery::{word_mastery, LearningPhase};
use crate::models::LanguageProgress;

/// Base interval per correct streak: 1h, 4h, 1d, 3d, 1w, 30d.
pub const REVIEW_INTERVAL_HOURS: [i64; 6] = [1, 4, 24, 72, 168, 720];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewTier {
    Struggling,
    Learning,
    Learned,
    Mastered,
}

impl ReviewTier {
    pub fn from_mastery(mastery: f64) -> Self {
        match LearningPhase::from_mastery(mastery) {
            LearningPhase::Introduction => ReviewTier::Struggling,
            LearningPhase::Learning => ReviewTier::Learning,
            LearningPhase::Consolidation => ReviewTier::Learned,
            LearningPhase::Mastery => ReviewTier::Mastered,
        }
    }

    pub fn factor(self) -> f64 {
        match self {
            ReviewTier::Struggling => 0.5,
            ReviewTier::Learning => 1.0,
            ReviewTier::Learned => 2.0,
            ReviewTier::Mastered => 4.0,
        }
    }
}

pub fn review_interval(mastery: f64, correct_streak: u32) -> Duration {
    let index = (correct_streak as usize).min(REVIEW_INTERVAL_HOURS.len() - 1);
    let base_ms = REVIEW_INTERVAL_HOURS[index] * 3_600_000;
    let scaled = base_ms as f64 * ReviewTier::from_mastery(mastery).factor();
    Duration::milliseconds(scaled.round() as i64)
}

pub fn calculate_next_review_time(
    mastery: f64,
    correct_streak: u32,
    last_practiced: DateTime<Utc>,
) -> DateTime<Utc> {
    last_practiced + review_interval(mastery, correct_streak)
}

pub fn is_due(next_review: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now >= next_review
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewCandidate {
    pub word_id: String,
    pub mastery: f64,
    pub next_review: DateTime<Utc>,
    pub overdue_ms: i64,
}

/// Overdue practiced words, most overdue first, at most `max`.
pub fn select_words_for_review(
    progress: &LanguageProgress,
    now: DateTime<Utc>,
    max: usize,
) -> Vec<ReviewCandidate> {
    let mut due: Vec<ReviewCandidate> = progress
        .values()
        .filter_map(|record| {
            let last = record.last_practiced?;
            let mastery = word_mastery(record, now);
            let next_review = calculate_next_review_time(mastery, record.correct_streak, last);
            is_due(next_review, now).then(|| ReviewCandidate {
                word_id: record.word_id.clone(),
                mastery,
                next_review,
                overdue_ms: (now - next_review).num_milliseconds(),
            })
        })
        .collect();

    due.sort_by(|a, b| {
        b.overdue_ms
            .cmp(&a.overdue_ms)
            .then_with(|| a.word_id.cmp(&b.word_id))
    });
    due.truncate(max);
    due
}
