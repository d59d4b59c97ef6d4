//! Forgetting-curve mastery.
//!
//! Mastery is never stored. It is derived from accumulated xp and the time since the
//! last practice:
//!
//! base(xp) = 100 * (1 - e^(-xp / XP_SCALE))
//! strength = min(xp * STRENGTH_PER_XP, MAX_STRENGTH)
//! lambda = LAMBDA_0 * e^(-ALPHA * strength)
//! mastery = base * e^(-lambda * elapsed_days)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::WordProgress;

pub const MAX_MASTERY: f64 = 100.0;

const XP_SCALE: f64 = 40.0;
const STRENGTH_PER_XP: f64 = 0.05;
const MAX_STRENGTH: f64 = 10.0;
const LAMBDA_0: f64 = 0.3;
const ALPHA: f64 = 0.5;
const MS_PER_DAY: f64 = 86_400_000.0;

fn base_mastery(xp: u32) -> f64 {
    MAX_MASTERY * (1.0 - (-(xp as f64) / XP_SCALE).exp())
}

fn decay_rate(xp: u32) -> f64 {
    let strength = (xp as f64 * STRENGTH_PER_XP).min(MAX_STRENGTH);
    LAMBDA_0 * (-ALPHA * strength).exp()
}

/// Current mastery in `0..=100`. A `last_practiced` in the future counts as "just now".
pub fn decay(last_practiced: Option<DateTime<Utc>>, xp: u32, now: DateTime<Utc>) -> f64 {
    let base = base_mastery(xp);
    let Some(last) = last_practiced else {
        return base.clamp(0.0, MAX_MASTERY);
    };
    let elapsed_days = (now - last).num_milliseconds().max(0) as f64 / MS_PER_DAY;
    let retrievability = (-decay_rate(xp) * elapsed_days).exp();
    (base * retrievability).clamp(0.0, MAX_MASTERY)
}

pub fn word_mastery(progress: &WordProgress, now: DateTime<Utc>) -> f64 {
    decay(progress.last_practiced, progress.xp, now)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LearningPhase {
    Introduction,
    Learning,
    Consolidation,
    Mastery,
}

impl LearningPhase {
    pub const ALL: [LearningPhase; 4] = [
        LearningPhase::Introduction,
        LearningPhase::Learning,
        LearningPhase::Consolidation,
        LearningPhase::Mastery,
    ];

    pub fn from_mastery(mastery: f64) -> Self {
        if mastery < 20.0 {
            LearningPhase::Introduction
        } else if mastery < 50.0 {
            LearningPhase::Learning
        } else if mastery < 80.0 {
            LearningPhase::Consolidation
        } else {
            LearningPhase::Mastery
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LearningPhase::Introduction => "introduction",
            LearningPhase::Learning => "learning",
            LearningPhase::Consolidation => "consolidation",
            LearningPhase::Mastery => "mastery",
        }
    }
}

impl std::fmt::Display for LearningPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
