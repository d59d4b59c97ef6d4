use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::models::Word;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuizMode {
    MultipleChoice,
    LetterScramble,
    OpenAnswer,
    FillInTheBlank,
}

impl QuizMode {
    pub const ALL: [QuizMode; 4] = [
        QuizMode::MultipleChoice,
        QuizMode::LetterScramble,
        QuizMode::OpenAnswer,
        QuizMode::FillInTheBlank,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QuizMode::MultipleChoice => "multiple-choice",
            QuizMode::LetterScramble => "letter-scramble",
            QuizMode::OpenAnswer => "open-answer",
            QuizMode::FillInTheBlank => "fill-in-the-blank",
        }
    }

    /// XP for a correct answer. Recall scores above recognition.
    pub fn xp_reward(self) -> u32 {
        match self {
            QuizMode::MultipleChoice => 5,
            QuizMode::LetterScramble => 8,
            QuizMode::FillInTheBlank => 10,
            QuizMode::OpenAnswer => 12,
        }
    }
}

impl std::fmt::Display for QuizMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionContext {
    Introduction,
    Practice,
    Review,
}

const LETTER_SCRAMBLE_SHARE_LOW: f64 = 0.6;
const FILL_IN_THE_BLANK_SHARE: f64 = 0.25;
const FILL_IN_THE_BLANK_MIN_MASTERY: f64 = 90.0;
const REVIEW_FILL_IN_THE_BLANK_MIN_MASTERY: f64 = 85.0;

fn recall_mode<R: Rng + ?Sized>(rng: &mut R) -> QuizMode {
    if rng.random_bool(0.5) {
        QuizMode::OpenAnswer
    } else {
        QuizMode::LetterScramble
    }
}

fn has_sentence(word: Option<&Word>) -> bool {
    word.is_some_and(Word::has_sentence_context)
}

/// Tiered by mastery with a random pick inside each tier.
pub fn select_quiz_mode<R: Rng + ?Sized>(
    mastery: f64,
    context: SessionContext,
    word: Option<&Word>,
    rng: &mut R,
) -> QuizMode {
    match context {
        SessionContext::Introduction => QuizMode::MultipleChoice,
        SessionContext::Practice => {
            if mastery < 30.0 {
                QuizMode::MultipleChoice
            } else if mastery < 60.0 {
                if rng.random_bool(LETTER_SCRAMBLE_SHARE_LOW) {
                    QuizMode::LetterScramble
                } else {
                    QuizMode::MultipleChoice
                }
            } else if mastery < 85.0 {
                recall_mode(rng)
            } else if mastery >= FILL_IN_THE_BLANK_MIN_MASTERY
                && has_sentence(word)
                && rng.random_bool(FILL_IN_THE_BLANK_SHARE)
            {
                QuizMode::FillInTheBlank
            } else {
                recall_mode(rng)
            }
        }
        SessionContext::Review => {
            if mastery >= REVIEW_FILL_IN_THE_BLANK_MIN_MASTERY
                && has_sentence(word)
                && rng.random_bool(FILL_IN_THE_BLANK_SHARE)
            {
                QuizMode::FillInTheBlank
            } else if mastery < 30.0 && rng.random_bool(0.4) {
                QuizMode::MultipleChoice
            } else if mastery < 30.0 {
                QuizMode::LetterScramble
            } else {
                recall_mode(rng)
            }
        }
    }
}
