//! Spaced-repetition learning core.
//!
//! Everything except [`SchedulerEngine`] and [`LanguageDataStore`] is a pure function
//! of its inputs; randomness is always passed in.

pub mod engine;
pub mod grouping;
pub mod language_data;
pub mod mastery;
pub mod quiz;
pub mod review;
pub mod session;

pub use engine::{AnswerOutcome, SchedulerEngine};
pub use grouping::{create_word_groups, ScoredWord, WordGroup};
pub use language_data::{LanguageDataError, LanguageDataStore};
pub use mastery::{decay, word_mastery, LearningPhase};
pub use quiz::{select_quiz_mode, QuizMode, SessionContext};
pub use review::{calculate_next_review_time, is_due, select_words_for_review, ReviewCandidate};
pub use session::{
    analyze_session_performance, create_learning_session, interleave_session_words, ItemSource,
    LearningSession, SessionAnalysis, SessionResult, SessionWord,
};
