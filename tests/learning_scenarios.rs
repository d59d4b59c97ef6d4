//! Scheduler behaviour over real storage, plus the pure-function properties.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::TempDir;

use danci_core::compression::{CompressionAlgorithm, CompressionCodec};
use danci_core::config::{AppConfig, CompressionConfig};
use danci_core::learning::{
    analyze_session_performance, decay, interleave_session_words, select_quiz_mode, AnswerOutcome,
    ItemSource, QuizMode, SessionContext, SessionResult,
};
use danci_core::models::{QuizDirection, Word};
use danci_core::AppContext;

fn context(dir: &TempDir) -> AppContext {
    let mut config = AppConfig::default();
    config.local.path = Some(dir.path().join("store.db"));
    config.data_dir = dir.path().to_path_buf();
    AppContext::new(config).unwrap()
}

fn write_word_list(dir: &TempDir, code: &str, count: usize) {
    let words: Vec<Word> = (0..count)
        .map(|i| Word {
            id: format!("basic-nouns:{i}"),
            term: format!("term-{i}"),
            definition: format!("definition-{i}"),
            sentence: (i % 2 == 0).then(|| format!("sentence with term-{i}")),
            category: Some("basic-nouns".into()),
        })
        .collect();
    std::fs::write(
        dir.path().join(format!("{code}.json")),
        serde_json::to_vec(&words).unwrap(),
    )
    .unwrap();
}

#[tokio::test]
async fn answers_flow_into_storage_and_the_next_session() {
    let dir = TempDir::new().unwrap();
    write_word_list(&dir, "de", 12);
    let ctx = context(&dir);
    let words = ctx.language_data.get_or_load("de").await.unwrap();

    let first = ctx
        .scheduler
        .plan_session("de", &words, Utc::now())
        .await
        .data
        .unwrap();
    assert_eq!(first.session_type, SessionContext::Introduction);
    assert_eq!(first.words.len(), 6);

    let outcome = AnswerOutcome {
        correct: true,
        quiz_mode: QuizMode::MultipleChoice,
        direction: Some(QuizDirection::TermToDefinition),
        response_time_ms: 900,
    };
    for item in &first.words {
        for _ in 0..3 {
            assert!(ctx.scheduler.record_answer("de", &item.word_id, &outcome).await.success);
        }
    }
    let report = ctx.shutdown().await;
    assert_eq!(report.written, 1);

    let reopened = context(&dir);
    let progress = reopened.facade.load_word_progress("de").await.data.unwrap();
    assert_eq!(progress.len(), 6);
    assert!(progress.values().all(|p| p.xp == 15 && p.correct_streak == 3));
    assert!(reopened.facade.load_word_progress("es").await.data.unwrap().is_empty());

    // Days later the practiced words are due and the untouched half is next up.
    let later = Utc::now() + Duration::days(4);
    let second = reopened
        .scheduler
        .plan_session("de", &words, later)
        .await
        .data
        .unwrap();
    assert!(second.words.iter().all(|w| !progress.contains_key(&w.word_id)));
    assert!(!second.review_words.is_empty());
    assert!(second.review_words.iter().all(|w| w.source == ItemSource::Review));

    let mixed = interleave_session_words(&second, &mut StdRng::seed_from_u64(5));
    assert_eq!(mixed.len(), second.len());
}

#[test]
fn struggling_session_gets_gentler_recommendations() {
    let results: Vec<SessionResult> = (0..10)
        .map(|i| SessionResult {
            word_id: format!("w{i}"),
            correct: i < 5,
            quiz_mode: if i % 2 == 0 { QuizMode::OpenAnswer } else { QuizMode::MultipleChoice },
            response_time_ms: 1_000 + i * 100,
        })
        .collect();
    let analysis = analyze_session_performance(&results);
    assert!((analysis.accuracy - 50.0).abs() < 1e-9);
    assert_eq!(analysis.struggling_words.len(), 5);
    assert_eq!(analysis.recommendations.len(), 2);
}

fn at(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap()
}

proptest! {
    #[test]
    fn practice_at_mastery_25_is_recognition_or_scramble(seed in any::<u64>()) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mode = select_quiz_mode(25.0, SessionContext::Practice, None, &mut rng);
        prop_assert!(matches!(mode, QuizMode::MultipleChoice | QuizMode::LetterScramble));
    }

    #[test]
    fn introduction_context_ignores_mastery(mastery in 0.0f64..=100.0, seed in any::<u64>()) {
        let mut rng = StdRng::seed_from_u64(seed);
        prop_assert_eq!(
            select_quiz_mode(mastery, SessionContext::Introduction, None, &mut rng),
            QuizMode::MultipleChoice
        );
    }

    #[test]
    fn decay_is_idempotent(xp in 0u32..2_000, last in 0i64..1_700_000_000_000, elapsed in 0i64..1_000_000_000) {
        let now = at(last + elapsed);
        prop_assert_eq!(decay(Some(at(last)), xp, now), decay(Some(at(last)), xp, now));
    }

    #[test]
    fn compression_round_trips(text in ".{0,600}", repeat in 1usize..8) {
        let codec = CompressionCodec::new(CompressionConfig {
            min_size_bytes: 64,
            ..CompressionConfig::default()
        });
        let input = text.repeat(repeat);
        let payload = codec.compress(&input);
        if payload.algorithm != CompressionAlgorithm::None {
            prop_assert!(payload.payload.len() < input.len());
        }
        prop_assert_eq!(codec.decompress(&payload).unwrap(), input);
    }
}
