use serde::{Deserialize, Serialize};

use super::mastery::LearningPhase;

pub const IDEAL_GROUP_SIZE: usize = 6;
pub const MIN_GROUP_SIZE: usize = 5;
pub const MAX_GROUP_SIZE: usize = 7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredWord {
    pub word_id: String,
    pub mastery: f64,
}

impl ScoredWord {
    pub fn new(word_id: impl Into<String>, mastery: f64) -> Self {
        Self {
            word_id: word_id.into(),
            mastery,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WordGroup {
    pub id: String,
    pub phase: LearningPhase,
    pub word_ids: Vec<String>,
    pub average_mastery: f64,
    pub session_count: u32,
}

impl WordGroup {
    pub fn len(&self) -> usize {
        self.word_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.word_ids.is_empty()
    }
}

/// Groups per phase (introduction first), weakest words first inside each phase.
pub fn create_word_groups(words: &[ScoredWord]) -> Vec<WordGroup> {
    let mut groups = Vec::new();
    for phase in LearningPhase::ALL {
        let mut bucket: Vec<&ScoredWord> = words
            .iter()
            .filter(|word| LearningPhase::from_mastery(word.mastery) == phase)
            .collect();
        bucket.sort_by(|a, b| a.mastery.total_cmp(&b.mastery).then_with(|| a.word_id.cmp(&b.word_id)));

        let mut start = 0;
        for (index, size) in chunk_sizes(bucket.len()).into_iter().enumerate() {
            let members = &bucket[start..start + size];
            start += size;
            let average_mastery = members.iter().map(|word| word.mastery).sum::<f64>() / size as f64;
            groups.push(WordGroup {
                id: format!("{phase}-{}", index + 1),
                phase,
                word_ids: members.iter().map(|word| word.word_id.clone()).collect(),
                average_mastery,
                session_count: 0,
            });
        }
    }
    groups
}

/// Even split into about `total / 6` chunks, kept within `[5, 7]` whenever such a
/// split exists. Only buckets of 8 or 9 words, or fewer than 5, fall outside it.
fn chunk_sizes(total: usize) -> Vec<usize> {
    if total == 0 {
        return Vec::new();
    }
    let fewest = total.div_ceil(MAX_GROUP_SIZE);
    let most = (total / MIN_GROUP_SIZE).max(fewest);
    let count = ((total + IDEAL_GROUP_SIZE / 2) / IDEAL_GROUP_SIZE).clamp(fewest, most);
    let (base, extra) = (total / count, total % count);
    (0..count).map(|index| base + usize::from(index < extra)).collect()
}
