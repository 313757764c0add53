use crate::core::repository::Repository;
use crate::core::state::{Difficulty, Intensity, Question};
use anyhow::{Context, Result};
use rand::seq::IndexedRandom;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

pub async fn read_question_bank(path: &Path) -> Result<Vec<Question>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

pub async fn seed_question_bank(repo: &dyn Repository, path: &Path) -> Result<usize> {
    let questions = read_question_bank(path).await?;
    let added = repo.load_questions(&questions).await?;
    log::info!("Question bank: {} loaded, {} new", questions.len(), added);
    Ok(added)
}

fn score(question: &Question, coverage: &BTreeMap<String, u32>, last_tags: &HashSet<&str>) -> (u32, u8, u8, usize) {
    let covered: u32 = question.tags.iter().map(|t| coverage.get(t).copied().unwrap_or(0)).sum();
    let difficulty = match question.difficulty {
        Difficulty::Easy => 0,
        Difficulty::Medium | Difficulty::Hard => 1,
    };
    let intensity = match question.emotional_intensity {
        Intensity::Low => 0,
        Intensity::Medium => 1,
        Intensity::High => 2,
    };
    let overlap = question.tags.iter().filter(|t| last_tags.contains(t.as_str())).count();
    (covered, difficulty, intensity, overlap)
}

// The pick is random within the best max(3, n/5) candidates.
pub fn pick_next_question<'a>(
    all: &'a [Question],
    asked_ids: &[String],
    coverage: &BTreeMap<String, u32>,
    pack: Option<&str>,
    last_tags: &[String],
) -> Option<&'a Question> {
    let mut candidates: Vec<&Question> = all.iter().filter(|q| !asked_ids.contains(&q.id)).collect();
    if candidates.is_empty() {
        return None;
    }

    if let Some(pack) = pack {
        let in_pack: Vec<&Question> = candidates.iter().copied().filter(|q| q.pack == pack).collect();
        if !in_pack.is_empty() {
            candidates = in_pack;
        }
    }

    let last: HashSet<&str> = last_tags.iter().map(String::as_str).collect();
    candidates.sort_by_key(|q| score(q, coverage, &last));

    let bucket = (candidates.len() / 5).max(3).min(candidates.len());
    candidates[..bucket].choose(&mut rand::rng()).copied()
}

pub fn followup(question: &Question, index: usize) -> Option<&str> {
    question.followups.get(index).map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use crate::core::repository::StorageRepository;
    use std::sync::Arc;

    fn q(id: &str, pack: &str, difficulty: Difficulty, intensity: Intensity, tags: &[&str]) -> Question {
        Question {
            id: id.into(),
            pack: pack.into(),
            text: format!("Вопрос {}", id),
            difficulty,
            emotional_intensity: intensity,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            followups: vec!["А что потом?".into()],
        }
    }

    fn bank() -> Vec<Question> {
        vec![
            q("c1", "childhood", Difficulty::Easy, Intensity::Low, &["home"]),
            q("c2", "childhood", Difficulty::Hard, Intensity::High, &["loss"]),
            q("s1", "school", Difficulty::Easy, Intensity::Low, &["school"]),
            q("s2", "school", Difficulty::Medium, Intensity::Medium, &["friends"]),
            q("w1", "work", Difficulty::Easy, Intensity::Low, &["work"]),
        ]
    }

    #[test]
    fn test_asked_questions_are_excluded() {
        let all = bank();
        let asked: Vec<String> = all.iter().skip(1).map(|q| q.id.clone()).collect();
        for _ in 0..20 {
            let picked = pick_next_question(&all, &asked, &BTreeMap::new(), None, &[]).unwrap();
            assert_eq!(picked.id, "c1");
        }
        let everything: Vec<String> = all.iter().map(|q| q.id.clone()).collect();
        assert!(pick_next_question(&all, &everything, &BTreeMap::new(), None, &[]).is_none());
    }

    #[test]
    fn test_pack_is_preferred_and_falls_back() {
        let all = bank();
        for _ in 0..20 {
            let picked = pick_next_question(&all, &[], &BTreeMap::new(), Some("school"), &[]).unwrap();
            assert_eq!(picked.pack, "school");
        }
        let asked = vec!["w1".to_string()];
        assert!(pick_next_question(&all, &asked, &BTreeMap::new(), Some("work"), &[]).is_some());
    }

    #[test]
    fn test_pick_comes_from_top_bucket() {
        let all = bank();
        let mut coverage = BTreeMap::new();
        coverage.insert("home".to_string(), 4);
        coverage.insert("work".to_string(), 2);
        // Sorted: s1 (0,0,0), s2 (0,1,1), c2 (0,1,2), w1 (2,..), c1 (4,..); bucket of 3.
        for _ in 0..50 {
            let picked = pick_next_question(&all, &[], &coverage, None, &[]).unwrap();
            assert!(["s1", "s2", "c2"].contains(&picked.id.as_str()), "picked {}", picked.id);
        }
    }

    #[test]
    fn test_last_tags_break_ties() {
        let all = vec![
            q("a", "p", Difficulty::Easy, Intensity::Low, &["home"]),
            q("b", "p", Difficulty::Easy, Intensity::Low, &["school"]),
            q("c", "p", Difficulty::Hard, Intensity::High, &["war"]),
            q("d", "p", Difficulty::Hard, Intensity::High, &["war"]),
        ];
        let last = vec!["home".to_string()];
        let last_set: HashSet<&str> = last.iter().map(String::as_str).collect();
        assert!(score(&all[1], &BTreeMap::new(), &last_set) < score(&all[0], &BTreeMap::new(), &last_set));
    }

    #[test]
    fn test_followup() {
        let question = bank().remove(0);
        assert_eq!(followup(&question, 0), Some("А что потом?"));
        assert_eq!(followup(&question, 1), None);
    }

    #[tokio::test]
    async fn test_seed_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("questions.json");
        tokio::fs::write(&path, serde_json::to_vec(&bank())?).await?;
        let repo = StorageRepository::new(Arc::new(NativeStorage::new(dir.path().join("data"))));

        assert_eq!(seed_question_bank(&repo, &path).await?, 5);
        assert_eq!(seed_question_bank(&repo, &path).await?, 0);
        assert_eq!(repo.list_questions().await?.len(), 5);
        Ok(())
    }
}
