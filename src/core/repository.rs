use crate::core::io::Storage;
use crate::core::state::{
    Chapter, ChapterId, CharacterMention, CharacterRegistry, Character, DraftId, Gender, Question,
    QuestionLogEntry, QuestionStatus, StoryDraft, UserId, UserProfile,
};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveDirection {
    Up,
    Down,
}

#[async_trait]
pub trait Repository: Send + Sync {
    // --- Users ---
    async fn get_or_create_user(&self, user_id: UserId, display_name: Option<&str>) -> Result<UserProfile>;
    async fn get_user(&self, user_id: UserId) -> Result<Option<UserProfile>>;
    async fn set_gender_if_unset(&self, user_id: UserId, gender: Gender) -> Result<Gender>;
    async fn update_style_profile(&self, user_id: UserId, profile: String) -> Result<()>;
    async fn increment_memories_count(&self, user_id: UserId) -> Result<u32>;
    async fn record_topic_coverage(&self, user_id: UserId, tags: &[String]) -> Result<()>;

    // --- Chapters ---
    async fn create_chapter(&self, user_id: UserId, title: &str, period_hint: Option<&str>) -> Result<Chapter>;
    async fn list_chapters(&self, user_id: UserId) -> Result<Vec<Chapter>>;
    async fn rename_chapter(&self, user_id: UserId, chapter_id: ChapterId, title: &str) -> Result<()>;
    async fn move_chapter(&self, user_id: UserId, chapter_id: ChapterId, direction: MoveDirection) -> Result<bool>;
    async fn delete_chapter(&self, user_id: UserId, chapter_id: ChapterId) -> Result<()>;
    async fn update_thread_summary(&self, user_id: UserId, chapter_id: ChapterId, summary: String) -> Result<()>;

    // --- Drafts ---
    async fn save_draft(&self, draft: &StoryDraft) -> Result<()>;
    async fn get_draft(&self, draft_id: DraftId) -> Result<Option<StoryDraft>>;
    async fn list_drafts(&self, user_id: UserId) -> Result<Vec<StoryDraft>>;
    async fn approve_draft(&self, draft_id: DraftId, chapter_id: ChapterId) -> Result<StoryDraft>;
    async fn move_draft(&self, draft_id: DraftId, chapter_id: ChapterId) -> Result<StoryDraft>;

    // --- Characters ---
    async fn list_characters(&self, user_id: UserId) -> Result<Vec<Character>>;
    async fn upsert_characters(&self, user_id: UserId, mentions: Vec<CharacterMention>) -> Result<Vec<Character>>;

    // --- Question bank ---
    async fn load_questions(&self, questions: &[Question]) -> Result<usize>;
    async fn list_questions(&self) -> Result<Vec<Question>>;
    async fn log_question(&self, user_id: UserId, question_id: &str) -> Result<()>;
    async fn mark_question_answered(&self, user_id: UserId, question_id: &str, draft_id: DraftId) -> Result<bool>;
    async fn question_log(&self, user_id: UserId) -> Result<Vec<QuestionLogEntry>>;

    // --- Derived lookups ---

    async fn get_chapter(&self, user_id: UserId, chapter_id: ChapterId) -> Result<Option<Chapter>> {
        Ok(self.list_chapters(user_id).await?.into_iter().find(|c| c.id == chapter_id))
    }

    async fn pending_clarification(&self, user_id: UserId) -> Result<Option<StoryDraft>> {
        Ok(self
            .list_drafts(user_id)
            .await?
            .into_iter()
            .rev()
            .find(|d| d.is_awaiting_answer()))
    }

    async fn drafts_in_chapter(&self, user_id: UserId, chapter_id: ChapterId) -> Result<Vec<StoryDraft>> {
        Ok(self
            .list_drafts(user_id)
            .await?
            .into_iter()
            .filter(|d| d.chapter_id() == Some(chapter_id))
            .collect())
    }

    async fn count_approved(&self, user_id: UserId) -> Result<usize> {
        Ok(self.list_drafts(user_id).await?.iter().filter(|d| d.approved()).count())
    }

    async fn places_with_counts(&self, user_id: UserId) -> Result<Vec<(String, u32)>> {
        let mut counts: HashMap<String, u32> = HashMap::new();
        for draft in self.list_drafts(user_id).await?.iter().filter(|d| d.approved()) {
            for place in &draft.places {
                *counts.entry(place.clone()).or_default() += 1;
            }
        }
        let mut list: Vec<(String, u32)> = counts.into_iter().collect();
        list.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(list)
    }

    async fn asked_question_ids(&self, user_id: UserId) -> Result<Vec<String>> {
        Ok(self.question_log(user_id).await?.into_iter().map(|e| e.question_id).collect())
    }

    async fn get_question(&self, question_id: &str) -> Result<Option<Question>> {
        Ok(self.list_questions().await?.into_iter().find(|q| q.id == question_id))
    }
}

const DRAFTS_DIR: &str = "drafts";
const QUESTIONS_KEY: &str = "questions.json";

fn profile_key(user_id: UserId) -> String {
    format!("users/{}/profile.json", user_id)
}
fn chapters_key(user_id: UserId) -> String {
    format!("users/{}/chapters.json", user_id)
}
fn characters_key(user_id: UserId) -> String {
    format!("users/{}/characters.json", user_id)
}
fn question_log_key(user_id: UserId) -> String {
    format!("users/{}/question_log.json", user_id)
}
fn draft_key(draft_id: DraftId) -> String {
    format!("{}/{}.json", DRAFTS_DIR, draft_id)
}
fn draft_index_key(user_id: UserId) -> String {
    format!("users/{}/drafts.json", user_id)
}

pub struct StorageRepository {
    storage: Arc<dyn Storage>,
    // Serialises read-modify-write cycles; background jobs share this instance.
    write_lock: Mutex<()>,
}

impl StorageRepository {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage, write_lock: Mutex::new(()) }
    }

    async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        if !self.storage.exists(key).await? {
            return Ok(None);
        }
        let bytes = self.storage.read(key).await?;
        let value = serde_json::from_slice(&bytes).with_context(|| format!("Corrupted record {}", key))?;
        Ok(Some(value))
    }

    async fn store<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let content = serde_json::to_vec_pretty(value)?;
        self.storage.write(key, &content).await
    }

    async fn load_profile(&self, user_id: UserId) -> Result<UserProfile> {
        self.load(&profile_key(user_id))
            .await?
            .ok_or_else(|| anyhow!("user {} not found", user_id))
    }

    async fn load_chapters(&self, user_id: UserId) -> Result<Vec<Chapter>> {
        let mut chapters: Vec<Chapter> = self.load(&chapters_key(user_id)).await?.unwrap_or_default();
        chapters.sort_by_key(|c| c.order_index);
        Ok(chapters)
    }

    async fn load_registry(&self, user_id: UserId) -> Result<CharacterRegistry> {
        Ok(self.load(&characters_key(user_id)).await?.unwrap_or_default())
    }

    async fn update_profile<F>(&self, user_id: UserId, f: F) -> Result<UserProfile>
    where
        F: FnOnce(&mut UserProfile) + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut profile = self.load_profile(user_id).await?;
        f(&mut profile);
        self.store(&profile_key(user_id), &profile).await?;
        Ok(profile)
    }

    // Chapter existence is checked under the same lock `delete_chapter` takes.
    async fn file_draft<F>(&self, draft_id: DraftId, chapter_id: ChapterId, f: F) -> Result<StoryDraft>
    where
        F: FnOnce(&mut StoryDraft) -> Result<()> + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut draft: StoryDraft = self
            .load(&draft_key(draft_id))
            .await?
            .ok_or_else(|| anyhow!("draft {} not found", draft_id))?;
        self.ensure_chapter(draft.user_id, chapter_id).await?;
        f(&mut draft)?;
        self.store(&draft_key(draft_id), &draft).await?;
        Ok(draft)
    }

    async fn ensure_chapter(&self, user_id: UserId, chapter_id: ChapterId) -> Result<()> {
        if !self.load_chapters(user_id).await?.iter().any(|c| c.id == chapter_id) {
            bail!("chapter {} not found", chapter_id);
        }
        Ok(())
    }
}

#[async_trait]
impl Repository for StorageRepository {
    async fn get_or_create_user(&self, user_id: UserId, display_name: Option<&str>) -> Result<UserProfile> {
        let _guard = self.write_lock.lock().await;
        if let Some(profile) = self.load::<UserProfile>(&profile_key(user_id)).await? {
            return Ok(profile);
        }
        let profile = UserProfile::new(user_id, display_name.map(str::to_string));
        self.store(&profile_key(user_id), &profile).await?;
        log::info!("Registered new author {}", user_id);
        Ok(profile)
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<UserProfile>> {
        self.load(&profile_key(user_id)).await
    }

    async fn set_gender_if_unset(&self, user_id: UserId, gender: Gender) -> Result<Gender> {
        let profile = self
            .update_profile(user_id, |p| {
                if p.gender.is_none() {
                    p.gender = Some(gender);
                }
            })
            .await?;
        Ok(profile.gender.unwrap_or(gender))
    }

    async fn update_style_profile(&self, user_id: UserId, style: String) -> Result<()> {
        self.update_profile(user_id, |p| p.style_profile = Some(style)).await?;
        Ok(())
    }

    async fn increment_memories_count(&self, user_id: UserId) -> Result<u32> {
        let profile = self.update_profile(user_id, |p| p.memories_count += 1).await?;
        Ok(profile.memories_count)
    }

    async fn record_topic_coverage(&self, user_id: UserId, tags: &[String]) -> Result<()> {
        let tags = tags.to_vec();
        self.update_profile(user_id, move |p| {
            for tag in tags {
                *p.topic_coverage.entry(tag).or_default() += 1;
            }
        })
        .await?;
        Ok(())
    }

    async fn create_chapter(&self, user_id: UserId, title: &str, period_hint: Option<&str>) -> Result<Chapter> {
        let _guard = self.write_lock.lock().await;
        let mut chapters = self.load_chapters(user_id).await?;
        let next_order = chapters.iter().map(|c| c.order_index).max().unwrap_or(0) + 1;
        let chapter = Chapter {
            id: Uuid::new_v4(),
            user_id,
            title: title.trim().to_string(),
            period_hint: period_hint.map(str::to_string).filter(|s| !s.is_empty()),
            order_index: next_order,
            thread_summary: None,
            created_at: Utc::now(),
        };
        chapters.push(chapter.clone());
        self.store(&chapters_key(user_id), &chapters).await?;
        Ok(chapter)
    }

    async fn list_chapters(&self, user_id: UserId) -> Result<Vec<Chapter>> {
        self.load_chapters(user_id).await
    }

    async fn rename_chapter(&self, user_id: UserId, chapter_id: ChapterId, title: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut chapters = self.load_chapters(user_id).await?;
        let chapter = chapters
            .iter_mut()
            .find(|c| c.id == chapter_id)
            .ok_or_else(|| anyhow!("chapter {} not found", chapter_id))?;
        chapter.title = title.trim().to_string();
        self.store(&chapters_key(user_id), &chapters).await
    }

    async fn move_chapter(&self, user_id: UserId, chapter_id: ChapterId, direction: MoveDirection) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut chapters = self.load_chapters(user_id).await?;
        let idx = chapters
            .iter()
            .position(|c| c.id == chapter_id)
            .ok_or_else(|| anyhow!("chapter {} not found", chapter_id))?;
        let neighbour = match direction {
            MoveDirection::Up if idx > 0 => idx - 1,
            MoveDirection::Down if idx + 1 < chapters.len() => idx + 1,
            _ => return Ok(false),
        };
        let order = chapters[idx].order_index;
        chapters[idx].order_index = chapters[neighbour].order_index;
        chapters[neighbour].order_index = order;
        self.store(&chapters_key(user_id), &chapters).await?;
        Ok(true)
    }

    async fn delete_chapter(&self, user_id: UserId, chapter_id: ChapterId) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        // Filed drafts stay approved forever, so a chapter holding any cannot go away.
        if !self.drafts_in_chapter(user_id, chapter_id).await?.is_empty() {
            bail!("chapter {} still holds memories", chapter_id);
        }
        let mut chapters = self.load_chapters(user_id).await?;
        let before = chapters.len();
        chapters.retain(|c| c.id != chapter_id);
        if chapters.len() == before {
            bail!("chapter {} not found", chapter_id);
        }
        self.store(&chapters_key(user_id), &chapters).await
    }

    async fn update_thread_summary(&self, user_id: UserId, chapter_id: ChapterId, summary: String) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut chapters = self.load_chapters(user_id).await?;
        let chapter = chapters
            .iter_mut()
            .find(|c| c.id == chapter_id)
            .ok_or_else(|| anyhow!("chapter {} not found", chapter_id))?;
        chapter.thread_summary = Some(summary);
        self.store(&chapters_key(user_id), &chapters).await
    }

    async fn save_draft(&self, draft: &StoryDraft) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let index_key = draft_index_key(draft.user_id);
        let mut index: Vec<DraftId> = self.load(&index_key).await?.unwrap_or_default();
        if !index.contains(&draft.id) {
            index.push(draft.id);
            self.store(&index_key, &index).await?;
        }
        self.store(&draft_key(draft.id), draft).await
    }

    async fn get_draft(&self, draft_id: DraftId) -> Result<Option<StoryDraft>> {
        self.load(&draft_key(draft_id)).await
    }

    async fn list_drafts(&self, user_id: UserId) -> Result<Vec<StoryDraft>> {
        let index: Vec<DraftId> = self.load(&draft_index_key(user_id)).await?.unwrap_or_default();
        let mut drafts = Vec::new();
        for draft_id in index {
            match self.load::<StoryDraft>(&draft_key(draft_id)).await {
                Ok(Some(draft)) => drafts.push(draft),
                Ok(None) => log::warn!("Draft {} is indexed for user {} but missing", draft_id, user_id),
                Err(e) => log::warn!("Skipping unreadable draft {}: {:#}", draft_id, e),
            }
        }
        drafts.sort_by_key(|d| d.created_at);
        Ok(drafts)
    }

    async fn approve_draft(&self, draft_id: DraftId, chapter_id: ChapterId) -> Result<StoryDraft> {
        self.file_draft(draft_id, chapter_id, |d| d.approve(chapter_id)).await
    }

    async fn move_draft(&self, draft_id: DraftId, chapter_id: ChapterId) -> Result<StoryDraft> {
        self.file_draft(draft_id, chapter_id, |d| d.move_to(chapter_id)).await
    }

    async fn list_characters(&self, user_id: UserId) -> Result<Vec<Character>> {
        Ok(self.load_registry(user_id).await?.by_mentions())
    }

    async fn upsert_characters(&self, user_id: UserId, mentions: Vec<CharacterMention>) -> Result<Vec<Character>> {
        let _guard = self.write_lock.lock().await;
        let mut registry = self.load_registry(user_id).await?;
        let now = Utc::now();
        let mut touched = Vec::new();
        for mention in mentions {
            if let Some(character) = registry.upsert(mention, now) {
                touched.push(character.clone());
            }
        }
        self.store(&characters_key(user_id), &registry).await?;
        Ok(touched)
    }

    async fn load_questions(&self, questions: &[Question]) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let mut stored: Vec<Question> = self.load(QUESTIONS_KEY).await?.unwrap_or_default();
        let mut added = 0;
        for question in questions {
            if !stored.iter().any(|q| q.id == question.id) {
                stored.push(question.clone());
                added += 1;
            }
        }
        if added > 0 {
            self.store(QUESTIONS_KEY, &stored).await?;
        }
        Ok(added)
    }

    async fn list_questions(&self) -> Result<Vec<Question>> {
        Ok(self.load(QUESTIONS_KEY).await?.unwrap_or_default())
    }

    async fn log_question(&self, user_id: UserId, question_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut log: Vec<QuestionLogEntry> = self.load(&question_log_key(user_id)).await?.unwrap_or_default();
        log.push(QuestionLogEntry {
            question_id: question_id.to_string(),
            asked_at: Utc::now(),
            status: QuestionStatus::Asked,
        });
        self.store(&question_log_key(user_id), &log).await
    }

    async fn mark_question_answered(&self, user_id: UserId, question_id: &str, draft_id: DraftId) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut log: Vec<QuestionLogEntry> = self.load(&question_log_key(user_id)).await?.unwrap_or_default();
        let entry = log
            .iter_mut()
            .rev()
            .find(|e| e.question_id == question_id && e.status == QuestionStatus::Asked);
        match entry {
            Some(entry) => {
                entry.status = QuestionStatus::Answered { draft_id };
                self.store(&question_log_key(user_id), &log).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn question_log(&self, user_id: UserId) -> Result<Vec<QuestionLogEntry>> {
        Ok(self.load(&question_log_key(user_id)).await?.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use crate::core::state::{EditOutcome, Difficulty, Intensity};

    fn repo(dir: &tempfile::TempDir) -> StorageRepository {
        StorageRepository::new(Arc::new(NativeStorage::new(dir.path())))
    }

    fn edited_draft(user_id: UserId, places: &[&str]) -> StoryDraft {
        let mut draft = StoryDraft::new(user_id, "сырой текст".into(), None);
        draft
            .apply_edit(EditOutcome {
                strict_text: "литературный текст".into(),
                title: "Тест".into(),
                places: places.iter().map(|p| p.to_string()).collect(),
                ..Default::default()
            })
            .unwrap();
        draft
    }

    fn question(id: &str) -> Question {
        Question {
            id: id.into(),
            pack: "childhood".into(),
            text: "Какой был ваш первый дом?".into(),
            difficulty: Difficulty::Easy,
            emotional_intensity: Intensity::Low,
            tags: vec!["home".into()],
            followups: vec![],
        }
    }

    #[tokio::test]
    async fn test_get_or_create_user_is_stable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo = repo(&dir);

        let first = repo.get_or_create_user(111, Some("Анна")).await?;
        let second = repo.get_or_create_user(111, Some("Другое имя")).await?;
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.display_name.as_deref(), Some("Анна"));
        assert_eq!(second.memories_count, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_gender_is_set_once() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo = repo(&dir);
        repo.get_or_create_user(1, None).await?;

        assert_eq!(repo.set_gender_if_unset(1, Gender::Female).await?, Gender::Female);
        assert_eq!(repo.set_gender_if_unset(1, Gender::Male).await?, Gender::Female);
        assert_eq!(repo.get_user(1).await?.unwrap().gender, Some(Gender::Female));
        Ok(())
    }

    #[tokio::test]
    async fn test_memories_counter_and_coverage() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo = repo(&dir);
        repo.get_or_create_user(2, None).await?;

        assert_eq!(repo.increment_memories_count(2).await?, 1);
        assert_eq!(repo.increment_memories_count(2).await?, 2);
        repo.record_topic_coverage(2, &["home".into(), "childhood".into()]).await?;
        repo.record_topic_coverage(2, &["home".into()]).await?;

        let profile = repo.get_user(2).await?.unwrap();
        assert_eq!(profile.topic_coverage.get("home"), Some(&2));
        assert_eq!(profile.topic_coverage.get("childhood"), Some(&1));
        Ok(())
    }

    #[tokio::test]
    async fn test_chapter_order_is_strictly_increasing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo = repo(&dir);

        let mut orders = Vec::new();
        for title in ["Детство", "Школа", "Армия", "Работа", "Семья"] {
            orders.push(repo.create_chapter(3, title, None).await?.order_index);
        }
        assert!(orders.windows(2).all(|w| w[0] < w[1]), "orders: {:?}", orders);

        let titles: Vec<String> = repo.list_chapters(3).await?.into_iter().map(|c| c.title).collect();
        assert_eq!(titles, vec!["Детство", "Школа", "Армия", "Работа", "Семья"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_move_chapter_swaps_only_neighbours() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo = repo(&dir);

        let a = repo.create_chapter(4, "А", None).await?;
        let b = repo.create_chapter(4, "Б", None).await?;
        let c = repo.create_chapter(4, "В", None).await?;

        assert!(repo.move_chapter(4, b.id, MoveDirection::Up).await?);
        let chapters = repo.list_chapters(4).await?;
        let order_of = |id: ChapterId| chapters.iter().find(|ch| ch.id == id).unwrap().order_index;
        assert_eq!(order_of(b.id), a.order_index);
        assert_eq!(order_of(a.id), b.order_index);
        assert_eq!(order_of(c.id), c.order_index);

        assert!(!repo.move_chapter(4, b.id, MoveDirection::Up).await?, "already first");
        Ok(())
    }

    #[tokio::test]
    async fn test_rename_and_summary() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo = repo(&dir);

        let chapter = repo.create_chapter(5, "Старое", Some("1950-1960")).await?;
        repo.rename_chapter(5, chapter.id, "Новое").await?;
        repo.update_thread_summary(5, chapter.id, "Кратко".into()).await?;

        let stored = repo.get_chapter(5, chapter.id).await?.unwrap();
        assert_eq!(stored.title, "Новое");
        assert_eq!(stored.period_hint.as_deref(), Some("1950-1960"));
        assert_eq!(stored.thread_summary.as_deref(), Some("Кратко"));
        Ok(())
    }

    #[tokio::test]
    async fn test_approve_sets_chapter_and_blocks_delete() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo = repo(&dir);

        let chapter = repo.create_chapter(6, "Глава", None).await?;
        let draft = edited_draft(6, &[]);
        repo.save_draft(&draft).await?;

        let approved = repo.approve_draft(draft.id, chapter.id).await?;
        assert!(approved.approved());
        assert_eq!(approved.chapter_id(), Some(chapter.id));
        assert!(repo.approve_draft(draft.id, chapter.id).await.is_err(), "approval happens once");

        assert_eq!(repo.drafts_in_chapter(6, chapter.id).await?.len(), 1);
        assert!(repo.delete_chapter(6, chapter.id).await.is_err());

        let empty = repo.create_chapter(6, "Пустая", None).await?;
        repo.delete_chapter(6, empty.id).await?;
        assert!(repo.get_chapter(6, empty.id).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_approve_into_foreign_chapter_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo = repo(&dir);

        let foreign = repo.create_chapter(99, "Чужая", None).await?;
        let draft = edited_draft(7, &[]);
        repo.save_draft(&draft).await?;

        assert!(repo.approve_draft(draft.id, foreign.id).await.is_err());
        let stored = repo.get_draft(draft.id).await?.unwrap();
        assert!(!stored.approved());
        assert_eq!(stored.chapter_id(), None);
        Ok(())
    }

    #[tokio::test]
    async fn test_move_draft_requires_approval() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo = repo(&dir);

        let first = repo.create_chapter(8, "A", None).await?;
        let second = repo.create_chapter(8, "B", None).await?;
        let draft = edited_draft(8, &[]);
        repo.save_draft(&draft).await?;

        assert!(repo.move_draft(draft.id, second.id).await.is_err());
        repo.approve_draft(draft.id, first.id).await?;
        let moved = repo.move_draft(draft.id, second.id).await?;
        assert_eq!(moved.chapter_id(), Some(second.id));
        Ok(())
    }

    #[tokio::test]
    async fn test_pending_clarification_lookup() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo = repo(&dir);

        let plain = StoryDraft::new(9, "без вопросов".into(), None);
        repo.save_draft(&plain).await?;
        assert!(repo.pending_clarification(9).await?.is_none());

        let mut pending = StoryDraft::new(9, "с вопросом".into(), None);
        pending.open_clarification("Когда это было?".into())?;
        repo.save_draft(&pending).await?;

        let found = repo.pending_clarification(9).await?.unwrap();
        assert_eq!(found.id, pending.id);
        assert!(repo.pending_clarification(10).await?.is_none(), "drafts are scoped per user");
        Ok(())
    }

    #[tokio::test]
    async fn test_list_drafts_reads_only_the_users_index() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = Arc::new(NativeStorage::new(dir.path()));
        let repo = StorageRepository::new(storage.clone());

        let mine = StoryDraft::new(14, "моё".into(), None);
        repo.save_draft(&mine).await?;
        repo.save_draft(&mine).await?;
        repo.save_draft(&StoryDraft::new(15, "чужое".into(), None)).await?;
        storage.write("drafts/broken.json", b"{not json").await?;

        let drafts = repo.list_drafts(14).await?;
        assert_eq!(drafts.len(), 1, "saving twice indexes the draft once");
        assert_eq!(drafts[0].id, mine.id);
        assert_eq!(repo.list_drafts(15).await?.len(), 1);
        assert!(repo.list_drafts(16).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_chapter_races_approval_without_orphans() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo = repo(&dir);

        for _ in 0..10 {
            let chapter = repo.create_chapter(16, "Гонка", None).await?;
            let draft = edited_draft(16, &[]);
            repo.save_draft(&draft).await?;

            let (deleted, approved) =
                tokio::join!(repo.delete_chapter(16, chapter.id), repo.approve_draft(draft.id, chapter.id));
            let chapter_exists = repo.get_chapter(16, chapter.id).await?.is_some();
            let filed = repo.get_draft(draft.id).await?.unwrap();

            assert!(deleted.is_ok() != approved.is_ok(), "exactly one of delete and approve wins");
            assert_eq!(chapter_exists, filed.approved());
            if filed.approved() {
                assert_eq!(filed.chapter_id(), Some(chapter.id));
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_places_counted_from_approved_only() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo = repo(&dir);
        let chapter = repo.create_chapter(11, "Г", None).await?;

        for places in [&["Москва", "Казань"][..], &["Москва"][..]] {
            let draft = edited_draft(11, places);
            repo.save_draft(&draft).await?;
            repo.approve_draft(draft.id, chapter.id).await?;
        }
        repo.save_draft(&edited_draft(11, &["Париж"])).await?;

        let places = repo.places_with_counts(11).await?;
        assert_eq!(places, vec![("Москва".to_string(), 2), ("Казань".to_string(), 1)]);
        assert_eq!(repo.count_approved(11).await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_upsert_characters_merges_by_name_and_alias() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo = repo(&dir);

        repo.upsert_characters(
            12,
            vec![CharacterMention { name: "Мария".into(), aliases: vec!["Маша".into()], ..Default::default() }],
        )
        .await?;
        repo.upsert_characters(12, vec![CharacterMention { name: "МАРИЯ".into(), ..Default::default() }])
            .await?;
        repo.upsert_characters(12, vec![CharacterMention { name: "маша".into(), ..Default::default() }])
            .await?;
        repo.upsert_characters(12, vec![CharacterMention { name: "Пётр".into(), ..Default::default() }])
            .await?;

        let characters = repo.list_characters(12).await?;
        assert_eq!(characters.len(), 2);
        assert_eq!(characters[0].name, "Мария");
        assert_eq!(characters[0].mention_count, 3);
        assert_eq!(characters[1].mention_count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_question_loading_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo = repo(&dir);
        let bank = vec![question("childhood_001"), question("childhood_002")];

        assert_eq!(repo.load_questions(&bank).await?, 2);
        let first = repo.list_questions().await?;
        assert_eq!(repo.load_questions(&bank).await?, 0);
        let second = repo.list_questions().await?;
        assert_eq!(first, second);
        assert_eq!(second.len(), 2);
        assert_eq!(repo.get_question("childhood_002").await?.map(|q| q.id), Some("childhood_002".to_string()));
        assert!(repo.get_question("missing").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_question_log_marks_latest_asked() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo = repo(&dir);
        let draft_id = Uuid::new_v4();

        repo.log_question(13, "school_001").await?;
        assert_eq!(repo.asked_question_ids(13).await?, vec!["school_001".to_string()]);
        assert!(repo.mark_question_answered(13, "school_001", draft_id).await?);
        assert!(!repo.mark_question_answered(13, "school_001", draft_id).await?);

        let log = repo.question_log(13).await?;
        assert_eq!(log[0].status, QuestionStatus::Answered { draft_id });
        Ok(())
    }
}
