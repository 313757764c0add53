use crate::core::config::PipelineConfig;
use crate::core::error::{PipelineError, PipelineResult};
use crate::core::repository::Repository;
use crate::core::state::{
    Chapter, ChapterId, ClarificationEntry, DraftId, EditOutcome, StoryDraft, TimeHintKind, UserId, UserProfile,
};
use crate::services::background::{ContextJob, ContextJobQueue, JobFailure};
use crate::services::clarifier::{ClarificationDecision, Clarifier, ClarifierContext};
use crate::services::classifier::ChapterClassifier;
use crate::services::cleaner::Cleaner;
use crate::services::context::ContextAccumulator;
use crate::services::correction::Corrector;
use crate::services::editor::{EditorContext, LiteraryEditor, UNTITLED};
use crate::services::gender::detect_gender;
use crate::services::llm::LlmClient;
use crate::services::questions::{followup, pick_next_question};
use crate::services::stt::{SpeechToText, Transcriber};
use crate::services::timeline::TimelineExtractor;
use crate::utils::text::truncate_chars;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const DEFAULT_CHAPTER: &str = "Разное";

const STT_UNUSABLE: &str = "Не удалось разобрать запись. Попробуйте записать ещё раз в тихом месте. 🔇";
const STORY_TOO_SHORT: &str = "Расскажите чуть подробнее — хотя бы пару предложений.";
const ANSWER_TOO_SHORT: &str = "Напишите хотя бы пару слов.";
const EMPTY_CORRECTION: &str = "Напишите, что нужно исправить.";
const EMPTY_CHAPTER_TITLE: &str = "Напишите название главы.";
const NOT_READY: &str = "Воспоминание ещё не готово. Дождитесь конца уточнений.";
const ALREADY_SAVED: &str = "Это воспоминание уже сохранено.";
const NO_CREATIVE: &str = "Художественной версии для этого воспоминания нет.";
const NO_OPEN_QUESTION: &str = "Сейчас нет открытого вопроса.";
const FINAL_VERSION: &str = "Больше правок не принимаю, это итоговая версия.";

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Voice(Vec<u8>),
    Text(String),
    Action(UserAction),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum UserAction {
    SaveStrict { draft_id: DraftId },
    SaveCreative { draft_id: DraftId },
    FileInto {
        draft_id: DraftId,
        chapter_id: ChapterId,
        #[serde(default)]
        creative: bool,
    },
    NewChapter {
        draft_id: DraftId,
        #[serde(default)]
        creative: bool,
    },
    ShowStrict { draft_id: DraftId },
    ShowCreative { draft_id: DraftId },
    Correct { draft_id: DraftId },
    OtherQuestion { draft_id: DraftId },
    SkipClarification { draft_id: DraftId },
    Reprocess { draft_id: DraftId },
    AskQuestion { pack: Option<String> },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConversationState {
    #[default]
    Idle,
    AwaitingStory { source_question_id: Option<String> },
    AwaitingCorrection { draft_id: DraftId },
    AwaitingChapterTitle {
        draft_id: DraftId,
        #[serde(default)]
        creative: bool,
    },
}

#[derive(Debug, Clone)]
pub struct UserContext {
    pub user_id: UserId,
    pub display_name: Option<String>,
    pub is_premium: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionOption {
    pub label: String,
    pub action: UserAction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub preview_text: String,
    pub action_options: Vec<ActionOption>,
    pub updated_state: ConversationState,
}

impl Reply {
    fn new(text: impl Into<String>, state: ConversationState) -> Self {
        Self { preview_text: text.into(), action_options: Vec::new(), updated_state: state }
    }

    fn with(mut self, label: impl Into<String>, action: UserAction) -> Self {
        self.action_options.push(ActionOption { label: label.into(), action });
        self
    }
}

pub struct WorkflowManager {
    config: PipelineConfig,
    repo: Arc<dyn Repository>,
    transcriber: Transcriber,
    cleaner: Cleaner,
    clarifier: Clarifier,
    classifier: ChapterClassifier,
    editor: LiteraryEditor,
    timeline: TimelineExtractor,
    corrector: Corrector,
    jobs: ContextJobQueue,
}

impl WorkflowManager {
    pub fn new(
        config: PipelineConfig,
        llm: Arc<dyn LlmClient>,
        stt: Arc<dyn SpeechToText>,
        repo: Arc<dyn Repository>,
    ) -> Self {
        let jobs = ContextJobQueue::spawn(repo.clone(), ContextAccumulator::new(llm.clone()));
        Self {
            config,
            transcriber: Transcriber::new(stt),
            cleaner: Cleaner::new(llm.clone()),
            clarifier: Clarifier::new(llm.clone()),
            classifier: ChapterClassifier::new(llm.clone()),
            editor: LiteraryEditor::new(llm.clone()),
            timeline: TimelineExtractor::new(llm.clone()),
            corrector: Corrector::new(llm),
            repo,
            jobs,
        }
    }

    // Never fails: every error becomes a reply.
    pub async fn process(&self, inbound: Inbound, user: &UserContext, state: ConversationState) -> Reply {
        match self.handle(inbound, user, state.clone()).await {
            Ok(reply) => reply,
            Err(err) => self.recover(err, user, state).await,
        }
    }

    pub fn job_failures(&self) -> Vec<JobFailure> {
        self.jobs.failures()
    }

    pub async fn shutdown(&mut self) {
        self.jobs.shutdown().await;
    }

    async fn handle(&self, inbound: Inbound, user: &UserContext, state: ConversationState) -> PipelineResult<Reply> {
        let profile = self.repo.get_or_create_user(user.user_id, user.display_name.as_deref()).await?;
        match inbound {
            Inbound::Voice(audio) => {
                let transcription = self.transcriber.transcribe(&audio).await;
                if !transcription.is_usable(self.config.stt_confidence_threshold) {
                    info!(
                        "Voice message from user {} rejected, confidence {:.2}",
                        user.user_id, transcription.confidence
                    );
                    return Ok(Reply::new(STT_UNUSABLE, state));
                }
                self.handle_text(transcription.text, user, profile, state).await
            }
            Inbound::Text(text) => self.handle_text(text, user, profile, state).await,
            Inbound::Action(action) => self.handle_action(action, user, profile).await,
        }
    }

    async fn handle_text(
        &self,
        text: String,
        user: &UserContext,
        profile: UserProfile,
        state: ConversationState,
    ) -> PipelineResult<Reply> {
        match state {
            ConversationState::AwaitingCorrection { draft_id } => self.apply_correction(user, draft_id, &text).await,
            ConversationState::AwaitingChapterTitle { draft_id, creative } => {
                self.file_into_new_chapter(user, draft_id, &text, creative).await
            }
            ConversationState::AwaitingStory { source_question_id } => {
                if let Some(draft) = self.repo.pending_clarification(user.user_id).await? {
                    return self.answer_clarification(draft, &text).await;
                }
                self.start_story(text, user, profile, source_question_id).await
            }
            ConversationState::Idle => {
                if let Some(draft) = self.repo.pending_clarification(user.user_id).await? {
                    return self.answer_clarification(draft, &text).await;
                }
                self.start_story(text, user, profile, None).await
            }
        }
    }

    async fn handle_action(&self, action: UserAction, user: &UserContext, profile: UserProfile) -> PipelineResult<Reply> {
        debug!("User {} action {:?}", user.user_id, action);
        match action {
            UserAction::SaveStrict { draft_id } => self.save(user, draft_id, false).await,
            UserAction::SaveCreative { draft_id } => self.save(user, draft_id, true).await,
            UserAction::FileInto { draft_id, chapter_id, creative } => {
                let chapter = self
                    .repo
                    .get_chapter(user.user_id, chapter_id)
                    .await?
                    .ok_or(PipelineError::NotFound("главу"))?;
                let draft = self.load_draft(user, draft_id).await?;
                self.file_into(draft, chapter, creative).await
            }
            UserAction::NewChapter { draft_id, creative } => {
                self.load_draft(user, draft_id).await?;
                Ok(Reply::new(
                    "Как назовём новую главу?",
                    ConversationState::AwaitingChapterTitle { draft_id, creative },
                ))
            }
            UserAction::ShowStrict { draft_id } => {
                let draft = self.load_draft(user, draft_id).await?;
                ensure_edited(&draft)?;
                Ok(self.preview(&draft, false, ConversationState::Idle))
            }
            UserAction::ShowCreative { draft_id } => {
                let draft = self.load_draft(user, draft_id).await?;
                if draft.creative_text.is_none() {
                    return Err(PipelineError::Validation(NO_CREATIVE.into()));
                }
                Ok(self.preview(&draft, true, ConversationState::Idle))
            }
            UserAction::Correct { draft_id } => {
                let draft = self.load_draft(user, draft_id).await?;
                ensure_edited(&draft)?;
                if !draft.can_correct(self.config.max_correction_rounds) {
                    return Err(PipelineError::Validation(FINAL_VERSION.into()));
                }
                Ok(Reply::new(
                    "✏️ Напишите или надиктуйте, что исправить. Например: «замените 1965 на 1966».",
                    ConversationState::AwaitingCorrection { draft_id },
                ))
            }
            UserAction::OtherQuestion { draft_id } => {
                let mut draft = self.load_draft(user, draft_id).await?;
                if !draft.skip_open_question() {
                    return Err(PipelineError::Validation(NO_OPEN_QUESTION.into()));
                }
                self.repo.save_draft(&draft).await?;
                self.next_clarification(draft, true).await
            }
            UserAction::SkipClarification { draft_id } => {
                let mut draft = self.load_draft(user, draft_id).await?;
                if !draft.is_awaiting_answer() {
                    return Err(PipelineError::Validation(NO_OPEN_QUESTION.into()));
                }
                let dropped = draft.finish_clarification();
                info!("Draft {}: clarification skipped after {} entries", draft.id, dropped.len());
                self.edit_stage(draft, Vec::new()).await
            }
            UserAction::Reprocess { draft_id } => {
                let mut draft = self.load_draft(user, draft_id).await?;
                if draft.approved() {
                    return Err(PipelineError::Validation(ALREADY_SAVED.into()));
                }
                draft.reset_for_reprocess()?;
                self.repo.save_draft(&draft).await?;
                info!("Reprocessing draft {}", draft.id);
                self.run_pipeline(draft, &profile).await
            }
            UserAction::AskQuestion { pack } => self.ask_question(user, &profile, pack.as_deref()).await,
        }
    }

    // --- New stories ---

    async fn start_story(
        &self,
        text: String,
        user: &UserContext,
        profile: UserProfile,
        source_question_id: Option<String>,
    ) -> PipelineResult<Reply> {
        let text = text.trim().to_string();
        if text.chars().count() < self.config.min_story_chars {
            return Err(PipelineError::Validation(STORY_TOO_SHORT.into()));
        }
        self.check_free_limit(user, &profile)?;

        let draft = StoryDraft::new(user.user_id, text, source_question_id);
        self.repo.save_draft(&draft).await?;
        info!("Draft {} created for user {}", draft.id, user.user_id);
        self.run_pipeline(draft, &profile).await
    }

    fn check_free_limit(&self, user: &UserContext, profile: &UserProfile) -> PipelineResult<()> {
        if !user.is_premium && profile.memories_count >= self.config.free_memories_limit {
            return Err(PipelineError::LimitReached(self.config.free_memories_limit));
        }
        Ok(())
    }

    async fn run_pipeline(&self, mut draft: StoryDraft, profile: &UserProfile) -> PipelineResult<Reply> {
        let cleaned = self.cleaner.clean(&draft.raw_transcript).await;
        draft.cleaned_transcript = Some(cleaned);
        self.repo.save_draft(&draft).await?;

        if profile.gender.is_none() {
            if let Some(gender) = detect_gender(draft.working_text()) {
                let stored = self.repo.set_gender_if_unset(draft.user_id, gender).await?;
                info!("Author {} gender set to {:?}", draft.user_id, stored);
            }
        }

        self.next_clarification(draft, false).await
    }

    // --- Clarification ---

    async fn answer_clarification(&self, mut draft: StoryDraft, text: &str) -> PipelineResult<Reply> {
        let answer = text.trim();
        if answer.chars().count() < self.config.min_answer_chars {
            return Err(PipelineError::Validation(ANSWER_TOO_SHORT.into()));
        }
        draft.record_answer(answer.to_string())?;
        self.repo.save_draft(&draft).await?;

        if draft.round() >= self.config.max_clarification_rounds {
            info!("Draft {} reached the clarification cap", draft.id);
            let thread = draft.finish_clarification();
            return self.edit_stage(draft, thread).await;
        }
        self.next_clarification(draft, false).await
    }

    async fn next_clarification(&self, mut draft: StoryDraft, replacing: bool) -> PipelineResult<Reply> {
        let characters = self.repo.list_characters(draft.user_id).await?;
        let chapter = self.recent_chapter(draft.user_id).await?;
        let decision = self
            .clarifier
            .decide(&ClarifierContext {
                story: draft.working_text(),
                thread: draft.thread(),
                characters: &characters,
                chapter_summary: chapter.as_ref().and_then(|c| c.thread_summary.as_deref()),
            })
            .await;

        match decision {
            ClarificationDecision::Ask { question, topic } => {
                if !draft.is_awaiting_answer() {
                    draft.open_clarification(question.clone())?;
                } else if replacing {
                    draft.push_replacement_question(question.clone())?;
                } else {
                    draft.advance_round(question.clone(), self.config.max_clarification_rounds)?;
                }
                self.repo.save_draft(&draft).await?;
                debug!("Draft {} round {}: asking about {:?}", draft.id, draft.round(), topic);
                Ok(self.question_reply(&draft, &question))
            }
            ClarificationDecision::Complete => {
                let thread = draft.finish_clarification();
                self.edit_stage(draft, thread).await
            }
        }
    }

    fn question_reply(&self, draft: &StoryDraft, question: &str) -> Reply {
        Reply::new(
            format!("🤔 {}\n\n(вопрос {} из {})", question, draft.round(), self.config.max_clarification_rounds),
            ConversationState::Idle,
        )
        .with("🔄 Другой вопрос", UserAction::OtherQuestion { draft_id: draft.id })
        .with("⏭ Пропустить уточнения", UserAction::SkipClarification { draft_id: draft.id })
    }

    async fn recent_chapter(&self, user_id: UserId) -> PipelineResult<Option<Chapter>> {
        let drafts = self.repo.list_drafts(user_id).await?;
        let Some(chapter_id) = drafts.iter().rev().find_map(|d| d.chapter_id()) else {
            return Ok(None);
        };
        Ok(self.repo.get_chapter(user_id, chapter_id).await?)
    }

    // --- Editing ---

    async fn edit_stage(&self, mut draft: StoryDraft, thread: Vec<ClarificationEntry>) -> PipelineResult<Reply> {
        let user_id = draft.user_id;
        let profile = self.repo.get_or_create_user(user_id, None).await?;
        let characters = self.repo.list_characters(user_id).await?;
        let places = self.repo.places_with_counts(user_id).await?;
        let chapters = self.repo.list_chapters(user_id).await?;

        let text = draft.working_text().to_string();
        let suggestion = self.classifier.classify(&text, &chapters).await;
        let suggested = Some(suggestion.chapter_suggestion).filter(|s| !s.trim().is_empty());
        let summary = suggested
            .as_deref()
            .and_then(|title| chapters.iter().find(|c| c.matches_title(title)))
            .and_then(|c| c.thread_summary.as_deref());

        let ctx = EditorContext {
            characters: &characters,
            places: &places,
            style_profile: profile.style_profile.as_deref(),
            thread: &thread,
            gender: profile.gender,
            chapter_summary: summary,
        };
        let (strict, creative) = self.editor.edit_both(&text, &ctx).await;
        let time_hint = self.timeline.extract(&strict.edited_memoir_text).await;

        draft.apply_edit(EditOutcome {
            strict_text: strict.edited_memoir_text,
            creative_text: Some(creative),
            title: strict.title,
            tags: strict.tags,
            people: strict.people,
            places: strict.places,
            time_hint,
            chapter_suggestion: suggested,
        })?;
        self.repo.save_draft(&draft).await?;
        info!("Draft {} edited: {:?}", draft.id, draft.title);

        if let Some(question_id) = draft.source_question_id.clone() {
            if !self.repo.mark_question_answered(user_id, &question_id, draft.id).await? {
                warn!("Question {} was never logged for user {}", question_id, user_id);
            }
        }
        Ok(self.preview(&draft, false, ConversationState::Idle))
    }

    fn preview(&self, draft: &StoryDraft, creative: bool, state: ConversationState) -> Reply {
        let body = match (creative, draft.creative_text.as_deref()) {
            (true, Some(text)) => text,
            _ => draft.primary_text(),
        };
        let mut text = format!(
            "📖 {}\n\n{}",
            draft.title.as_deref().unwrap_or(UNTITLED),
            truncate_chars(body, self.config.preview_chars)
        );
        if let Some(chapter) = &draft.chapter_suggestion {
            if !draft.approved() {
                text.push_str(&format!("\n\n📁 Предлагаю главу: {}", chapter));
            }
        }

        let id = draft.id;
        let mut reply = Reply::new(text, state);
        if !draft.approved() {
            reply = reply.with("✅ Сохранить", UserAction::SaveStrict { draft_id: id });
            if draft.creative_text.is_some() {
                reply = reply.with("✨ Сохранить художественную версию", UserAction::SaveCreative { draft_id: id });
                reply = if creative {
                    reply.with("📝 Показать строгую версию", UserAction::ShowStrict { draft_id: id })
                } else {
                    reply.with("📖 Показать художественную версию", UserAction::ShowCreative { draft_id: id })
                };
            }
        }
        if draft.can_correct(self.config.max_correction_rounds) {
            reply = reply.with("✏️ Исправить", UserAction::Correct { draft_id: id });
        }
        reply
    }

    // --- Corrections ---

    async fn apply_correction(&self, user: &UserContext, draft_id: DraftId, instruction: &str) -> PipelineResult<Reply> {
        let instruction = instruction.trim();
        if instruction.is_empty() {
            return Err(PipelineError::Validation(EMPTY_CORRECTION.into()));
        }
        let mut draft = self.load_draft(user, draft_id).await?;
        ensure_edited(&draft)?;
        let max_rounds = self.config.max_correction_rounds;
        if !draft.can_correct(max_rounds) {
            let mut reply = self.preview(&draft, false, ConversationState::Idle);
            reply.preview_text = format!("{}\n\n{}", FINAL_VERSION, reply.preview_text);
            return Ok(reply);
        }

        let outcome = self.corrector.apply(draft.primary_text(), instruction).await;
        let applied = outcome.applied;
        draft.record_correction(applied.then_some(outcome.text), max_rounds)?;
        self.repo.save_draft(&draft).await?;

        let exhausted = !draft.can_correct(max_rounds);
        let state = if exhausted {
            ConversationState::Idle
        } else {
            ConversationState::AwaitingCorrection { draft_id }
        };
        let mut note = if applied {
            "✅ Исправлено.".to_string()
        } else {
            "Не нашёл в тексте, что исправить. Текст не изменён.".to_string()
        };
        if exhausted {
            info!("Draft {}: correction rounds exhausted", draft_id);
            note.push(' ');
            note.push_str(FINAL_VERSION);
        }

        let mut reply = self.preview(&draft, false, state);
        reply.preview_text = format!("{}\n\n{}", note, reply.preview_text);
        Ok(reply)
    }

    // --- Saving and filing ---

    async fn save(&self, user: &UserContext, draft_id: DraftId, creative: bool) -> PipelineResult<Reply> {
        let draft = self.load_draft(user, draft_id).await?;
        if draft.approved() {
            return Err(PipelineError::Validation(ALREADY_SAVED.into()));
        }
        ensure_edited(&draft)?;
        if creative && draft.creative_text.is_none() {
            return Err(PipelineError::Validation(NO_CREATIVE.into()));
        }

        let chapters = self.repo.list_chapters(user.user_id).await?;
        let chapter = match draft.chapter_suggestion.clone() {
            Some(title) => {
                let period = period_hint(&draft);
                self.find_or_create_chapter(user.user_id, &chapters, &title, period.as_deref()).await?
            }
            None if chapters.is_empty() => {
                self.find_or_create_chapter(user.user_id, &chapters, DEFAULT_CHAPTER, None).await?
            }
            None => return Ok(chapter_choice(&draft, &chapters, creative)),
        };
        self.approve_into(draft, chapter, creative).await
    }

    async fn file_into(&self, draft: StoryDraft, chapter: Chapter, creative: bool) -> PipelineResult<Reply> {
        if draft.approved() {
            self.repo.move_draft(draft.id, chapter.id).await?;
            info!("Draft {} moved to chapter {}", draft.id, chapter.id);
            return Ok(Reply::new(format!("📁 Перенесено в главу «{}».", chapter.title), ConversationState::Idle));
        }
        ensure_edited(&draft)?;
        self.approve_into(draft, chapter, creative).await
    }

    async fn file_into_new_chapter(
        &self,
        user: &UserContext,
        draft_id: DraftId,
        title: &str,
        creative: bool,
    ) -> PipelineResult<Reply> {
        let title = title.trim();
        if title.is_empty() {
            return Err(PipelineError::Validation(EMPTY_CHAPTER_TITLE.into()));
        }
        let draft = self.load_draft(user, draft_id).await?;
        let chapters = self.repo.list_chapters(user.user_id).await?;
        let chapter = self.find_or_create_chapter(user.user_id, &chapters, title, None).await?;
        self.file_into(draft, chapter, creative).await
    }

    async fn find_or_create_chapter(
        &self,
        user_id: UserId,
        chapters: &[Chapter],
        title: &str,
        period_hint: Option<&str>,
    ) -> PipelineResult<Chapter> {
        if let Some(existing) = chapters.iter().find(|c| c.matches_title(title)) {
            return Ok(existing.clone());
        }
        let chapter = self.repo.create_chapter(user_id, title, period_hint).await?;
        info!("Chapter «{}» created for user {}", chapter.title, user_id);
        Ok(chapter)
    }

    // The creative text replaces the strict one only once a chapter is known.
    async fn approve_into(&self, mut draft: StoryDraft, chapter: Chapter, creative: bool) -> PipelineResult<Reply> {
        if creative {
            if draft.creative_text.is_none() {
                return Err(PipelineError::Validation(NO_CREATIVE.into()));
            }
            draft.use_creative_text()?;
            self.repo.save_draft(&draft).await?;
        }
        let user_id = draft.user_id;
        let approved = self.repo.approve_draft(draft.id, chapter.id).await?;
        let count = self.repo.increment_memories_count(user_id).await?;

        let mut topics = approved.tags.clone();
        if let Some(question_id) = &approved.source_question_id {
            if let Some(question) = self.repo.get_question(question_id).await? {
                topics.extend(question.tags);
            }
        }
        if !topics.is_empty() {
            self.repo.record_topic_coverage(user_id, &topics).await?;
        }

        for job in ContextJob::for_approved_story(user_id, chapter.id, approved.primary_text()) {
            self.jobs.enqueue(job);
        }
        info!("Draft {} approved into chapter {} ({} memories)", approved.id, chapter.id, count);

        Ok(Reply::new(
            format!("✅ Сохранено в главу «{}».\nВоспоминаний в книге: {}.", chapter.title, count),
            ConversationState::Idle,
        )
        .with("❓ Задать мне вопрос", UserAction::AskQuestion { pack: None }))
    }

    // --- Guided questions ---

    async fn ask_question(&self, user: &UserContext, profile: &UserProfile, pack: Option<&str>) -> PipelineResult<Reply> {
        if let Some(draft) = self.repo.pending_clarification(user.user_id).await? {
            let open = draft.thread().last().map(|e| e.text.clone()).unwrap_or_default();
            return Ok(self.question_reply(&draft, &open));
        }
        self.check_free_limit(user, profile)?;

        let questions = self.repo.list_questions().await?;
        let asked = self.repo.asked_question_ids(user.user_id).await?;
        let last_tags = asked
            .last()
            .and_then(|id| questions.iter().find(|q| &q.id == id))
            .map(|q| q.tags.clone())
            .unwrap_or_default();

        let Some(question) = pick_next_question(&questions, &asked, &profile.topic_coverage, pack, &last_tags) else {
            return Ok(Reply::new(
                "Вопросы закончились. Расскажите о чём угодно: просто отправьте голосовое или текст.",
                ConversationState::Idle,
            ));
        };
        self.repo.log_question(user.user_id, &question.id).await?;

        let mut text = format!("❓ {}", question.text);
        if let Some(hint) = followup(question, 0) {
            text.push_str(&format!("\n\nПодсказка: {}", hint));
        }
        text.push_str("\n\nОтветьте голосовым сообщением или текстом.");
        Ok(Reply::new(text, ConversationState::AwaitingStory { source_question_id: Some(question.id.clone()) }))
    }

    // --- Errors ---

    async fn load_draft(&self, user: &UserContext, draft_id: DraftId) -> PipelineResult<StoryDraft> {
        match self.repo.get_draft(draft_id).await? {
            Some(draft) if draft.user_id == user.user_id => Ok(draft),
            _ => Err(PipelineError::NotFound("воспоминание")),
        }
    }

    async fn recover(&self, err: PipelineError, user: &UserContext, state: ConversationState) -> Reply {
        match &err {
            PipelineError::Validation(message) => debug!("User {} input rejected: {}", user.user_id, message),
            PipelineError::NotFound(what) => warn!("User {}: {} not found", user.user_id, what),
            PipelineError::LimitReached(limit) => info!("User {} hit the free limit of {}", user.user_id, limit),
            PipelineError::Unexpected(e) => error!("Pipeline failure for user {}: {:#}", user.user_id, e),
        }

        let updated_state = if err.resets_state() { ConversationState::Idle } else { state };
        let mut reply = Reply::new(err.user_message(), updated_state);
        if matches!(err, PipelineError::Unexpected(_)) {
            if let Some(draft_id) = self.abandon_in_progress(user.user_id).await {
                reply = reply.with("🔁 Обработать заново", UserAction::Reprocess { draft_id });
            }
        }
        reply
    }

    async fn abandon_in_progress(&self, user_id: UserId) -> Option<DraftId> {
        let drafts = match self.repo.list_drafts(user_id).await {
            Ok(drafts) => drafts,
            Err(e) => {
                warn!("Could not look up drafts of user {}: {:#}", user_id, e);
                return None;
            }
        };
        let mut draft = drafts.into_iter().rev().find(|d| !d.approved() && d.strict_text.is_none())?;
        if draft.is_awaiting_answer() {
            draft.finish_clarification();
            if let Err(e) = self.repo.save_draft(&draft).await {
                warn!("Could not clear clarification of draft {}: {:#}", draft.id, e);
            }
        }
        Some(draft.id)
    }
}

fn ensure_edited(draft: &StoryDraft) -> PipelineResult<()> {
    if draft.strict_text.is_none() {
        return Err(PipelineError::Validation(NOT_READY.into()));
    }
    Ok(())
}

fn period_hint(draft: &StoryDraft) -> Option<String> {
    match draft.time_hint.kind {
        TimeHintKind::Unknown => None,
        _ => Some(draft.time_hint.value.trim().to_string()).filter(|v| !v.is_empty()),
    }
}

fn chapter_choice(draft: &StoryDraft, chapters: &[Chapter], creative: bool) -> Reply {
    let title = draft.title.as_deref().unwrap_or(UNTITLED);
    let mut reply = Reply::new(format!("В какую главу положить «{}»?", title), ConversationState::Idle);
    for chapter in chapters {
        reply = reply.with(
            format!("📁 {}", chapter.title),
            UserAction::FileInto { draft_id: draft.id, chapter_id: chapter.id, creative },
        );
    }
    reply.with("➕ Новая глава", UserAction::NewChapter { draft_id: draft.id, creative })
}
