use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub type UserId = i64;
pub type DraftId = Uuid;
pub type ChapterId = Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Female,
    Male,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct UserProfile {
    pub user_id: UserId,
    pub display_name: Option<String>,
    #[serde(default)]
    pub memories_count: u32,
    pub style_profile: Option<String>,
    pub gender: Option<Gender>,
    #[serde(default)]
    pub topic_coverage: BTreeMap<String, u32>,
    pub created_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn new(user_id: UserId, display_name: Option<String>) -> Self {
        Self {
            user_id,
            display_name,
            memories_count: 0,
            style_profile: None,
            gender: None,
            topic_coverage: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }
}

// --- Time hints ---

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimeHintKind {
    Year,
    Range,
    Relative,
    #[default]
    Unknown,
}

// Model output is free-form, so anything unrecognised reads as `Unknown`.
impl<'de> Deserialize<'de> for TimeHintKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        Ok(match raw.trim().to_lowercase().as_str() {
            "year" => TimeHintKind::Year,
            "range" => TimeHintKind::Range,
            "relative" => TimeHintKind::Relative,
            _ => TimeHintKind::Unknown,
        })
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct TimeHint {
    #[serde(rename = "type", default)]
    pub kind: TimeHintKind,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub confidence: f32,
}

impl TimeHint {
    pub fn unknown() -> Self {
        Self::default()
    }
}

// --- Clarification ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClarificationRole {
    Question,
    Answer,
    Skipped,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ClarificationEntry {
    pub role: ClarificationRole,
    pub text: String,
}

impl ClarificationEntry {
    pub fn question(text: impl Into<String>) -> Self {
        Self { role: ClarificationRole::Question, text: text.into() }
    }

    pub fn answer(text: impl Into<String>) -> Self {
        Self { role: ClarificationRole::Answer, text: text.into() }
    }
}

// `round` stays in 1..=max while awaiting an answer.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ClarificationState {
    #[default]
    NoPending,
    AwaitingAnswer {
        round: u8,
        thread: Vec<ClarificationEntry>,
    },
}

// --- Drafts ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DraftStatus {
    #[default]
    Draft,
    Approved { chapter_id: ChapterId },
}

#[derive(Clone, Debug, Default)]
pub struct EditOutcome {
    pub strict_text: String,
    pub creative_text: Option<String>,
    pub title: String,
    pub tags: Vec<String>,
    pub people: Vec<String>,
    pub places: Vec<String>,
    pub time_hint: TimeHint,
    pub chapter_suggestion: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StoryDraft {
    pub id: DraftId,
    pub user_id: UserId,
    pub raw_transcript: String,
    pub cleaned_transcript: Option<String>,
    pub strict_text: Option<String>,
    pub creative_text: Option<String>,
    pub title: Option<String>,
    #[serde(default)]
    pub time_hint: TimeHint,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub people: Vec<String>,
    #[serde(default)]
    pub places: Vec<String>,
    pub chapter_suggestion: Option<String>,
    pub source_question_id: Option<String>,
    #[serde(default)]
    status: DraftStatus,
    #[serde(default)]
    clarification: ClarificationState,
    #[serde(default)]
    corrections_used: u8,
    pub created_at: DateTime<Utc>,
}

impl StoryDraft {
    pub fn new(user_id: UserId, raw_transcript: String, source_question_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            raw_transcript,
            cleaned_transcript: None,
            strict_text: None,
            creative_text: None,
            title: None,
            time_hint: TimeHint::unknown(),
            tags: Vec::new(),
            people: Vec::new(),
            places: Vec::new(),
            chapter_suggestion: None,
            source_question_id,
            status: DraftStatus::Draft,
            clarification: ClarificationState::NoPending,
            corrections_used: 0,
            created_at: Utc::now(),
        }
    }

    pub fn approved(&self) -> bool {
        matches!(self.status, DraftStatus::Approved { .. })
    }

    pub fn chapter_id(&self) -> Option<ChapterId> {
        match self.status {
            DraftStatus::Approved { chapter_id } => Some(chapter_id),
            DraftStatus::Draft => None,
        }
    }

    pub fn round(&self) -> u8 {
        match &self.clarification {
            ClarificationState::NoPending => 0,
            ClarificationState::AwaitingAnswer { round, .. } => *round,
        }
    }

    pub fn is_awaiting_answer(&self) -> bool {
        self.round() > 0
    }

    pub fn thread(&self) -> &[ClarificationEntry] {
        match &self.clarification {
            ClarificationState::NoPending => &[],
            ClarificationState::AwaitingAnswer { thread, .. } => thread,
        }
    }

    pub fn primary_text(&self) -> &str {
        self.strict_text
            .as_deref()
            .or(self.cleaned_transcript.as_deref())
            .unwrap_or(&self.raw_transcript)
    }

    pub fn working_text(&self) -> &str {
        self.cleaned_transcript.as_deref().unwrap_or(&self.raw_transcript)
    }

    pub fn open_clarification(&mut self, question: String) -> Result<()> {
        if self.strict_text.is_some() {
            bail!("draft {} is already edited", self.id);
        }
        if self.is_awaiting_answer() {
            bail!("draft {} already awaits an answer", self.id);
        }
        self.clarification = ClarificationState::AwaitingAnswer {
            round: 1,
            thread: vec![ClarificationEntry::question(question)],
        };
        Ok(())
    }

    pub fn record_answer(&mut self, answer: String) -> Result<()> {
        match &mut self.clarification {
            ClarificationState::AwaitingAnswer { thread, .. } => {
                thread.push(ClarificationEntry::answer(answer));
                Ok(())
            }
            ClarificationState::NoPending => bail!("draft {} has no pending question", self.id),
        }
    }

    pub fn advance_round(&mut self, question: String, max_rounds: u8) -> Result<()> {
        match &mut self.clarification {
            ClarificationState::AwaitingAnswer { round, thread } => {
                if *round >= max_rounds {
                    bail!("clarification round cap {} reached", max_rounds);
                }
                *round += 1;
                thread.push(ClarificationEntry::question(question));
                Ok(())
            }
            ClarificationState::NoPending => bail!("draft {} has no pending question", self.id),
        }
    }

    pub fn skip_open_question(&mut self) -> bool {
        if let ClarificationState::AwaitingAnswer { thread, .. } = &mut self.clarification {
            if let Some(last) = thread.last_mut() {
                if last.role == ClarificationRole::Question {
                    last.role = ClarificationRole::Skipped;
                    return true;
                }
            }
        }
        false
    }

    pub fn push_replacement_question(&mut self, question: String) -> Result<()> {
        match &mut self.clarification {
            ClarificationState::AwaitingAnswer { thread, .. } => {
                thread.push(ClarificationEntry::question(question));
                Ok(())
            }
            ClarificationState::NoPending => bail!("draft {} has no pending question", self.id),
        }
    }

    pub fn finish_clarification(&mut self) -> Vec<ClarificationEntry> {
        match std::mem::take(&mut self.clarification) {
            ClarificationState::NoPending => Vec::new(),
            ClarificationState::AwaitingAnswer { thread, .. } => thread,
        }
    }

    pub fn apply_edit(&mut self, outcome: EditOutcome) -> Result<()> {
        if self.is_awaiting_answer() {
            bail!("draft {} is still mid-clarification", self.id);
        }
        self.strict_text = Some(outcome.strict_text);
        self.creative_text = outcome.creative_text.filter(|t| !t.trim().is_empty());
        self.title = Some(outcome.title);
        self.tags = outcome.tags;
        self.people = outcome.people;
        self.places = outcome.places;
        self.time_hint = outcome.time_hint;
        self.chapter_suggestion = outcome.chapter_suggestion.filter(|s| !s.trim().is_empty());
        Ok(())
    }

    pub fn reset_for_reprocess(&mut self) -> Result<()> {
        if self.approved() {
            bail!("draft {} is already approved", self.id);
        }
        self.cleaned_transcript = None;
        self.strict_text = None;
        self.creative_text = None;
        self.title = None;
        self.time_hint = TimeHint::unknown();
        self.tags.clear();
        self.people.clear();
        self.places.clear();
        self.chapter_suggestion = None;
        self.clarification = ClarificationState::NoPending;
        self.corrections_used = 0;
        Ok(())
    }

    pub fn replace_text(&mut self, text: String) -> Result<()> {
        if self.strict_text.is_none() {
            bail!("draft {} has no edited text yet", self.id);
        }
        self.strict_text = Some(text);
        Ok(())
    }

    pub fn can_correct(&self, max_rounds: u8) -> bool {
        self.corrections_used < max_rounds
    }

    // Every submitted correction uses up a round, matched or not.
    pub fn record_correction(&mut self, corrected: Option<String>, max_rounds: u8) -> Result<()> {
        if !self.can_correct(max_rounds) {
            bail!("draft {} used all {} correction rounds", self.id, max_rounds);
        }
        if let Some(text) = corrected {
            self.replace_text(text)?;
        }
        self.corrections_used += 1;
        Ok(())
    }

    pub fn use_creative_text(&mut self) -> Result<()> {
        match self.creative_text.clone() {
            Some(text) => self.replace_text(text),
            None => bail!("draft {} has no creative version", self.id),
        }
    }

    pub fn approve(&mut self, chapter_id: ChapterId) -> Result<()> {
        if self.approved() {
            bail!("draft {} is already approved", self.id);
        }
        if self.strict_text.is_none() {
            bail!("draft {} has not been edited yet", self.id);
        }
        self.status = DraftStatus::Approved { chapter_id };
        Ok(())
    }

    pub fn move_to(&mut self, chapter_id: ChapterId) -> Result<()> {
        if !self.approved() {
            bail!("draft {} must be approved before it is filed", self.id);
        }
        self.status = DraftStatus::Approved { chapter_id };
        Ok(())
    }
}

// --- Chapters ---

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Chapter {
    pub id: ChapterId,
    pub user_id: UserId,
    pub title: String,
    pub period_hint: Option<String>,
    pub order_index: u32,
    pub thread_summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Chapter {
    pub fn matches_title(&self, title: &str) -> bool {
        self.title.trim().to_lowercase() == title.trim().to_lowercase()
    }
}

// --- Characters ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Character {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub relationship: Option<String>,
    pub description: Option<String>,
    pub mention_count: u32,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct CharacterMention {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub relationship: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct CharacterRegistry {
    pub characters: Vec<Character>,
}

impl CharacterRegistry {
    pub fn resolve(&self, name: &str) -> Option<usize> {
        let needle = name.trim().to_lowercase();
        self.characters
            .iter()
            .position(|c| c.name.to_lowercase() == needle)
            .or_else(|| {
                self.characters
                    .iter()
                    .position(|c| c.aliases.iter().any(|a| a.to_lowercase() == needle))
            })
    }

    // Existing fields are filled when missing, never overwritten.
    pub fn upsert(&mut self, mention: CharacterMention, now: DateTime<Utc>) -> Option<&Character> {
        let name = mention.name.trim().to_string();
        if name.is_empty() {
            return None;
        }
        let relationship = mention.relationship.filter(|s| !s.trim().is_empty());
        let description = mention.description.filter(|s| !s.trim().is_empty());

        let idx = match self.resolve(&name) {
            Some(idx) => {
                let existing = &mut self.characters[idx];
                existing.mention_count += 1;
                existing.last_seen_at = now;
                if existing.relationship.is_none() {
                    existing.relationship = relationship;
                }
                if existing.description.is_none() {
                    existing.description = description;
                }
                for alias in mention.aliases {
                    let alias = alias.trim().to_string();
                    let known = alias.is_empty()
                        || alias.to_lowercase() == existing.name.to_lowercase()
                        || existing.aliases.iter().any(|a| a.to_lowercase() == alias.to_lowercase());
                    if !known {
                        existing.aliases.push(alias);
                    }
                }
                idx
            }
            None => {
                let mut aliases: Vec<String> = Vec::new();
                for alias in mention.aliases {
                    let alias = alias.trim().to_string();
                    if !alias.is_empty() && !aliases.contains(&alias) && alias != name {
                        aliases.push(alias);
                    }
                }
                self.characters.push(Character {
                    id: Uuid::new_v4(),
                    name,
                    aliases,
                    relationship,
                    description,
                    mention_count: 1,
                    last_seen_at: now,
                });
                self.characters.len() - 1
            }
        };
        self.characters.get(idx)
    }

    pub fn by_mentions(&self) -> Vec<Character> {
        let mut list = self.characters.clone();
        list.sort_by(|a, b| b.mention_count.cmp(&a.mention_count).then_with(|| a.name.cmp(&b.name)));
        list
    }
}

// --- Guided interview questions ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    #[default]
    Easy,
    Medium,
    Hard,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Intensity {
    #[default]
    Low,
    Medium,
    High,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Question {
    pub id: String,
    pub pack: String,
    pub text: String,
    #[serde(default)]
    pub difficulty: Difficulty,
    #[serde(default)]
    pub emotional_intensity: Intensity,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub followups: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QuestionStatus {
    Asked,
    Answered { draft_id: DraftId },
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct QuestionLogEntry {
    pub question_id: String,
    pub asked_at: DateTime<Utc>,
    #[serde(flatten)]
    pub status: QuestionStatus,
}
