use crate::core::state::Chapter;
use crate::services::llm::{parse_json, ChatParams, LlmClient};
use log::error;
use serde::Deserialize;
use std::sync::Arc;

pub const SYSTEM_PROMPT: &str = "Ты раскладываешь воспоминания по главам книги мемуаров.
Тебе дают текст воспоминания и список существующих глав с периодами и кратким содержанием.
Выбери подходящую главу из списка и верни её название точно как в списке.
Если ни одна не подходит, предложи короткое название новой главы (2-4 слова).
Верни JSON: {\"chapter_suggestion\": \"название\", \"confidence\": 0.0-1.0, \"reasoning\": \"одно предложение\"}.
Только JSON, без markdown.";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChapterSuggestion {
    #[serde(default)]
    pub chapter_suggestion: String,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Clone)]
pub struct ChapterClassifier {
    llm: Arc<dyn LlmClient>,
}

impl ChapterClassifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn classify(&self, text: &str, chapters: &[Chapter]) -> ChapterSuggestion {
        if chapters.is_empty() {
            return ChapterSuggestion::default();
        }

        let list: Vec<String> = chapters
            .iter()
            .map(|ch| {
                let mut line = format!("- {}", ch.title);
                if let Some(period) = ch.period_hint.as_deref().filter(|p| !p.is_empty()) {
                    line.push_str(&format!(" ({})", period));
                }
                if let Some(summary) = ch.thread_summary.as_deref().filter(|s| !s.is_empty()) {
                    line.push_str(&format!("\n  {}", summary));
                }
                line
            })
            .collect();
        let user = format!("ГЛАВЫ:\n{}\n\nВОСПОМИНАНИЕ:\n{}", list.join("\n"), text);

        let reply = match self.llm.chat(SYSTEM_PROMPT, &user, ChatParams::fast(0.3, 300)).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("Classification error: {:#}", e);
                return ChapterSuggestion::default();
            }
        };
        match parse_json::<ChapterSuggestion>(&reply) {
            Ok(mut suggestion) => {
                suggestion.chapter_suggestion = suggestion.chapter_suggestion.trim().to_string();
                suggestion.confidence = suggestion.confidence.clamp(0.0, 1.0);
                suggestion
            }
            Err(e) => {
                error!("Classifier returned bad JSON: {:#}", e);
                ChapterSuggestion::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::ScriptedLlm;
    use chrono::Utc;
    use uuid::Uuid;

    fn chapter(title: &str, summary: Option<&str>) -> Chapter {
        Chapter {
            id: Uuid::new_v4(),
            user_id: 1,
            title: title.into(),
            period_hint: Some("1950-1965".into()),
            order_index: 1,
            thread_summary: summary.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_no_chapters_skips_the_call() {
        let llm = Arc::new(ScriptedLlm::new().on(SYSTEM_PROMPT, r#"{"chapter_suggestion": "Детство"}"#));
        let classifier = ChapterClassifier::new(llm.clone());
        assert_eq!(classifier.classify("текст", &[]).await, ChapterSuggestion::default());
        assert_eq!(llm.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_suggestion_is_parsed() {
        let reply = r#"{"chapter_suggestion": " Детство ", "confidence": 1.7, "reasoning": "про маму"}"#;
        let llm = Arc::new(ScriptedLlm::new().on(SYSTEM_PROMPT, reply));
        let classifier = ChapterClassifier::new(llm.clone());

        let suggestion = classifier.classify("Мама готовила борщ", &[chapter("Детство", Some("Казань"))]).await;
        assert_eq!(suggestion.chapter_suggestion, "Детство");
        assert_eq!(suggestion.confidence, 1.0);
        let user = llm.last_call_to(SYSTEM_PROMPT).unwrap().user;
        assert!(user.contains("- Детство (1950-1965)\n  Казань"));
    }

    #[tokio::test]
    async fn test_fallbacks() {
        let chapters = [chapter("Школа", None)];
        let failing = ChapterClassifier::new(Arc::new(ScriptedLlm::new().failing_on(SYSTEM_PROMPT)));
        assert_eq!(failing.classify("текст", &chapters).await, ChapterSuggestion::default());

        let prose = ChapterClassifier::new(Arc::new(ScriptedLlm::new().on(SYSTEM_PROMPT, "Глава про школу")));
        assert_eq!(prose.classify("текст", &chapters).await, ChapterSuggestion::default());
    }
}
