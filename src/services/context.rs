use crate::core::state::{Character, CharacterMention};
use crate::services::llm::{parse_json, ChatParams, LlmClient};
use crate::utils::text::word_count;
use log::{debug, error};
use std::sync::Arc;

const MIN_STYLE_WORDS: usize = 30;
const MIN_EXTRACT_WORDS: usize = 10;
const KNOWN_CHARACTERS_IN_PROMPT: usize = 30;
const CHARACTERS_FOR_EDITOR: usize = 20;

pub const STYLE_PROMPT: &str = "Ты изучаешь стиль автора мемуаров, чтобы редактор сохранял его голос.
Тебе дают текущий профиль стиля (может отсутствовать) и новый подтверждённый текст.
Перепиши профиль целиком: добавь новые наблюдения, укрепи повторяющиеся черты, убери то, что не подтвердилось.
Отмечай только то, что действительно видно в текстах: характерные слова автора (с примерами в кавычках), \
длину и ритм предложений, с чего автор начинает рассказ, эмоциональный тон, чего автор избегает.
Верни только профиль: связный абзацный текст до 400 слов, без заголовков и списков.";

pub const CHARACTERS_PROMPT: &str = "Ты находишь всех людей, упомянутых в воспоминании, кроме самого автора.
Для каждого верни объект с полями:
name — имя или прозвище, как его называет автор;
aliases — другие обращения к нему в тексте (пустой список, если нет);
relationship — кем приходится автору, если это понятно из текста;
description — одно предложение о том, кто это и в какой связи упомянут.
Если человек уже есть среди известных персонажей, используй его имя из списка.
Верни JSON-массив, а если людей нет, то []. Только JSON, без markdown.";

pub const SUMMARY_FIRST_PROMPT: &str = "Ты пишешь краткое содержание первого воспоминания в главе мемуаров.
Кратко укажи кто, что, когда и где, ключевые факты и эмоциональный тон.
Не более 100 слов. Верни только краткое содержание, без заголовков и пояснений.";

pub const SUMMARY_UPDATE_PROMPT: &str = "Ты ведёшь краткое содержание главы мемуаров.
Тебе дают текущее содержание и новое воспоминание, добавленное в главу.
Перепиши содержание так, чтобы в нём были ключевые факты нового воспоминания и всё важное из прежнего.
Не более 150 слов. Верни только обновлённый текст, без заголовков и пояснений.";

#[derive(Debug, Clone)]
pub struct ContextAccumulator {
    llm: Arc<dyn LlmClient>,
}

impl ContextAccumulator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn refresh_style(&self, existing: Option<&str>, new_text: &str) -> Option<String> {
        if word_count(new_text) < MIN_STYLE_WORDS {
            debug!("Story too short for a style update");
            return None;
        }
        let user = format!(
            "ТЕКУЩИЙ ПРОФИЛЬ:\n{}\n\nНОВЫЙ ТЕКСТ ВОСПОМИНАНИЯ:\n{}",
            existing.unwrap_or("(профиль ещё не сформирован)"),
            new_text
        );
        match self.llm.chat(STYLE_PROMPT, &user, ChatParams::fast(0.3, 600)).await {
            Ok(reply) => Some(reply.trim().to_string()).filter(|s| !s.is_empty()),
            Err(e) => {
                error!("Style profiler error: {:#}", e);
                None
            }
        }
    }

    pub async fn refresh_characters(&self, known: &[Character], new_text: &str) -> Vec<CharacterMention> {
        if word_count(new_text) < MIN_EXTRACT_WORDS {
            return Vec::new();
        }
        let known_list: Vec<String> = known
            .iter()
            .take(KNOWN_CHARACTERS_IN_PROMPT)
            .map(|c| {
                let mut line = format!("- {}", c.name);
                if let Some(rel) = &c.relationship {
                    line.push_str(&format!(" ({})", rel));
                }
                if let Some(desc) = &c.description {
                    line.push_str(&format!(": {}", desc));
                }
                line
            })
            .collect();
        let known_block = if known_list.is_empty() { "(пока нет)".to_string() } else { known_list.join("\n") };
        let user = format!("ИЗВЕСТНЫЕ ПЕРСОНАЖИ:\n{}\n\nТЕКСТ ВОСПОМИНАНИЯ:\n{}", known_block, new_text);

        let reply = match self.llm.chat(CHARACTERS_PROMPT, &user, ChatParams::fast(0.2, 1000)).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("Character extraction error: {:#}", e);
                return Vec::new();
            }
        };
        match parse_json::<Vec<CharacterMention>>(&reply) {
            Ok(mentions) => mentions.into_iter().filter(|m| !m.name.trim().is_empty()).collect(),
            Err(e) => {
                error!("Character extraction returned bad JSON: {:#}", e);
                Vec::new()
            }
        }
    }

    pub async fn refresh_chapter_summary(
        &self,
        chapter_title: &str,
        existing: Option<&str>,
        new_text: &str,
    ) -> Option<String> {
        if word_count(new_text) < MIN_EXTRACT_WORDS {
            return None;
        }
        let (system, user) = match existing.filter(|s| !s.trim().is_empty()) {
            Some(summary) => (
                SUMMARY_UPDATE_PROMPT,
                format!(
                    "ГЛАВА: «{}»\n\nТЕКУЩЕЕ КРАТКОЕ СОДЕРЖАНИЕ:\n{}\n\nНОВОЕ ВОСПОМИНАНИЕ:\n{}",
                    chapter_title, summary, new_text
                ),
            ),
            None => (
                SUMMARY_FIRST_PROMPT,
                format!("ГЛАВА: «{}»\n\nТЕКСТ ВОСПОМИНАНИЯ:\n{}", chapter_title, new_text),
            ),
        };
        match self.llm.chat(system, &user, ChatParams::fast(0.3, 300)).await {
            Ok(reply) => Some(reply.trim().to_string()).filter(|s| !s.is_empty()),
            Err(e) => {
                error!("Thread summary update error: {:#}", e);
                None
            }
        }
    }
}

pub fn format_characters_for_editor(characters: &[Character]) -> String {
    if characters.is_empty() {
        return "нет данных".to_string();
    }
    characters
        .iter()
        .take(CHARACTERS_FOR_EDITOR)
        .map(|c| {
            let mut line = format!("- {}", c.name);
            if let Some(rel) = &c.relationship {
                line.push_str(&format!(" ({})", rel));
            }
            if c.mention_count > 1 {
                line.push_str(&format!(" [упом. {}×]", c.mention_count));
            }
            if !c.aliases.is_empty() {
                let aliases: Vec<&str> = c.aliases.iter().take(3).map(String::as_str).collect();
                line.push_str(&format!(" — также: {}", aliases.join(", ")));
            }
            if let Some(desc) = &c.description {
                line.push_str(&format!("\n  {}", desc));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_places(places: &[(String, u32)]) -> String {
    if places.is_empty() {
        return "нет данных".to_string();
    }
    places
        .iter()
        .map(|(place, count)| if *count > 1 { format!("{} [{}×]", place, count) } else { place.clone() })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::ScriptedLlm;
    use chrono::Utc;
    use uuid::Uuid;

    const LONG_STORY: &str = "Летом шестьдесят пятого года мы с братом Петей поехали к бабушке в деревню под Казанью. \
        Бабушка встречала нас у калитки, пахло пирогами и свежим сеном. Каждое утро мы бегали на речку, \
        а вечером дед рассказывал про войну. Я тогда впервые поняла, как много он пережил.";

    fn character(name: &str, mentions: u32) -> Character {
        Character {
            id: Uuid::new_v4(),
            name: name.into(),
            aliases: vec![],
            relationship: None,
            description: None,
            mention_count: mentions,
            last_seen_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_style_skips_short_stories() {
        let llm = Arc::new(ScriptedLlm::new().on(STYLE_PROMPT, "Профиль"));
        let acc = ContextAccumulator::new(llm.clone());

        assert_eq!(acc.refresh_style(None, "Коротко и ясно.").await, None);
        assert_eq!(llm.total_calls(), 0);

        assert_eq!(acc.refresh_style(Some("Старый"), LONG_STORY).await.as_deref(), Some("Профиль"));
        assert!(llm.last_call_to(STYLE_PROMPT).unwrap().user.contains("Старый"));
    }

    #[tokio::test]
    async fn test_style_failure_keeps_existing() {
        let acc = ContextAccumulator::new(Arc::new(ScriptedLlm::new().failing_on(STYLE_PROMPT)));
        assert_eq!(acc.refresh_style(Some("Старый"), LONG_STORY).await, None);
    }

    #[tokio::test]
    async fn test_refresh_characters_parses_array() {
        let reply = r#"```json
[{"name": "Петя", "aliases": ["брат"], "relationship": "брат"},
 {"name": "", "aliases": []},
 {"name": "Бабушка"}]
```"#;
        let llm = Arc::new(ScriptedLlm::new().on(CHARACTERS_PROMPT, reply));
        let acc = ContextAccumulator::new(llm.clone());

        let mentions = acc.refresh_characters(&[character("Петя", 2)], LONG_STORY).await;
        assert_eq!(mentions.len(), 2);
        assert_eq!(mentions[0].relationship.as_deref(), Some("брат"));
        assert!(llm.last_call_to(CHARACTERS_PROMPT).unwrap().user.contains("- Петя"));
    }

    #[tokio::test]
    async fn test_refresh_characters_malformed_is_empty() {
        let acc = ContextAccumulator::new(Arc::new(ScriptedLlm::new().on(CHARACTERS_PROMPT, "Петя и бабушка")));
        assert!(acc.refresh_characters(&[], LONG_STORY).await.is_empty());
    }

    #[tokio::test]
    async fn test_summary_prompt_depends_on_existing() {
        let llm = Arc::new(
            ScriptedLlm::new()
                .on(SUMMARY_FIRST_PROMPT, "Первое содержание")
                .on(SUMMARY_UPDATE_PROMPT, "Обновлённое содержание"),
        );
        let acc = ContextAccumulator::new(llm.clone());

        let first = acc.refresh_chapter_summary("Детство", None, LONG_STORY).await;
        assert_eq!(first.as_deref(), Some("Первое содержание"));
        let updated = acc.refresh_chapter_summary("Детство", Some("Было"), LONG_STORY).await;
        assert_eq!(updated.as_deref(), Some("Обновлённое содержание"));
        assert_eq!(llm.calls_to(SUMMARY_FIRST_PROMPT), 1);
        assert_eq!(llm.calls_to(SUMMARY_UPDATE_PROMPT), 1);
    }

    #[test]
    fn test_format_characters_for_editor() {
        assert_eq!(format_characters_for_editor(&[]), "нет данных");

        let mut maria = character("Мария", 3);
        maria.relationship = Some("жена".into());
        maria.aliases = vec!["Маша".into(), "Машенька".into()];
        maria.description = Some("Познакомились в институте".into());
        let text = format_characters_for_editor(&[maria, character("Пётр", 1)]);

        assert!(text.starts_with("- Мария (жена) [упом. 3×] — также: Маша, Машенька\n  Познакомились в институте"));
        assert!(text.ends_with("- Пётр"));
    }

    #[test]
    fn test_format_characters_caps_list() {
        let many: Vec<Character> = (0..25).map(|i| character(&format!("Человек {}", i), 1)).collect();
        assert_eq!(format_characters_for_editor(&many).lines().count(), CHARACTERS_FOR_EDITOR);
    }

    #[test]
    fn test_format_places() {
        assert_eq!(format_places(&[]), "нет данных");
        assert_eq!(format_places(&[("Москва".into(), 2), ("Казань".into(), 1)]), "Москва [2×], Казань");
    }
}
