use crate::core::state::{Character, ClarificationEntry, ClarificationRole};
use crate::services::context::format_characters_for_editor;
use crate::services::llm::{parse_json, ChatParams, LlmClient};
use crate::utils::text::sentence_count;
use log::{debug, error, warn};
use serde::Deserialize;
use std::sync::Arc;

pub const SYSTEM_PROMPT: &str = "Ты внимательный собеседник, который помогает человеку записать воспоминание.
Тебе дают рассказ, историю уже заданных уточнений, известных людей из прошлых рассказов и краткое содержание главы.
Задай ОДИН конкретный уточняющий вопрос о самом важном пробеле. Приоритеты по порядку:
1. Когда это было: год или возраст, если не сказано.
2. Кто этот человек, если он упомянут вскользь и не известен по прошлым рассказам.
3. Где именно, если место названо слишком широко.
4. Пропуск между событиями.
5. Что автор почувствовал, если это не сказано.
6. Что было потом.
Правила: тон тёплый, как у любимого внука. Не спрашивай о том, что уже есть в рассказе или в ответах. \
Не задавай общих вопросов вроде «расскажи подробнее». Не повторяй тему вопросов из истории, \
в том числе пропущенных. Рассказ из одного-двух предложений не бывает законченным.
Если всё важное уже раскрыто, верни {\"is_complete\": true}.
Иначе верни {\"is_complete\": false, \"question\": \"вопрос\"}. Только JSON, без markdown.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    When,
    Who,
    Where,
    Feelings,
    Aftermath,
    Other,
}

// Matched against the question padded with spaces and stripped of punctuation.
const TOPIC_KEYWORDS: &[(Topic, &[&str])] = &[
    (Topic::When, &[" когда ", " в каком году", " какой год", " каком возрасте", " сколько вам было", " сколько тебе было", " какое время"]),
    (Topic::Who, &[" кто ", " кого ", " кем ", " как звали", " как зовут", " имя "]),
    (Topic::Where, &[" где ", " куда ", " откуда ", " в каком городе", " какое место", " в каком месте"]),
    (Topic::Feelings, &["чувств", "ощущ", "пережива", "эмоци", "настроени"]),
    (Topic::Aftermath, &[" потом", " после этого", " дальше", " чем закончил", " что стало"]),
];

const FALLBACK_ORDER: [Topic; 5] = [Topic::When, Topic::Who, Topic::Where, Topic::Aftermath, Topic::Feelings];

pub fn classify_topic(question: &str) -> Topic {
    let normalized: String = question
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let lower = format!(" {} ", normalized);
    TOPIC_KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| lower.contains(w)))
        .map(|(topic, _)| *topic)
        .unwrap_or(Topic::Other)
}

fn fallback_question(topic: Topic) -> &'static str {
    match topic {
        Topic::When => "А в каком году или в каком возрасте это было?",
        Topic::Who => "Кто был рядом с вами в тот момент?",
        Topic::Where => "А где именно это происходило?",
        Topic::Feelings => "Что вы почувствовали тогда?",
        Topic::Aftermath | Topic::Other => "А что было потом?",
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClarifierContext<'a> {
    pub story: &'a str,
    pub thread: &'a [ClarificationEntry],
    pub characters: &'a [Character],
    pub chapter_summary: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClarificationDecision {
    Complete,
    Ask { question: String, topic: Topic },
}

#[derive(Deserialize)]
struct ClarifierReply {
    #[serde(default)]
    is_complete: bool,
    #[serde(default)]
    question: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Clarifier {
    llm: Arc<dyn LlmClient>,
}

impl Clarifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn decide(&self, ctx: &ClarifierContext<'_>) -> ClarificationDecision {
        let reply = match self.llm.chat(SYSTEM_PROMPT, &render_user_prompt(ctx), ChatParams::fast(0.4, 300)).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("Clarifier error: {:#}", e);
                return ClarificationDecision::Complete;
            }
        };
        let reply: ClarifierReply = match parse_json(&reply) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!("Clarifier returned bad JSON: {:#}", e);
                return ClarificationDecision::Complete;
            }
        };

        let covered = covered_topics(ctx.thread);
        let question = reply
            .question
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty() && !reply.is_complete);

        match question {
            Some(question) => {
                let topic = classify_topic(&question);
                let repeated = ctx
                    .thread
                    .iter()
                    .filter(|e| e.role != ClarificationRole::Answer)
                    .any(|e| e.text.trim().to_lowercase() == question.to_lowercase())
                    || (topic != Topic::Other && covered.contains(&topic));
                if repeated {
                    warn!("Clarifier repeated topic {:?}, substituting", topic);
                    uncovered_fallback(&covered)
                } else {
                    ClarificationDecision::Ask { question, topic }
                }
            }
            None if is_thin(ctx) => {
                debug!("Story too thin to be complete, asking anyway");
                uncovered_fallback(&covered)
            }
            None => ClarificationDecision::Complete,
        }
    }
}

fn covered_topics(thread: &[ClarificationEntry]) -> Vec<Topic> {
    thread
        .iter()
        .filter(|e| e.role != ClarificationRole::Answer)
        .map(|e| classify_topic(&e.text))
        .filter(|t| *t != Topic::Other)
        .collect()
}

fn uncovered_fallback(covered: &[Topic]) -> ClarificationDecision {
    FALLBACK_ORDER
        .iter()
        .find(|t| !covered.contains(*t))
        .map(|topic| ClarificationDecision::Ask {
            question: fallback_question(*topic).to_string(),
            topic: *topic,
        })
        .unwrap_or(ClarificationDecision::Complete)
}

fn is_thin(ctx: &ClarifierContext<'_>) -> bool {
    let answered: usize = ctx
        .thread
        .iter()
        .filter(|e| e.role == ClarificationRole::Answer)
        .map(|e| sentence_count(&e.text).max(1))
        .sum();
    sentence_count(ctx.story) + answered <= 2
}

fn render_user_prompt(ctx: &ClarifierContext<'_>) -> String {
    let mut prompt = format!("Рассказ автора:\n{}", ctx.story);
    if !ctx.thread.is_empty() {
        prompt.push_str("\n\nИстория уточнений:");
        for entry in ctx.thread {
            let line = match entry.role {
                ClarificationRole::Question => format!("\nВ: {}", entry.text),
                ClarificationRole::Answer => format!("\nО: {}", entry.text),
                ClarificationRole::Skipped => format!("\nВ (автор пропустил): {}", entry.text),
            };
            prompt.push_str(&line);
        }
    }
    if !ctx.characters.is_empty() {
        prompt.push_str("\n\nИзвестные люди из прошлых рассказов:\n");
        prompt.push_str(&format_characters_for_editor(ctx.characters));
    }
    if let Some(summary) = ctx.chapter_summary.filter(|s| !s.trim().is_empty()) {
        prompt.push_str("\n\nКраткое содержание главы:\n");
        prompt.push_str(summary);
    }
    prompt
}
