use crate::core::state::{Character, ClarificationEntry, ClarificationRole, Gender};
use crate::services::context::{format_characters_for_editor, format_places};
use crate::services::llm::{parse_json, strip_code_blocks, ChatParams, LlmClient};
use futures_util::future::join;
use log::error;
use serde::Deserialize;
use std::sync::Arc;

pub const UNTITLED: &str = "Без названия";

pub const STRICT_PROMPT: &str = "Ты литературный редактор книги воспоминаний.
Преврати устный рассказ в связный литературный текст от первого лица.
Сохрани ВСЕ факты: имена, даты, места, числа, последовательность событий. Ничего не выдумывай.
Можно улучшать язык, выстраивать абзацы и вплетать в текст ответы автора на уточняющие вопросы.
Сохраняй голос автора по профилю стиля, если он дан. Известных людей называй так, как их зовёт автор.
Верни JSON:
{\"edited_memoir_text\": \"текст\", \"title\": \"короткое название\", \"tags\": [\"тема\"], \"people\": [\"имя\"], \"places\": [\"место\"]}
Только JSON, без markdown.";

pub const CREATIVE_PROMPT: &str = "Ты писатель, который бережно превращает воспоминание в художественный рассказ.
Сохрани факты и события автора, но можешь добавить детали обстановки, запахи, звуки, погоду и внутренние \
ощущения, которые естественно дополняют рассказ. Не меняй имена, даты и места, не добавляй новых событий.
Пиши от первого лица, в тоне главы, если дано её краткое содержание.
Верни только текст рассказа, без заголовка и пояснений.";

fn gender_instruction(gender: Option<Gender>) -> &'static str {
    match gender {
        Some(Gender::Female) => {
            "Автор женщина: глаголы прошедшего времени от первого лица ставь в женском роде («я пошла», «я была»)."
        }
        Some(Gender::Male) => {
            "Автор мужчина: глаголы прошедшего времени от первого лица ставь в мужском роде («я пошёл», «я был»)."
        }
        None => "Пол автора не указан: определи его по формам глаголов в рассказе («пошла» или «пошёл») и выдерживай согласование.",
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EditorContext<'a> {
    pub characters: &'a [Character],
    pub places: &'a [(String, u32)],
    pub style_profile: Option<&'a str>,
    pub thread: &'a [ClarificationEntry],
    pub gender: Option<Gender>,
    pub chapter_summary: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StrictEdit {
    #[serde(default)]
    pub edited_memoir_text: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub people: Vec<String>,
    #[serde(default)]
    pub places: Vec<String>,
}

impl StrictEdit {
    pub fn fallback(cleaned: &str) -> Self {
        Self {
            edited_memoir_text: cleaned.to_string(),
            title: UNTITLED.to_string(),
            tags: Vec::new(),
            people: Vec::new(),
            places: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LiteraryEditor {
    llm: Arc<dyn LlmClient>,
}

impl LiteraryEditor {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn strict(&self, cleaned: &str, ctx: &EditorContext<'_>) -> StrictEdit {
        let system = format!("{}\n{}", STRICT_PROMPT, gender_instruction(ctx.gender));
        let user = render_user_prompt(cleaned, ctx, false);

        let reply = match self.llm.chat(&system, &user, ChatParams::editor(0.5, 4000)).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("Editor error: {:#}", e);
                return StrictEdit::fallback(cleaned);
            }
        };
        let mut edit: StrictEdit = match parse_json(&reply) {
            Ok(edit) => edit,
            Err(e) => {
                error!("Editor returned invalid JSON: {:#}", e);
                return StrictEdit::fallback(cleaned);
            }
        };

        if edit.edited_memoir_text.trim().is_empty() {
            return StrictEdit::fallback(cleaned);
        }
        edit.edited_memoir_text = edit.edited_memoir_text.trim().to_string();
        edit.title = edit.title.trim().to_string();
        if edit.title.is_empty() {
            edit.title = UNTITLED.to_string();
        }
        for list in [&mut edit.tags, &mut edit.people, &mut edit.places] {
            list.retain(|item| !item.trim().is_empty());
        }
        edit
    }

    pub async fn creative(&self, cleaned: &str, ctx: &EditorContext<'_>) -> String {
        let system = format!("{}\n{}", CREATIVE_PROMPT, gender_instruction(ctx.gender));
        let user = render_user_prompt(cleaned, ctx, true);

        match self.llm.chat(&system, &user, ChatParams::editor(0.8, 4000)).await {
            Ok(reply) => strip_code_blocks(&reply),
            Err(e) => {
                error!("Creative editor error: {:#}", e);
                String::new()
            }
        }
    }

    pub async fn edit_both(&self, cleaned: &str, ctx: &EditorContext<'_>) -> (StrictEdit, String) {
        join(self.strict(cleaned, ctx), self.creative(cleaned, ctx)).await
    }
}

fn render_user_prompt(cleaned: &str, ctx: &EditorContext<'_>, creative: bool) -> String {
    let mut prompt = format!(
        "ИЗВЕСТНЫЕ ЛЮДИ:\n{}\n\nИЗВЕСТНЫЕ МЕСТА:\n{}",
        format_characters_for_editor(ctx.characters),
        format_places(ctx.places)
    );
    if let Some(style) = ctx.style_profile.filter(|s| !s.trim().is_empty()) {
        prompt.push_str(&format!("\n\nПРОФИЛЬ СТИЛЯ АВТОРА:\n{}", style));
    }
    if creative {
        if let Some(summary) = ctx.chapter_summary.filter(|s| !s.trim().is_empty()) {
            prompt.push_str(&format!("\n\nКРАТКОЕ СОДЕРЖАНИЕ ГЛАВЫ:\n{}", summary));
        }
    }
    let answered: Vec<String> = ctx
        .thread
        .windows(2)
        .filter_map(|pair| match pair {
            [q, a] if q.role == ClarificationRole::Question && a.role == ClarificationRole::Answer => {
                Some(format!("В: {}\nО: {}", q.text, a.text))
            }
            _ => None,
        })
        .collect();
    if !answered.is_empty() {
        prompt.push_str(&format!("\n\nУТОЧНЕНИЯ АВТОРА:\n{}", answered.join("\n")));
    }
    prompt.push_str(&format!("\n\nРАССКАЗ:\n{}", cleaned));
    prompt
}
