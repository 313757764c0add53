use crate::services::llm::{parse_json, ChatParams, LlmClient};
use crate::utils::text::quoted_spans;
use log::{debug, error};
use serde::Deserialize;
use std::sync::Arc;

pub const SYSTEM_PROMPT: &str = "Ты вносишь правку автора в текст его воспоминания.
Меняй только то место, на которое указывает правка. Всё остальное оставь буква в букву.
Если не можешь уверенно найти в тексте то, о чём говорит правка, ничего не меняй и верни \"applied\": false.
Верни JSON {\"applied\": true|false, \"text\": \"полный текст после правки\"}. Только JSON, без markdown.";

#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionOutcome {
    pub text: String,
    pub applied: bool,
}

impl CorrectionOutcome {
    fn unchanged(text: &str) -> Self {
        Self { text: text.to_string(), applied: false }
    }
}

#[derive(Deserialize)]
struct CorrectionReply {
    #[serde(default)]
    applied: bool,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Clone)]
pub struct Corrector {
    llm: Arc<dyn LlmClient>,
}

impl Corrector {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    // Unlocatable corrections leave the text byte-for-byte unchanged.
    pub async fn apply(&self, text: &str, instruction: &str) -> CorrectionOutcome {
        let instruction = instruction.trim();
        if instruction.is_empty() {
            return CorrectionOutcome::unchanged(text);
        }

        // Quoted spans name what to change; if none of them occurs, there is nothing to correct.
        let spans = quoted_spans(instruction);
        if !spans.is_empty() && !spans.iter().any(|s| text.contains(s.as_str())) {
            debug!("None of {:?} occurs in the text, skipping correction", spans);
            return CorrectionOutcome::unchanged(text);
        }

        let user = format!("ТЕКСТ:\n{}\n\nПРАВКА:\n{}", text, instruction);
        let reply = match self.llm.chat(SYSTEM_PROMPT, &user, ChatParams::editor(0.1, 4000)).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("Correction error: {:#}", e);
                return CorrectionOutcome::unchanged(text);
            }
        };
        match parse_json::<CorrectionReply>(&reply) {
            Ok(reply) if reply.applied && !reply.text.trim().is_empty() => CorrectionOutcome {
                text: reply.text.trim().to_string(),
                applied: true,
            },
            Ok(_) => CorrectionOutcome::unchanged(text),
            Err(e) => {
                error!("Correction returned bad JSON: {:#}", e);
                CorrectionOutcome::unchanged(text)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::ScriptedLlm;

    const TEXT: &str = "Летом 1965 года мы с братом Петей поехали в Казань.  ";

    fn corrector(reply: &str) -> (Corrector, Arc<ScriptedLlm>) {
        let llm = Arc::new(ScriptedLlm::new().on(SYSTEM_PROMPT, reply));
        (Corrector::new(llm.clone()), llm)
    }

    #[tokio::test]
    async fn test_applies_located_correction() {
        let (corrector, _) =
            corrector(r#"{"applied": true, "text": "Летом 1966 года мы с братом Петей поехали в Казань."}"#);
        let outcome = corrector.apply(TEXT, "замени «1965» на «1966»").await;
        assert!(outcome.applied);
        assert_eq!(outcome.text, "Летом 1966 года мы с братом Петей поехали в Казань.");
    }

    #[tokio::test]
    async fn test_unknown_quoted_span_is_untouched_without_a_call() {
        let (corrector, llm) = corrector(r#"{"applied": true, "text": "что-то другое"}"#);
        let outcome = corrector.apply(TEXT, "замени «Москва» на «Ленинград»").await;
        assert_eq!(outcome, CorrectionOutcome::unchanged(TEXT));
        assert_eq!(outcome.text.as_bytes(), TEXT.as_bytes());
        assert_eq!(llm.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_not_applied_keeps_bytes() {
        let (corrector, _) = corrector(r#"{"applied": false, "text": "Летом 1965 года мы с братом Петей поехали в Казань."}"#);
        let outcome = corrector.apply(TEXT, "поменяй имя собаки").await;
        assert!(!outcome.applied);
        assert_eq!(outcome.text, TEXT);
    }

    #[tokio::test]
    async fn test_failures_keep_bytes() {
        let (prose, _) = corrector("Исправил!");
        assert_eq!(prose.apply(TEXT, "исправь год").await.text, TEXT);

        let failing = Corrector::new(Arc::new(ScriptedLlm::new().failing_on(SYSTEM_PROMPT)));
        assert_eq!(failing.apply(TEXT, "исправь год").await.text, TEXT);

        let (blank, llm) = corrector(r#"{"applied": true, "text": "x"}"#);
        assert_eq!(blank.apply(TEXT, "   ").await.text, TEXT);
        assert_eq!(llm.total_calls(), 0);
    }
}
