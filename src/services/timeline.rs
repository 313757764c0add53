use crate::core::state::{TimeHint, TimeHintKind};
use crate::services::llm::{parse_json, ChatParams, LlmClient};
use log::error;
use std::sync::Arc;

pub const SYSTEM_PROMPT: &str = "Ты определяешь, к какому времени относится воспоминание.
Верни JSON {\"type\": \"year|range|relative|unknown\", \"value\": \"...\", \"confidence\": 0.0-1.0}.
year: назван год («1965»). range: период («1960-1965», «60-е годы»). \
relative: время относительно жизни автора («в первом классе», «после армии»). \
unknown: время не понять.
Только JSON, без markdown.";

#[derive(Debug, Clone)]
pub struct TimelineExtractor {
    llm: Arc<dyn LlmClient>,
}

impl TimelineExtractor {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn extract(&self, text: &str) -> TimeHint {
        let reply = match self.llm.chat(SYSTEM_PROMPT, text, ChatParams::fast(0.2, 200)).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("Timeline extraction error: {:#}", e);
                return TimeHint::unknown();
            }
        };
        match parse_json::<TimeHint>(&reply) {
            Ok(mut hint) => {
                hint.value = hint.value.trim().to_string();
                hint.confidence = hint.confidence.clamp(0.0, 1.0);
                if hint.kind == TimeHintKind::Unknown {
                    hint.confidence = 0.0;
                }
                hint
            }
            Err(e) => {
                error!("Timeline returned bad JSON: {:#}", e);
                TimeHint::unknown()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::ScriptedLlm;

    async fn extract(reply: &str) -> TimeHint {
        let llm = ScriptedLlm::new().on(SYSTEM_PROMPT, reply);
        TimelineExtractor::new(Arc::new(llm)).extract("В 1965 году мы переехали.").await
    }

    #[tokio::test]
    async fn test_year_hint() {
        let hint = extract(r#"{"type": "year", "value": "1965", "confidence": 0.9}"#).await;
        assert_eq!(hint.kind, TimeHintKind::Year);
        assert_eq!(hint.value, "1965");
        assert!((hint.confidence - 0.9).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_out_of_range_confidence_is_clamped() {
        let hint = extract(r#"{"type": "range", "value": "60-е", "confidence": 7}"#).await;
        assert_eq!(hint.kind, TimeHintKind::Range);
        assert_eq!(hint.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_fallbacks_are_unknown() {
        assert_eq!(extract("Примерно шестидесятые").await, TimeHint::unknown());
        let failing = TimelineExtractor::new(Arc::new(ScriptedLlm::new().failing_on(SYSTEM_PROMPT)));
        let hint = failing.extract("текст").await;
        assert_eq!(hint, TimeHint { kind: TimeHintKind::Unknown, value: String::new(), confidence: 0.0 });
    }
}
