use crate::services::llm::{ChatParams, LlmClient};
use log::{debug, error};
use std::sync::Arc;

pub const SYSTEM_PROMPT: &str = "Ты очищаешь расшифровку устного рассказа пожилого человека.
Убери слова-паразиты («ну», «вот», «как бы», «это самое»), оговорки и повторы, \
аккуратно поправь грамматику и пунктуацию.
Сохрани рассказ от первого лица, манеру речи автора и все факты: имена, даты, места, числа.
Ничего не добавляй от себя и не сокращай содержание.
Верни только очищенный текст, без пояснений.";

#[derive(Debug, Clone)]
pub struct Cleaner {
    llm: Arc<dyn LlmClient>,
}

impl Cleaner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn clean(&self, raw: &str) -> String {
        if raw.trim().is_empty() {
            return raw.to_string();
        }
        match self.llm.chat(SYSTEM_PROMPT, raw, ChatParams::fast(0.3, 4000)).await {
            Ok(reply) => {
                let cleaned = reply.trim();
                if cleaned.is_empty() {
                    debug!("Cleaner returned nothing, keeping raw transcript");
                    raw.to_string()
                } else {
                    cleaned.to_string()
                }
            }
            Err(e) => {
                error!("Cleaning error: {:#}", e);
                raw.to_string()
            }
        }
    }
}
