use crate::core::config::Config;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String, // "gemini", "ollama" or "openai"
    pub gemini: Option<GeminiConfig>,
    pub ollama: Option<OllamaConfig>,
    pub openai: Option<OpenAIConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub model: String,
    pub fast_model: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub fast_model: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
    pub fast_model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Editor,
    Fast,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChatParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub tier: ModelTier,
}

impl ChatParams {
    pub fn fast(temperature: f32, max_tokens: u32) -> Self {
        Self { temperature, max_tokens, tier: ModelTier::Fast }
    }

    pub fn editor(temperature: f32, max_tokens: u32) -> Self {
        Self { temperature, max_tokens, tier: ModelTier::Editor }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    async fn chat(&self, system: &str, user: &str, params: ChatParams) -> Result<String>;
}

pub fn create_llm(config: &Config) -> Result<Box<dyn LlmClient>> {
    match config.llm.provider.as_str() {
        "gemini" => {
            let cfg = config.llm.gemini.as_ref().context("Gemini config missing")?;
            Ok(Box::new(GeminiClient::new(&cfg.api_key, Models::new(&cfg.model, cfg.fast_model.as_deref()))))
        }
        "ollama" => {
            let cfg = config.llm.ollama.as_ref().context("Ollama config missing")?;
            Ok(Box::new(OllamaClient::new(&cfg.base_url, Models::new(&cfg.model, cfg.fast_model.as_deref()))))
        }
        "openai" => {
            let cfg = config.llm.openai.as_ref().context("OpenAI config missing")?;
            Ok(Box::new(OpenAIClient::new(
                &cfg.api_key,
                Models::new(&cfg.model, cfg.fast_model.as_deref()),
                cfg.base_url.as_deref(),
            )))
        }
        _ => Err(anyhow!("Unknown LLM provider: {}", config.llm.provider)),
    }
}

pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json").trim_end_matches("```").trim().to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```").trim_end_matches("```").trim().to_string()
    } else {
        s.to_string()
    }
}

// Falls back to the outermost {..} or [..] span when the whole reply is not JSON.
pub fn parse_json<T: DeserializeOwned>(reply: &str) -> Result<T> {
    let clean = strip_code_blocks(reply);
    match serde_json::from_str(&clean) {
        Ok(value) => Ok(value),
        Err(first_err) => {
            let start = clean.find(['{', '[']);
            let end = clean.rfind(['}', ']']);
            if let (Some(start), Some(end)) = (start, end) {
                if start < end {
                    if let Ok(value) = serde_json::from_str(&clean[start..=end]) {
                        return Ok(value);
                    }
                }
            }
            let preview: String = clean.chars().take(200).collect();
            Err(anyhow!("Invalid JSON from model: {}. Body: {}", first_err, preview))
        }
    }
}

#[derive(Debug, Clone)]
struct Models {
    editor: String,
    fast: String,
}

impl Models {
    fn new(model: &str, fast_model: Option<&str>) -> Self {
        Self {
            editor: model.to_string(),
            fast: fast_model.unwrap_or(model).to_string(),
        }
    }

    fn pick(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Editor => &self.editor,
            ModelTier::Fast => &self.fast,
        }
    }
}

// --- Gemini ---
#[derive(Debug)]
struct GeminiClient {
    api_key: String,
    models: Models,
    client: reqwest::Client,
}

impl GeminiClient {
    fn new(api_key: &str, models: Models) -> Self {
        Self {
            api_key: api_key.to_string(),
            models,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize)]
struct GeminiGenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<GeminiError>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
struct GeminiPartResponse {
    text: String,
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    message: String,
}

impl GeminiResponse {
    fn into_text(self) -> Result<String> {
        if let Some(err) = self.error {
            return Err(anyhow!("Gemini API returned error: {}", err.message));
        }
        let first = self
            .candidates
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| anyhow!("Gemini response has no candidates"))?;
        if let Some(part) = first.content.and_then(|c| c.parts.into_iter().next()) {
            return Ok(part.text);
        }
        let reason = first.finish_reason.as_deref().unwrap_or("UNKNOWN");
        Err(anyhow!("Gemini response empty. Finish reason: {}", reason))
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn chat(&self, system: &str, user: &str, params: ChatParams) -> Result<String> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.models.pick(params.tier),
            self.api_key
        );

        let request_body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart { text: user.to_string() }],
            }],
            system_instruction: Some(GeminiSystemInstruction {
                parts: vec![GeminiPart { text: system.to_string() }],
            }),
            generation_config: GeminiGenerationConfig {
                temperature: params.temperature,
                max_output_tokens: params.max_tokens,
            },
        };

        let resp = self.client.post(&url).json(&request_body).send().await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("Gemini API error: {}", error_text));
        }

        let response_text = resp.text().await?;
        let result: GeminiResponse = serde_json::from_str(&response_text)
            .map_err(|e| anyhow!("Failed to parse Gemini response: {}. Body: {}", e, response_text))?;
        result.into_text()
    }
}

// --- Ollama ---
#[derive(Debug)]
struct OllamaClient {
    base_url: String,
    models: Models,
    client: reqwest::Client,
}

impl OllamaClient {
    fn new(base_url: &str, models: Models) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            models,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessageResponse,
}

#[derive(Deserialize)]
struct OllamaMessageResponse {
    content: String,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

fn messages(system: &str, user: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage { role: "system".to_string(), content: system.to_string() },
        ChatMessage { role: "user".to_string(), content: user.to_string() },
    ]
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn chat(&self, system: &str, user: &str, params: ChatParams) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url);

        let request_body = OllamaRequest {
            model: self.models.pick(params.tier).to_string(),
            messages: messages(system, user),
            stream: false,
            options: OllamaOptions {
                temperature: params.temperature,
                num_predict: params.max_tokens,
            },
        };

        let resp = self.client.post(&url).json(&request_body).send().await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("Ollama API error: {}", error_text));
        }

        let result: OllamaResponse = resp.json().await?;
        Ok(result.message.content)
    }
}

// --- OpenAI ---

#[derive(Debug)]
struct OpenAIClient {
    api_key: String,
    models: Models,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIClient {
    fn new(api_key: &str, models: Models, base_url: Option<&str>) -> Self {
        Self {
            api_key: api_key.to_string(),
            models,
            base_url: base_url.unwrap_or("https://api.openai.com/v1").trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessageResponse,
}

#[derive(Deserialize)]
struct OpenAIMessageResponse {
    content: Option<String>,
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn chat(&self, system: &str, user: &str, params: ChatParams) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);

        let request_body = OpenAIRequest {
            model: self.models.pick(params.tier).to_string(),
            messages: messages(system, user),
            temperature: params.temperature,
            max_tokens: params.max_tokens,
        };

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request_body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("OpenAI API error: {}", error_text));
        }

        let result: OpenAIResponse = resp.json().await?;
        result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!("OpenAI response empty or missing content"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_blocks() {
        assert_eq!(strip_code_blocks("json"), "json");
        assert_eq!(strip_code_blocks("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("```\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("  ```json  \n  {}  \n  ```  "), "{}");
    }

    #[derive(Deserialize, Debug, PartialEq)]
    struct Probe {
        is_complete: bool,
    }

    #[test]
    fn test_parse_json_fenced_and_wrapped() {
        let fenced: Probe = parse_json("```json\n{\"is_complete\": true}\n```").unwrap();
        assert!(fenced.is_complete);

        let wrapped: Probe = parse_json("Вот ответ: {\"is_complete\": false} Надеюсь, помог.").unwrap();
        assert!(!wrapped.is_complete);

        let list: Vec<String> = parse_json("[\"а\", \"б\"]").unwrap();
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_parse_json_rejects_prose() {
        assert!(parse_json::<Probe>("История выглядит законченной.").is_err());
        assert!(parse_json::<Probe>("").is_err());
    }

    #[test]
    fn test_fast_model_defaults_to_editor_model() {
        let models = Models::new("gpt-4o", None);
        assert_eq!(models.pick(ModelTier::Fast), "gpt-4o");
        let models = Models::new("gpt-4o", Some("gpt-4o-mini"));
        assert_eq!(models.pick(ModelTier::Fast), "gpt-4o-mini");
        assert_eq!(models.pick(ModelTier::Editor), "gpt-4o");
    }

    #[test]
    fn test_gemini_response_parsing_safety_block() {
        let json = r#"{
            "candidates": [
                {
                    "finishReason": "SAFETY",
                    "index": 0
                }
            ]
        }"#;

        let result: GeminiResponse = serde_json::from_str(json).unwrap();
        let err = result.into_text().unwrap_err();
        assert!(err.to_string().contains("SAFETY"));
    }

    #[test]
    fn test_gemini_response_parsing_success() {
        let json = r#"{
            "candidates": [
                {
                    "content": {
                        "parts": [
                            { "text": "{\"is_complete\": true}" }
                        ],
                        "role": "model"
                    },
                    "finishReason": "STOP",
                    "index": 0
                }
            ]
        }"#;

        let result: GeminiResponse = serde_json::from_str(json).unwrap();
        assert_eq!(result.into_text().unwrap(), "{\"is_complete\": true}");
    }

    #[test]
    fn test_openai_request_carries_sampling_params() {
        let body = OpenAIRequest {
            model: "gpt-4o-mini".into(),
            messages: messages("sys", "usr"),
            temperature: 0.4,
            max_tokens: 300,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["max_tokens"], 300);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "usr");
    }

    #[test]
    fn test_openai_response_parsing_success() {
        let json = r#"{
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "Привет"
                },
                "finish_reason": "stop"
            }]
        }"#;

        let result: OpenAIResponse = serde_json::from_str(json).unwrap();
        assert_eq!(result.choices[0].message.content.as_deref(), Some("Привет"));
    }
}
