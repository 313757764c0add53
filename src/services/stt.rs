use crate::core::config::Config;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, error};
use reqwest::{multipart, Client};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SttConfig {
    #[serde(default = "default_stt_provider")]
    pub provider: String,
    pub openai: Option<OpenAiSttConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAiSttConfig {
    pub api_key: String,
    #[serde(default = "default_stt_model")]
    pub model: String,
    #[serde(default = "default_stt_language")]
    pub language: String,
    pub base_url: Option<String>,
}

fn default_stt_provider() -> String {
    "openai".to_string()
}
fn default_stt_model() -> String {
    "gpt-4o-transcribe".to_string()
}
fn default_stt_language() -> String {
    "ru".to_string()
}

#[async_trait]
pub trait SpeechToText: Send + Sync + Debug {
    async fn transcribe(&self, audio: &[u8]) -> Result<String>;
}

pub fn create_stt(config: &Config) -> Result<Box<dyn SpeechToText>> {
    match config.stt.provider.as_str() {
        "openai" => {
            let cfg = config.stt.openai.as_ref().context("OpenAI STT config missing")?;
            Ok(Box::new(OpenAiTranscriber::new(cfg)))
        }
        _ => Err(anyhow!("Unknown STT provider: {}", config.stt.provider)),
    }
}

#[derive(Debug)]
struct OpenAiTranscriber {
    api_key: String,
    model: String,
    language: String,
    base_url: String,
    client: Client,
}

impl OpenAiTranscriber {
    fn new(cfg: &OpenAiSttConfig) -> Self {
        Self {
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            language: cfg.language.clone(),
            base_url: cfg
                .base_url
                .as_deref()
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl SpeechToText for OpenAiTranscriber {
    async fn transcribe(&self, audio: &[u8]) -> Result<String> {
        debug!("Uploading voice message ({} bytes)", audio.len());
        let part = multipart::Part::bytes(audio.to_vec())
            .file_name("voice.ogg")
            .mime_str("audio/ogg")
            .context("Invalid mime type")?;

        let form = multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("language", self.language.clone())
            .text("response_format", "text");

        let resp = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .context("Failed to send transcription request")?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("Transcription API error: {}", error_text));
        }

        Ok(resp.text().await?.trim().to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transcription {
    pub text: String,
    pub confidence: f32,
}

impl Transcription {
    pub fn failed() -> Self {
        Self { text: String::new(), confidence: 0.0 }
    }

    pub fn is_usable(&self, threshold: f32) -> bool {
        !self.text.trim().is_empty() && self.confidence >= threshold
    }
}

const CONFIDENCE_FLOOR: f32 = 0.3;
const CONFIDENCE_CEILING: f32 = 0.95;
const MIN_TRANSCRIPT_CHARS: usize = 3;
// Below this many characters per expected character the recording is treated as silence.
const MIN_TEXT_RATIO: f32 = 0.05;

pub fn estimate_confidence(text: &str, audio_len: usize) -> f32 {
    let chars = text.trim().chars().count();
    if chars < MIN_TRANSCRIPT_CHARS {
        return 0.0;
    }
    let expected = (audio_len as f32 * 0.001).max(1.0);
    let ratio = chars as f32 / expected;
    if ratio < MIN_TEXT_RATIO {
        return 0.0;
    }
    ratio.min(1.0).clamp(CONFIDENCE_FLOOR, CONFIDENCE_CEILING)
}

#[derive(Debug, Clone)]
pub struct Transcriber {
    stt: Arc<dyn SpeechToText>,
}

impl Transcriber {
    pub fn new(stt: Arc<dyn SpeechToText>) -> Self {
        Self { stt }
    }

    pub async fn transcribe(&self, audio: &[u8]) -> Transcription {
        match self.stt.transcribe(audio).await {
            Ok(text) => {
                let text = text.trim().to_string();
                if text.is_empty() {
                    return Transcription::failed();
                }
                let confidence = estimate_confidence(&text, audio.len());
                debug!("Transcribed {} chars, confidence {:.2}", text.chars().count(), confidence);
                Transcription { text, confidence }
            }
            Err(e) => {
                error!("STT error: {:#}", e);
                Transcription::failed()
            }
        }
    }
}
