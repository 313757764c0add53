use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::services::llm::LlmConfig;
use crate::services::stt::SttConfig;

const CONFIG_FILE: &str = "config.yml";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_storage")]
    pub storage_folder: String,

    pub llm: LlmConfig,

    pub stt: SttConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_max_clarification_rounds")]
    pub max_clarification_rounds: u8,
    #[serde(default = "default_stt_confidence_threshold")]
    pub stt_confidence_threshold: f32,
    #[serde(default = "default_min_story_chars")]
    pub min_story_chars: usize,
    #[serde(default = "default_min_answer_chars")]
    pub min_answer_chars: usize,
    #[serde(default = "default_max_correction_rounds")]
    pub max_correction_rounds: u8,
    #[serde(default = "default_free_memories_limit")]
    pub free_memories_limit: u32,
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_clarification_rounds: default_max_clarification_rounds(),
            stt_confidence_threshold: default_stt_confidence_threshold(),
            min_story_chars: default_min_story_chars(),
            min_answer_chars: default_min_answer_chars(),
            max_correction_rounds: default_max_correction_rounds(),
            free_memories_limit: default_free_memories_limit(),
            preview_chars: default_preview_chars(),
        }
    }
}

fn default_storage() -> String {
    "data".to_string()
}
fn default_max_clarification_rounds() -> u8 {
    3
}
fn default_stt_confidence_threshold() -> f32 {
    0.3
}
fn default_min_story_chars() -> usize {
    20
}
fn default_min_answer_chars() -> usize {
    2
}
fn default_max_correction_rounds() -> u8 {
    3
}
fn default_free_memories_limit() -> u32 {
    5
}
fn default_preview_chars() -> usize {
    1500
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(content)?)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write(CONFIG_FILE, content).context("Failed to write config.yml")?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.storage_folder)?;
        Ok(())
    }
}
