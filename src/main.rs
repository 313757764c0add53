mod console;

use anyhow::Result;
use memoir_pipeline::core::config::Config;
use memoir_pipeline::core::io::NativeStorage;
use memoir_pipeline::core::repository::{Repository, StorageRepository};
use memoir_pipeline::services::llm::{create_llm, LlmClient};
use memoir_pipeline::services::questions::seed_question_bank;
use memoir_pipeline::services::stt::{create_stt, SpeechToText};
use memoir_pipeline::services::workflow::{UserContext, WorkflowManager};
use std::path::Path;
use std::sync::Arc;

const QUESTION_BANK: &str = "questions.json";

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM and STT settings.");
            return Err(e);
        }
    };
    config.ensure_directories()?;

    let storage = Arc::new(NativeStorage::new(&config.storage_folder));
    let repo: Arc<dyn Repository> = Arc::new(StorageRepository::new(storage));

    let bank = Path::new(QUESTION_BANK);
    if bank.exists() {
        seed_question_bank(repo.as_ref(), bank).await?;
    }

    let llm: Arc<dyn LlmClient> = Arc::from(create_llm(&config)?);
    let stt: Arc<dyn SpeechToText> = Arc::from(create_stt(&config)?);
    let manager = WorkflowManager::new(config.pipeline.clone(), llm, stt, repo.clone());

    let user = UserContext {
        user_id: 1,
        display_name: std::env::var("USER").ok(),
        is_premium: true,
    };
    console::run(manager, repo.as_ref(), user, Path::new(&config.storage_folder)).await
}
