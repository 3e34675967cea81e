mod config;
mod export;
mod gemini;
mod generation;
mod retry;
mod session;
mod ui;
mod workflow;

use anyhow::Result;
use config::Config;
use gemini::GeminiBackend;
use generation::GenerationClient;
use std::sync::Arc;
use workflow::WorkflowManager;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Put api_key in config.yml or set GEMINI_API_KEY.");
            return Err(e);
        }
    };
    config.ensure_directories()?;

    let backend = Arc::new(GeminiBackend::new(&config.api_key));
    let generation = GenerationClient::new(backend, &config);
    let workflow = WorkflowManager::new(config.clone(), generation);

    ui::run(workflow, &config).await
}
