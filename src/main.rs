use anyhow::Result;
use social_story::core::config::Config;
use social_story::core::io::NativeStorage;
use social_story::core::state::{SharedStory, StoryState};
use social_story::services::llm::create_service;
use social_story::services::workflow::StoryWorkflow;
use social_story::ui::App;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {:#}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM settings.");
            return Err(e);
        }
    };

    config.ensure_directories()?;

    let service = Arc::from(create_service(&config)?);
    let workflow = StoryWorkflow::new(service);

    let (state, updates) = StoryState::with_updates();
    let story = SharedStory::new(state);
    let storage = Arc::new(NativeStorage::new("."));

    let mut app = App::new(config, workflow, story, updates, storage);
    app.run().await?;

    Ok(())
}
