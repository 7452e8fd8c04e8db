pub mod export;
pub mod library;
pub mod llm;
pub mod prompt;
pub mod workflow;
