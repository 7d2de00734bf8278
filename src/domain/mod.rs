pub mod error;
pub mod llm_config;
pub mod parameter;
pub mod prompt;
pub mod query;
pub mod template;
