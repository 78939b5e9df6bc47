pub mod api;
pub mod core;
pub mod llm;
pub mod models;
