use std::sync::Arc;

use crate::llm::ChatRuntime;
use crate::models::hub::{hub_registry, RegistryFactory};

use super::{jobs::JobRegistry, settings::AppConfig};

/// Shared by every request handler; clones are cheap.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub jobs: JobRegistry,
    pub chat: Arc<ChatRuntime>,
    pub registry: RegistryFactory,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let chat = ChatRuntime::from_config(&config);
        Self::with_parts(config, chat, hub_registry())
    }

    pub fn with_parts(config: AppConfig, chat: ChatRuntime, registry: RegistryFactory) -> Self {
        Self {
            config: Arc::new(config),
            jobs: JobRegistry::new(),
            chat: Arc::new(chat),
            registry,
        }
    }
}
