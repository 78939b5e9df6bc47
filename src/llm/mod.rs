mod backend;
mod ping;
mod prompt;
mod runtime;

pub use backend::{ChatBackend, CommandBackend, GenerationParams, GenerationRequest};
pub use ping::{detect_device, ping_qwen, DeviceInfo, PingReport};
pub use prompt::{strip_prompt_echo, ChatMessage, ChatTemplate};
pub use runtime::{BackendLoader, BackendSource, ChatReply, ChatRequest, ChatRuntime, RuntimeInfo};

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Qwen runtime not available: {0}")]
    Unavailable(String),
    #[error("failed to load chat backend: {0}")]
    Load(String),
    #[error("chat backend failed: {0}")]
    Backend(String),
    #[error("invalid chat request: {0}")]
    InvalidRequest(String),
}
