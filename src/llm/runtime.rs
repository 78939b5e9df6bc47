use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::settings::AppConfig;

use super::{
    backend::{ChatBackend, CommandBackend, GenerationParams, GenerationRequest, ENV_CMD},
    prompt::{strip_prompt_echo, ChatMessage, ChatTemplate},
    LlmError,
};

#[cfg(feature = "llama-chat")]
use super::backend::{LlamaBackend, ENV_GGUF};

const DEFAULT_TEMPERATURE: f32 = 0.3;
const DEFAULT_TOP_P: f32 = 0.9;
const DEFAULT_MAX_NEW_TOKENS: i64 = 256;
const MAX_TEMPERATURE: f32 = 2.0;
const MAX_NEW_TOKENS: i64 = 4096;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_new_tokens: Option<i64>,
}

impl ChatRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Missing, null or zero values take the defaults; the rest are clamped
    /// into the range the runtimes accept.
    pub fn params(&self) -> GenerationParams {
        let float = |value: Option<f32>, default: f32, max: f32| match value {
            Some(v) if v.is_finite() && v != 0.0 => v.clamp(0.0, max),
            _ => default,
        };
        let max_new_tokens = match self.max_new_tokens {
            Some(0) | None => DEFAULT_MAX_NEW_TOKENS,
            Some(n) => n.clamp(1, MAX_NEW_TOKENS),
        };
        GenerationParams {
            temperature: float(self.temperature, DEFAULT_TEMPERATURE, MAX_TEMPERATURE),
            top_p: float(self.top_p, DEFAULT_TOP_P, 1.0),
            max_new_tokens: max_new_tokens as usize,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChatReply {
    pub ok: bool,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RuntimeInfo {
    pub ok: bool,
    /// Set once the backend has been loaded.
    pub backend: Option<String>,
    pub device: Option<String>,
    pub path: String,
    pub tokenizer_loaded: bool,
    pub model_loaded: bool,
    pub processor_loaded: bool,
}

pub type BackendLoader = Box<dyn Fn() -> Result<Arc<dyn ChatBackend>, LlmError> + Send + Sync>;

/// Where the chat backend comes from, resolved once at startup.
pub enum BackendSource {
    Command(PathBuf),
    #[cfg(feature = "llama-chat")]
    Gguf(PathBuf),
    Custom(BackendLoader),
    Missing,
}

impl BackendSource {
    pub fn from_env() -> Self {
        let read = |key: &str| {
            std::env::var(key)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(cmd) = read(ENV_CMD) {
            return BackendSource::Command(PathBuf::from(cmd));
        }

        #[cfg(feature = "llama-chat")]
        {
            if let Some(model) = read(ENV_GGUF) {
                return BackendSource::Gguf(PathBuf::from(model));
            }
        }

        BackendSource::Missing
    }

    pub fn custom<F>(loader: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn ChatBackend>, LlmError> + Send + Sync + 'static,
    {
        BackendSource::Custom(Box::new(loader))
    }

    fn is_configured(&self) -> bool {
        !matches!(self, BackendSource::Missing)
    }

    fn load(&self) -> Result<Arc<dyn ChatBackend>, LlmError> {
        match self {
            BackendSource::Command(path) => {
                Ok(Arc::new(CommandBackend::from_env(path.clone())?) as Arc<dyn ChatBackend>)
            }
            #[cfg(feature = "llama-chat")]
            BackendSource::Gguf(path) => {
                Ok(Arc::new(LlamaBackend::new(path.clone())?) as Arc<dyn ChatBackend>)
            }
            BackendSource::Custom(loader) => loader(),
            BackendSource::Missing => Err(not_configured()),
        }
    }
}

fn not_configured() -> LlmError {
    LlmError::Unavailable(format!("no chat backend configured; set {ENV_CMD}"))
}

/// Lazily loaded chat model. The backend is built on first use and shared by
/// every later request; a failed load is retried by the next request.
pub struct ChatRuntime {
    model_dir: PathBuf,
    fallback_repo: String,
    source: BackendSource,
    backend: OnceCell<Arc<dyn ChatBackend>>,
    template: OnceCell<ChatTemplate>,
}

impl ChatRuntime {
    pub fn new(config: &AppConfig, source: BackendSource) -> Self {
        Self {
            model_dir: config.qwen_model_path(),
            fallback_repo: config.qwen_repo.clone(),
            source,
            backend: OnceCell::new(),
            template: OnceCell::new(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config, BackendSource::from_env())
    }

    pub fn is_configured(&self) -> bool {
        self.source.is_configured()
    }

    /// The local snapshot when present, otherwise the hub repo id.
    pub fn model_reference(&self) -> String {
        if self.model_dir.is_dir() {
            self.model_dir.display().to_string()
        } else {
            self.fallback_repo.clone()
        }
    }

    fn backend(&self) -> Result<&Arc<dyn ChatBackend>, LlmError> {
        self.backend.get_or_try_init(|| {
            info!("Loading chat backend for {}", self.model_reference());
            let backend = self.source.load()?;
            info!("Chat backend ready: {}", backend.name());
            Ok(backend)
        })
    }

    /// Cached only once the snapshot's tokenizer config is on disk, so a
    /// chat served before the download does not pin the plain template.
    fn template(&self) -> ChatTemplate {
        if let Some(template) = self.template.get() {
            return *template;
        }
        match ChatTemplate::declared(&self.model_dir) {
            Some(template) => *self.template.get_or_init(|| template),
            None => ChatTemplate::Plain,
        }
    }

    pub fn chat(&self, request: &ChatRequest) -> Result<ChatReply, LlmError> {
        let text = request.text.trim();
        if text.is_empty() {
            return Err(LlmError::InvalidRequest("text must not be empty".into()));
        }

        let backend = self.backend()?;
        let messages = vec![ChatMessage::user(text)];
        let prompt = self.template().render(&messages);
        let generation = GenerationRequest {
            model_path: self.model_reference(),
            prompt,
            messages,
            params: request.params(),
        };

        let output = backend.generate(&generation)?;
        Ok(ChatReply {
            ok: true,
            text: strip_prompt_echo(&output, &generation.prompt, text),
        })
    }

    /// Reports what is resident without loading anything.
    pub fn info(&self) -> Result<RuntimeInfo, LlmError> {
        if !self.is_configured() {
            return Err(not_configured());
        }
        let backend = self.backend.get();
        let template_ready = self.template.get().is_some();
        Ok(RuntimeInfo {
            ok: true,
            backend: backend.map(|backend| backend.name().to_string()),
            device: backend.map(|backend| backend.device()),
            path: self.model_reference(),
            tokenizer_loaded: template_ready,
            model_loaded: backend.is_some(),
            processor_loaded: template_ready,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::path::Path;
    use std::{fs, thread};

    use parking_lot::Mutex;

    use super::*;

    /// Echoes the rendered prompt followed by a fixed reply and remembers
    /// the last request it saw.
    struct EchoBackend {
        reply: &'static str,
        last: Mutex<Option<GenerationRequest>>,
    }

    impl ChatBackend for EchoBackend {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn device(&self) -> String {
            "cpu".into()
        }

        fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError> {
            *self.last.lock() = Some(request.clone());
            Ok(format!("{}{}<|im_end|>", request.prompt, self.reply))
        }
    }

    fn config_for(root: &Path) -> AppConfig {
        AppConfig::from_lookup(|_| None).with_persist_dir(root)
    }

    fn counting_runtime(root: &Path, loads: Arc<AtomicUsize>) -> (ChatRuntime, Arc<EchoBackend>) {
        let backend = Arc::new(EchoBackend {
            reply: "Mbolo!",
            last: Mutex::new(None),
        });
        let shared = Arc::clone(&backend);
        let source = BackendSource::custom(move || {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::clone(&shared) as Arc<dyn ChatBackend>)
        });
        (ChatRuntime::new(&config_for(root), source), backend)
    }

    #[test]
    fn defaults_and_clamping() {
        let defaults = ChatRequest::new("hi").params();
        assert_eq!(defaults.temperature, 0.3);
        assert_eq!(defaults.top_p, 0.9);
        assert_eq!(defaults.max_new_tokens, 256);

        let zeros = ChatRequest {
            text: "hi".into(),
            temperature: Some(0.0),
            top_p: Some(0.0),
            max_new_tokens: Some(0),
        }
        .params();
        assert_eq!(zeros, defaults);

        let wild = ChatRequest {
            text: "hi".into(),
            temperature: Some(9.0),
            top_p: Some(-1.0),
            max_new_tokens: Some(100_000),
        }
        .params();
        assert_eq!(wild.temperature, 2.0);
        assert_eq!(wild.top_p, 0.0);
        assert_eq!(wild.max_new_tokens, 4096);
    }

    #[test]
    fn request_accepts_nulls() {
        let request: ChatRequest =
            serde_json::from_str(r#"{"text": "hi", "temperature": null}"#).unwrap();
        assert_eq!(request.params().temperature, 0.3);
    }

    #[test]
    fn chat_strips_echo_and_falls_back_to_repo() {
        let dir = tempfile::tempdir().unwrap();
        let loads = Arc::new(AtomicUsize::new(0));
        let (runtime, backend) = counting_runtime(dir.path(), Arc::clone(&loads));

        let reply = runtime.chat(&ChatRequest::new("  hello  ")).unwrap();
        assert_eq!(
            reply,
            ChatReply {
                ok: true,
                text: "Mbolo!".into()
            }
        );

        let seen = backend.last.lock().clone().unwrap();
        assert_eq!(seen.model_path, "Qwen/Qwen2.5-Omni-7B");
        assert_eq!(seen.prompt, "user: hello\nassistant: ");
        assert_eq!(seen.messages, vec![ChatMessage::user("hello")]);
    }

    #[test]
    fn local_snapshot_uses_its_template() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path());
        let model_dir = config.qwen_model_path();
        fs::create_dir_all(&model_dir).unwrap();
        fs::write(
            model_dir.join("tokenizer_config.json"),
            r#"{"chat_template": "<|im_start|>{{ role }}"}"#,
        )
        .unwrap();

        let loads = Arc::new(AtomicUsize::new(0));
        let (runtime, backend) = counting_runtime(dir.path(), loads);
        runtime.chat(&ChatRequest::new("hello")).unwrap();

        let seen = backend.last.lock().clone().unwrap();
        assert_eq!(seen.model_path, model_dir.display().to_string());
        assert!(seen.prompt.starts_with("<|im_start|>user\nhello"));
    }

    #[test]
    fn backend_loads_once_under_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let loads = Arc::new(AtomicUsize::new(0));
        let (runtime, _) = counting_runtime(dir.path(), Arc::clone(&loads));

        thread::scope(|scope| {
            for i in 0..8 {
                let runtime = &runtime;
                scope.spawn(move || runtime.chat(&ChatRequest::new(format!("q{i}"))).unwrap());
            }
        });
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        let info = runtime.info().unwrap();
        assert!(info.model_loaded);
        assert_eq!(info.backend.as_deref(), Some("echo"));
        assert_eq!(info.device.as_deref(), Some("cpu"));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn info_does_not_load_the_backend() {
        let dir = tempfile::tempdir().unwrap();
        let loads = Arc::new(AtomicUsize::new(0));
        let (runtime, _) = counting_runtime(dir.path(), Arc::clone(&loads));

        let info = runtime.info().unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 0);
        assert!(!info.model_loaded);
        assert!(!info.tokenizer_loaded);
        assert!(!info.processor_loaded);
        assert_eq!(info.backend, None);
        assert_eq!(info.device, None);
        assert_eq!(info.path, "Qwen/Qwen2.5-Omni-7B");
    }

    #[test]
    fn template_follows_a_later_snapshot_download() {
        let dir = tempfile::tempdir().unwrap();
        let loads = Arc::new(AtomicUsize::new(0));
        let (runtime, backend) = counting_runtime(dir.path(), loads);

        runtime.chat(&ChatRequest::new("hello")).unwrap();
        let first = backend.last.lock().clone().unwrap();
        assert_eq!(first.prompt, "user: hello\nassistant: ");
        assert!(!runtime.info().unwrap().tokenizer_loaded);

        let model_dir = config_for(dir.path()).qwen_model_path();
        fs::create_dir_all(&model_dir).unwrap();
        fs::write(
            model_dir.join("tokenizer_config.json"),
            r#"{"chat_template": "<|im_start|>{{ role }}"}"#,
        )
        .unwrap();

        runtime.chat(&ChatRequest::new("hello")).unwrap();
        let second = backend.last.lock().clone().unwrap();
        assert_eq!(second.model_path, model_dir.display().to_string());
        assert!(second.prompt.starts_with("<|im_start|>user\nhello"));
        assert!(runtime.info().unwrap().tokenizer_loaded);
    }

    #[test]
    fn empty_text_is_rejected_before_loading() {
        let dir = tempfile::tempdir().unwrap();
        let loads = Arc::new(AtomicUsize::new(0));
        let (runtime, _) = counting_runtime(dir.path(), Arc::clone(&loads));
        let err = runtime.chat(&ChatRequest::new("   ")).unwrap_err();
        assert!(matches!(err, LlmError::InvalidRequest(_)));
        assert_eq!(loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn missing_backend_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = ChatRuntime::new(&config_for(dir.path()), BackendSource::Missing);
        assert!(!runtime.is_configured());
        assert!(matches!(
            runtime.chat(&ChatRequest::new("hi")),
            Err(LlmError::Unavailable(_))
        ));
        assert!(matches!(runtime.info(), Err(LlmError::Unavailable(_))));
    }

    #[test]
    fn failed_load_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let source = BackendSource::custom(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(LlmError::Load("weights still downloading".into()));
            }
            Ok(Arc::new(EchoBackend {
                reply: "ok",
                last: Mutex::new(None),
            }) as Arc<dyn ChatBackend>)
        });
        let runtime = ChatRuntime::new(&config_for(dir.path()), source);

        assert!(matches!(
            runtime.chat(&ChatRequest::new("hi")),
            Err(LlmError::Load(_))
        ));
        assert_eq!(runtime.chat(&ChatRequest::new("hi")).unwrap().text, "ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
