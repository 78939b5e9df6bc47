use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

#[cfg(feature = "llama-chat")]
use std::sync::Arc;

#[cfg(feature = "llama-chat")]
use llama_cpp::{
    standard_sampler::{SamplerStage, StandardSampler},
    LlamaModel, LlamaParams, SessionParams,
};

use super::{ping::detect_device, prompt::ChatMessage, LlmError};

pub(crate) const ENV_CMD: &str = "QWEN_CHAT_CMD";
pub(crate) const ENV_ARGS: &str = "QWEN_CHAT_ARGS";
pub(crate) const ENV_TIMEOUT: &str = "QWEN_CHAT_TIMEOUT_SECS";
#[cfg(feature = "llama-chat")]
pub(crate) const ENV_GGUF: &str = "QWEN_GGUF";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_new_tokens: usize,
}

/// Everything a backend needs for one completion. `prompt` is already
/// rendered with the model's chat template; `messages` are kept for runtimes
/// that apply their own.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub model_path: String,
    pub prompt: String,
    pub messages: Vec<ChatMessage>,
    #[serde(flatten)]
    pub params: GenerationParams,
}

pub trait ChatBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn device(&self) -> String;

    /// Returns the raw decoded output, which may still contain the prompt.
    fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError>;
}

/// Runs an external inference program per request. The request is written
/// to stdin as JSON; stdout is either `{"text": ...}` or the plain reply.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    path: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandBackend {
    pub fn new(path: PathBuf, args: Vec<String>, timeout: Duration) -> Result<Self, LlmError> {
        if !path.exists() {
            return Err(LlmError::Load(format!(
                "{ENV_CMD} points to missing binary: {}",
                path.display()
            )));
        }
        Ok(Self {
            path,
            args,
            timeout,
        })
    }

    pub fn from_env(path: PathBuf) -> Result<Self, LlmError> {
        let args = std::env::var(ENV_ARGS)
            .map(|value| value.split_whitespace().map(|s| s.to_string()).collect())
            .unwrap_or_default();

        let timeout = std::env::var(ENV_TIMEOUT)
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);

        Self::new(path, args, timeout)
    }

    fn run(&self, input: &[u8]) -> Result<String, LlmError> {
        let mut child = Command::new(&self.path)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                LlmError::Backend(format!("failed to spawn {}: {err}", self.path.display()))
            })?;

        // Dropping stdin closes it so the program sees EOF.
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input).map_err(|err| {
                LlmError::Backend(format!("failed to write request to chat command: {err}"))
            })?;
        }

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let start = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(err) => {
                    kill(&mut child);
                    return Err(LlmError::Backend(format!(
                        "failed polling chat command: {err}"
                    )));
                }
            }

            if start.elapsed() > self.timeout {
                kill(&mut child);
                return Err(LlmError::Backend(format!(
                    "chat command exceeded {:?} timeout",
                    self.timeout
                )));
            }

            thread::sleep(POLL_INTERVAL);
        };

        let stdout = collect(stdout);
        if !status.success() {
            let stderr = collect(stderr);
            return Err(LlmError::Backend(format!(
                "chat command exited with status {:?}: {}",
                status.code(),
                String::from_utf8_lossy(&stderr).trim()
            )));
        }

        let text = String::from_utf8(stdout)
            .map_err(|_| LlmError::Backend("chat command returned non-UTF8 text".into()))?;
        Ok(reply_text(text.trim()))
    }
}

impl ChatBackend for CommandBackend {
    fn name(&self) -> &'static str {
        "command"
    }

    fn device(&self) -> String {
        detect_device().device
    }

    fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError> {
        let input = serde_json::to_vec(request)
            .map_err(|err| LlmError::Backend(format!("encode chat request: {err}")))?;
        self.run(&input)
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn reply_text(stdout: &str) -> String {
    match serde_json::from_str::<Value>(stdout) {
        Ok(Value::Object(map)) => match map.get("text").and_then(Value::as_str) {
            Some(text) => text.to_string(),
            None => stdout.to_string(),
        },
        _ => stdout.to_string(),
    }
}

/// In-process GGUF inference through llama.cpp.
#[cfg(feature = "llama-chat")]
pub struct LlamaBackend {
    model: Arc<LlamaModel>,
}

#[cfg(feature = "llama-chat")]
impl LlamaBackend {
    pub fn new(model_path: PathBuf) -> Result<Self, LlmError> {
        if !model_path.exists() {
            return Err(LlmError::Load(format!(
                "{ENV_GGUF} points to missing model file: {}",
                model_path.display()
            )));
        }

        let model = LlamaModel::load_from_file(&model_path, LlamaParams::default())
            .map_err(|err| LlmError::Load(format!("failed to load GGUF model: {err:?}")))?;

        Ok(Self {
            model: Arc::new(model),
        })
    }
}

#[cfg(feature = "llama-chat")]
impl ChatBackend for LlamaBackend {
    fn name(&self) -> &'static str {
        "llama.cpp"
    }

    fn device(&self) -> String {
        detect_device().device
    }

    fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError> {
        let mut session = self
            .model
            .create_session(SessionParams::default())
            .map_err(|err| LlmError::Backend(format!("failed to create llama session: {err:?}")))?;

        session
            .advance_context(&request.prompt)
            .map_err(|err| LlmError::Backend(format!("failed to advance llama context: {err}")))?;

        let sampler = StandardSampler::new_softmax(
            vec![
                SamplerStage::Temperature(request.params.temperature),
                SamplerStage::TopP(request.params.top_p),
            ],
            1,
        );
        let stream = session
            .start_completing_with(sampler, request.params.max_new_tokens)
            .map_err(|err| LlmError::Backend(format!("failed to start llama completion: {err:?}")))?
            .into_strings();

        let mut output = String::new();
        for chunk in stream {
            output.push_str(&chunk);
            if output.contains("<|im_end|>") {
                break;
            }
        }
        Ok(output)
    }
}
