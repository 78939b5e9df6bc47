use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use serde_json::Value;

const TOKENIZER_CONFIG: &str = "tokenizer_config.json";
const IM_START: &str = "<|im_start|>";
const IM_END: &str = "<|im_end|>";
const END_MARKERS: &[&str] = &[IM_END, "<|endoftext|>"];
const USER: &str = "user";
const ASSISTANT: &str = "assistant";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: USER.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ChatTemplate {
    /// `<|im_start|>role\n...<|im_end|>` turns, as shipped by Qwen models.
    ChatMl,
    /// `role: content` lines; used when the model ships no template.
    Plain,
}

impl ChatTemplate {
    /// Picks the template declared in the model's `tokenizer_config.json`.
    pub fn detect(model_dir: &Path) -> Self {
        Self::declared(model_dir).unwrap_or(ChatTemplate::Plain)
    }

    /// `None` while the model directory has no `tokenizer_config.json` yet.
    pub fn declared(model_dir: &Path) -> Option<Self> {
        let bytes = fs::read(model_dir.join(TOKENIZER_CONFIG)).ok()?;
        let declared = serde_json::from_slice::<Value>(&bytes)
            .ok()
            .and_then(|config| template_text(&config));
        Some(match declared {
            Some(template) if template.contains(IM_START) => ChatTemplate::ChatMl,
            _ => ChatTemplate::Plain,
        })
    }

    pub fn render(&self, messages: &[ChatMessage]) -> String {
        let mut prompt = String::new();
        match self {
            ChatTemplate::ChatMl => {
                for message in messages {
                    prompt.push_str(&format!(
                        "{IM_START}{}\n{}{IM_END}\n",
                        message.role, message.content
                    ));
                }
                prompt.push_str(&format!("{IM_START}{ASSISTANT}\n"));
            }
            ChatTemplate::Plain => {
                for message in messages {
                    prompt.push_str(&format!("{}: {}\n", message.role, message.content));
                }
                prompt.push_str(&format!("{ASSISTANT}: "));
            }
        }
        prompt
    }
}

/// `chat_template` is either a string or a list of named templates.
fn template_text(config: &Value) -> Option<String> {
    match config.get("chat_template")? {
        Value::String(template) => Some(template.clone()),
        Value::Array(entries) => entries
            .iter()
            .filter_map(|entry| entry.get("template").and_then(Value::as_str))
            .next()
            .map(str::to_string),
        _ => None,
    }
}

/// Removes the prompt the runtime may have echoed back in front of the
/// completion. A non-verbatim echo (special tokens dropped by the decoder)
/// is recognised by the user turn followed by the `assistant` role marker;
/// any other output is taken as the reply itself.
pub fn strip_prompt_echo(output: &str, prompt: &str, user_text: &str) -> String {
    let reply = output
        .strip_prefix(prompt)
        .or_else(|| decoded_echo(output, user_text))
        .unwrap_or(output);

    let mut reply = reply.trim_start_matches(|c: char| c == ' ' || c == ':' || c == '\n');
    for marker in END_MARKERS {
        if let Some(index) = reply.find(marker) {
            reply = &reply[..index];
        }
    }
    reply.trim().to_string()
}

/// The text after `user <text> assistant`, when the output opens with the
/// user turn.
fn decoded_echo<'a>(output: &'a str, user_text: &str) -> Option<&'a str> {
    if user_text.is_empty() {
        return None;
    }
    let separator = |c: char| c.is_whitespace() || c == ':';
    let index = output.find(user_text)?;
    let header = output[..index].trim_end_matches(separator);
    let header = header.strip_suffix(USER)?;
    if !header.trim_start_matches(IM_START).trim().is_empty() {
        return None;
    }

    let rest = output[index + user_text.len()..].trim_start_matches(separator);
    let rest = rest.strip_prefix(IM_END).unwrap_or(rest).trim_start();
    let rest = rest.strip_prefix(IM_START).unwrap_or(rest);
    rest.strip_prefix(ASSISTANT)
}
