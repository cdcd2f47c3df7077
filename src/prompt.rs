//! Chat template rendering.
//!
//! Templates are the Jinja sources shipped in `tokenizer_config.json`, so
//! the prompt matches what the model saw during fine-tuning.

use std::{fs, path::Path};

use minijinja::{Environment, ErrorKind, context};
use serde_json::Value;
use tokenizers::Tokenizer;

use crate::{error::ServiceError, model::ChatMessage};

pub const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";

/// Used when the tokenizer ships no template of its own.
pub const CHATML_TEMPLATE: &str = "{% for message in messages %}<|im_start|>{{ message.role }}\n{{ message.content }}<|im_end|>\n{% endfor %}{% if add_generation_prompt %}<|im_start|>assistant\n{% endif %}";

const TEMPLATE_NAME: &str = "chat";

pub struct PromptFormatter {
    env: Environment<'static>,
    bos_token: String,
    eos_token: String,
}

impl PromptFormatter {
    pub fn new(
        template: impl Into<String>,
        bos_token: impl Into<String>,
        eos_token: impl Into<String>,
    ) -> Result<Self, ServiceError> {
        let mut env = Environment::new();
        env.add_function("raise_exception", |message: String| -> Result<String, minijinja::Error> {
            Err(minijinja::Error::new(ErrorKind::InvalidOperation, message))
        });
        env.add_template_owned(TEMPLATE_NAME, template.into())?;
        Ok(Self {
            env,
            bos_token: bos_token.into(),
            eos_token: eos_token.into(),
        })
    }

    /// Reads `tokenizer_config.json` from `dir` when present.
    pub fn from_dir(dir: &Path) -> Result<Self, ServiceError> {
        let path = dir.join(TOKENIZER_CONFIG_FILE);
        if !path.exists() {
            tracing::info!("no tokenizer config found, using the ChatML template");
            return Self::new(CHATML_TEMPLATE, "", "<|im_end|>");
        }
        let raw = fs::read_to_string(&path)?;
        let value: Value = serde_json::from_str(&raw)
            .map_err(|e| ServiceError::Template(format!("invalid {TOKENIZER_CONFIG_FILE}: {e}")))?;
        Self::from_tokenizer_config(&value)
    }

    pub fn from_tokenizer_config(value: &Value) -> Result<Self, ServiceError> {
        let bos = special_token(value.get("bos_token")).unwrap_or_default();
        let eos = special_token(value.get("eos_token")).unwrap_or_else(|| "</s>".to_string());
        match chat_template(value.get("chat_template")) {
            Some(template) => Self::new(template, bos, eos),
            None => {
                tracing::info!("tokenizer config has no chat template, using ChatML");
                Self::new(CHATML_TEMPLATE, bos, eos)
            }
        }
    }

    pub fn eos_token(&self) -> &str {
        &self.eos_token
    }

    /// Renders the conversation followed by the assistant generation prompt.
    pub fn render(&self, messages: &[ChatMessage]) -> Result<String, ServiceError> {
        let template = self.env.get_template(TEMPLATE_NAME)?;
        let rendered = template.render(context! {
            messages => messages,
            bos_token => &self.bos_token,
            eos_token => &self.eos_token,
            add_generation_prompt => true,
        })?;
        Ok(rendered)
    }

    /// Renders and tokenizes. Special tokens come from the template itself.
    pub fn encode(
        &self,
        tokenizer: &Tokenizer,
        messages: &[ChatMessage],
    ) -> Result<Vec<u32>, ServiceError> {
        let prompt = self.render(messages)?;
        let encoding = tokenizer
            .encode(prompt, false)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        let ids = encoding.get_ids().to_vec();
        if ids.is_empty() {
            return Err(ServiceError::BadRequest("prompt produced no tokens".into()));
        }
        Ok(ids)
    }
}

/// Special tokens are stored either as plain strings or as added-token objects.
fn special_token(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("content")?.as_str().map(str::to_string),
        _ => None,
    }
}

/// A single template, or a list of named templates of which `default` wins.
fn chat_template(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Array(entries) => entries
            .iter()
            .find(|entry| entry.get("name").and_then(Value::as_str) == Some("default"))
            .or_else(|| entries.first())
            .and_then(|entry| entry.get("template"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}
