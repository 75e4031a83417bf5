use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ChatResult};

/// Configuration for a chat session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_model")]
    pub model: String,
    /// Size of the whole context window, in tokens
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Tokens kept free for the reply
    #[serde(default = "default_minimum_reply_tokens")]
    pub minimum_reply_tokens: usize,
    /// Cap on history messages, the new message included
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_number_of_messages: Option<usize>,
    #[serde(default = "default_retrieved_content_share")]
    pub retrieved_content_share: f64,
    #[serde(default = "default_true")]
    pub run_functions_automatically: bool,
    #[serde(default = "default_max_function_rounds")]
    pub max_function_rounds: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// JSON object text laid over the generated request parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_parameters: Option<String>,
}

fn default_model() -> String {
    "gpt-4o".into()
}

fn default_max_tokens() -> usize {
    16_384
}

fn default_minimum_reply_tokens() -> usize {
    1_024
}

fn default_retrieved_content_share() -> f64 {
    0.5
}

fn default_true() -> bool {
    true
}

fn default_max_function_rounds() -> usize {
    8
}

fn default_temperature() -> f64 {
    0.7
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: default_max_tokens(),
            minimum_reply_tokens: default_minimum_reply_tokens(),
            max_number_of_messages: None,
            retrieved_content_share: default_retrieved_content_share(),
            run_functions_automatically: true,
            max_function_rounds: default_max_function_rounds(),
            temperature: default_temperature(),
            extra_parameters: None,
        }
    }
}

impl ChatConfig {
    pub fn from_toml_str(s: &str) -> ChatResult<Self> {
        let config: ChatConfig = toml::from_str(s).map_err(|e| ChatError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: impl AsRef<Path>) -> ChatResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> ChatResult<()> {
        if self.minimum_reply_tokens >= self.max_tokens {
            return Err(ChatError::Config(format!(
                "minimum_reply_tokens ({}) must be below max_tokens ({})",
                self.minimum_reply_tokens, self.max_tokens
            )));
        }
        if !(0.0..=1.0).contains(&self.retrieved_content_share) {
            return Err(ChatError::Config(format!(
                "retrieved_content_share must be within 0..=1, got {}",
                self.retrieved_content_share
            )));
        }
        Ok(())
    }

    /// Token ceiling for the retrieved-content message
    pub fn retrieved_content_limit(&self) -> usize {
        (self.max_tokens as f64 * self.retrieved_content_share) as usize
    }

    /// Request parameters handed to the model client
    pub fn request_parameters(&self) -> serde_json::Value {
        let generated = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "max_tokens": self.minimum_reply_tokens,
        });
        match &self.extra_parameters {
            Some(extra) => {
                let merged = crate::payload::merge_json(&generated.to_string(), extra);
                serde_json::from_str(&merged).unwrap_or(generated)
            }
            None => generated,
        }
    }
}
