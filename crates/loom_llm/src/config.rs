//! Client configuration.

use serde::{Deserialize, Serialize};

use crate::error::{LlmError, LlmResult};

pub const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LlmConfig {
    /// OpenAI-compatible chat completions endpoint
    pub api_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: OPENROUTER_API_URL.to_string(),
            api_key: None,
            temperature: 0.7,
            max_tokens: 16_000,
            request_timeout_secs: 300,
        }
    }
}

impl LlmConfig {
    /// Fill missing values from the environment.
    ///
    /// Checks in order:
    /// 1. OPENROUTER_API_KEY
    /// 2. OPENAI_API_KEY (switches the default URL to OpenAI)
    ///
    /// `LOOM_API_URL` overrides the endpoint either way.
    pub fn with_env(mut self) -> Self {
        let non_empty = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        if self.api_key.is_none() {
            if let Some(key) = non_empty("OPENROUTER_API_KEY") {
                self.api_key = Some(key);
            } else if let Some(key) = non_empty("OPENAI_API_KEY") {
                self.api_key = Some(key);
                if self.api_url == OPENROUTER_API_URL {
                    self.api_url = OPENAI_API_URL.to_string();
                }
            }
        }
        if let Some(url) = non_empty("LOOM_API_URL") {
            self.api_url = url;
        }
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    pub fn api_key(&self) -> LlmResult<&str> {
        self.api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or(LlmError::NotConfigured)
    }
}
