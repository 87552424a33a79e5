//! OpenAI-compatible chat completions client.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use loom_core::files::{list_project_files, read_previews};
use loom_core::{
    parse_file_blocks, CodeGenerationService, PhaseArtifact, PhaseRequest, UpstreamError,
};
use loom_runner::{FailureContext, FailureFixer, FilePatch, RunnerResult};
use regex::Regex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::LlmConfig;
use crate::error::{LlmError, LlmResult};
use crate::parse::parse_artifact;
use crate::prompts;

/// Characters of each file shown to the fixer.
const FIX_PREVIEW_CHARS: usize = 4000;
/// Error bodies are cut to this length in messages.
const MAX_ERROR_BODY: usize = 500;

/// One reply from the provider.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    /// The provider stopped because of the token limit
    pub truncated: bool,
}

pub struct LlmClient {
    config: LlmConfig,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> LlmResult<Self> {
        config.api_key()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }

    /// Create a client from environment variables.
    pub fn from_env() -> LlmResult<Self> {
        Self::new(LlmConfig::default().with_env())
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    /// Single chat completion. Retrying is left to the caller.
    pub async fn complete(&self, model: &str, system: &str, user: &str) -> LlmResult<Completion> {
        let request = ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        debug!("Calling {} with model {}", self.config.api_url, model);
        let response = self
            .client
            .post(&self.config.api_url)
            .header("Authorization", format!("Bearer {}", self.config.api_key()?))
            .header("Content-Type", "application/json")
            .header("X-Title", "AppLoom")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &body));
        }

        let body = response.text().await?;
        let result: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| LlmError::InvalidResponse(format!("Failed to parse response: {}", e)))?;

        if let Some(error) = result.error {
            let code = error.code.as_ref().and_then(|c| c.as_u64()).unwrap_or(0);
            let status = StatusCode::from_u16(code as u16).unwrap_or(StatusCode::BAD_GATEWAY);
            return Err(classify_status(status, None, &error.message));
        }

        let choice = result
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("No choices in response".to_string()))?;
        let content = choice
            .message
            .content
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| LlmError::InvalidResponse("Empty message content".to_string()))?;

        Ok(Completion {
            content,
            truncated: choice.finish_reason.as_deref() == Some("length"),
        })
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(MAX_ERROR_BODY).collect()
}

fn retry_delay_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r#"\\?"retryDelay\\?"\s*:\s*\\?"(\d+)s"#).ok())
        .as_ref()
}

/// Provider hint buried in an error body, plus one second of slack.
fn retry_delay_from_body(body: &str) -> Option<Duration> {
    let captures = retry_delay_pattern()?.captures(body)?;
    let secs: u64 = captures.get(1)?.as_str().parse().ok()?;
    Some(Duration::from_secs(secs + 1))
}

fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> LlmError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited {
            message: truncate(body),
            retry_after: retry_after.or_else(|| retry_delay_from_body(body)),
        },
        StatusCode::NOT_FOUND | StatusCode::SERVICE_UNAVAILABLE => {
            LlmError::ModelUnavailable(format!("{}: {}", status, truncate(body)))
        }
        _ => LlmError::Api {
            status: status.as_u16(),
            body: truncate(body),
        },
    }
}

#[async_trait]
impl CodeGenerationService for LlmClient {
    fn name(&self) -> &str {
        "llm"
    }

    async fn generate(&self, request: &PhaseRequest) -> Result<PhaseArtifact, UpstreamError> {
        let system = prompts::system_prompt(request.phase, request.mode);
        let user = prompts::user_message(request);
        let completion = self.complete(&request.model, &system, &user).await?;

        let mut artifact = parse_artifact(request.phase, &completion.content)?;
        if completion.truncated && request.phase.produces_files() {
            warn!(
                "{} reply for session {} hit the token limit",
                request.phase.label(),
                request.session_id
            );
            artifact = artifact.incomplete();
        }
        Ok(artifact)
    }
}

#[async_trait]
impl FailureFixer for LlmClient {
    async fn propose_fix(&self, failure: &FailureContext) -> RunnerResult<Vec<FilePatch>> {
        let files = list_project_files(&failure.project_dir).unwrap_or_default();
        let mentioned: Vec<String> = files
            .iter()
            .filter(|path| {
                let name = path.rsplit('/').next().unwrap_or(path.as_str());
                failure.recent_logs.iter().any(|line| line.contains(name))
            })
            .cloned()
            .collect();

        let mut user = prompts::fix_user_message(failure, &files);
        for preview in read_previews(&failure.project_dir, &mentioned, FIX_PREVIEW_CHARS) {
            user.push_str(&format!(
                "\n## Current content of {}\n{}\n",
                preview.path, preview.content
            ));
        }

        let completion = self
            .complete(&failure.model, &prompts::fix_system_prompt(), &user)
            .await?;
        let patches: Vec<FilePatch> = parse_file_blocks(&completion.content)
            .into_iter()
            .map(|f| FilePatch::new(f.path, f.content))
            .collect();
        info!(
            "Fixer proposed {} patch(es) for `{}`",
            patches.len(),
            failure.command
        );
        Ok(patches)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    error: Option<ProviderError>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProviderError {
    #[serde(default)]
    message: String,
    code: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_requires_key() {
        let err = LlmClient::new(LlmConfig::default()).err().unwrap();
        assert!(matches!(err, LlmError::NotConfigured));
    }

    #[test]
    fn test_classify_rate_limit_with_body_hint() {
        let body = r#"{"error":{"code":429,"metadata":{"raw":"{\"retryDelay\": \"12s\"}"}}}"#;
        match classify_status(StatusCode::TOO_MANY_REQUESTS, None, body) {
            LlmError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(13)))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_header_beats_body_hint() {
        let err = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(2)),
            r#""retryDelay": "40s""#,
        );
        assert!(matches!(
            err,
            LlmError::RateLimited {
                retry_after: Some(d),
                ..
            } if d == Duration::from_secs(2)
        ));
    }

    #[test]
    fn test_classify_missing_model() {
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, None, "no endpoints"),
            LlmError::ModelUnavailable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None, "upstream"),
            LlmError::Api { status: 502, .. }
        ));
    }
}
