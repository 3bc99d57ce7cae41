//! Google Gemini provider.
//!
//! Calls the `generateContent` REST endpoint through `curl`, classifies API
//! failures into [`GeminiApiError`], retries the transient ones, and records
//! token usage into the shared [`UsageLedger`].
//!
//! # Example
//!
//! ```rust,ignore
//! use ossdev::llm::{GeminiModel, GeminiProvider, LlmClient, UsageLedger};
//!
//! let provider = GeminiProvider::new(GeminiModel::Flash20, Arc::new(UsageLedger::new()))
//!     .with_api_key_env("GEMINI_API_KEY");
//! let response = provider.run_prompt("Hello!").await?;
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::env;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::usage::UsageLedger;
use super::LlmClient;

/// Longest back-off honoured between retries.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

// =============================================================================
// Gemini Model Variants
// =============================================================================

/// Supported Gemini models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum GeminiModel {
    /// Gemini 2.0 Flash - fast and cheap
    #[default]
    Flash20,
    /// Gemini 2.5 Flash
    Flash25,
    /// Gemini 1.5 Pro
    Pro15,
}

impl GeminiModel {
    /// Model ID used in the endpoint path.
    ///
    /// ```rust
    /// use ossdev::llm::gemini::GeminiModel;
    ///
    /// assert_eq!(GeminiModel::Pro15.model_id(), "gemini-1.5-pro");
    /// ```
    #[must_use]
    pub const fn model_id(&self) -> &'static str {
        match self {
            Self::Flash20 => "gemini-2.0-flash",
            Self::Flash25 => "gemini-2.5-flash",
            Self::Pro15 => "gemini-1.5-pro",
        }
    }

    /// Cost per million tokens (input, output) in USD.
    #[must_use]
    pub const fn cost_per_million_tokens(&self) -> (f64, f64) {
        match self {
            Self::Flash20 => (0.10, 0.40),
            Self::Flash25 => (0.30, 2.50),
            Self::Pro15 => (3.50, 10.50),
        }
    }

    /// Estimated cost of one request.
    #[must_use]
    pub fn cost(&self, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        let (input, output) = self.cost_per_million_tokens();
        (f64::from(prompt_tokens) * input + f64::from(completion_tokens) * output) / 1_000_000.0
    }

    /// Parse a model name. Accepts full IDs, `-exp` suffixes and short names.
    ///
    /// ```rust
    /// use ossdev::llm::gemini::GeminiModel;
    ///
    /// assert_eq!(GeminiModel::parse("gemini-2.0-flash-exp"), Some(GeminiModel::Flash20));
    /// assert_eq!(GeminiModel::parse("pro"), Some(GeminiModel::Pro15));
    /// assert_eq!(GeminiModel::parse("gpt-4o"), None);
    /// ```
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.trim().to_lowercase();
        let name = lower.strip_suffix("-exp").unwrap_or(&lower);
        match name {
            "gemini-2.0-flash" | "2.0-flash" | "flash" => Some(Self::Flash20),
            "gemini-2.5-flash" | "2.5-flash" => Some(Self::Flash25),
            "gemini-1.5-pro" | "1.5-pro" | "pro" => Some(Self::Pro15),
            _ => None,
        }
    }
}

/// Error for parsing [`GeminiModel`] from a string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown Gemini model: '{0}'. Valid options: gemini-2.0-flash, gemini-2.5-flash, gemini-1.5-pro")]
pub struct ParseGeminiModelError(String);

impl std::str::FromStr for GeminiModel {
    type Err = ParseGeminiModelError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| ParseGeminiModelError(s.to_string()))
    }
}

impl std::fmt::Display for GeminiModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.model_id())
    }
}

// =============================================================================
// Gemini API Errors
// =============================================================================

/// Errors specific to Gemini API interactions.
#[derive(Error, Debug)]
pub enum GeminiApiError {
    /// Quota or rate limit hit - retry with backoff.
    #[error("Rate limit exceeded: {message} (retry after {retry_after_secs}s)")]
    RateLimited {
        message: String,
        retry_after_secs: u64,
    },

    /// The API key was rejected.
    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    /// API key not found in environment.
    #[error("API key not found in environment variable '{env_var}'")]
    ApiKeyNotFound { env_var: String },

    /// Invalid request.
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// Server-side failure - may be transient.
    #[error("Server error: {message}")]
    ServerError { message: String },

    /// Network/connection error.
    #[error("Connection error: {message}")]
    ConnectionError { message: String },

    /// Timeout waiting for response.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// The prompt or the answer was blocked by safety filters.
    #[error("Response blocked: {reason}")]
    Blocked { reason: String },

    /// The response body could not be understood.
    #[error("Invalid API response: {message}")]
    InvalidResponse { message: String },
}

impl GeminiApiError {
    /// Check if this error indicates the request should be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::Timeout { .. }
                | Self::ConnectionError { .. }
        )
    }

    /// Recommended delay before retrying, if the error is retryable.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited {
                retry_after_secs, ..
            } => Some(Duration::from_secs(*retry_after_secs)),
            Self::ServerError { .. } => Some(Duration::from_secs(5)),
            Self::Timeout { .. } => Some(Duration::from_secs(10)),
            Self::ConnectionError { .. } => Some(Duration::from_secs(2)),
            _ => None,
        }
    }

    /// Classify an HTTP status code and error body.
    pub fn from_response(status_code: u16, body: &str) -> Self {
        let message = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| {
                v.pointer("/error/message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| body.trim().to_string());

        match status_code {
            429 => Self::RateLimited {
                retry_after_secs: Self::extract_retry_after(body).unwrap_or(60),
                message,
            },
            401 | 403 => Self::AuthenticationFailed { message },
            400 if message.to_lowercase().contains("api key") => {
                Self::AuthenticationFailed { message }
            }
            400 | 404 => Self::InvalidRequest { message },
            500..=599 => Self::ServerError { message },
            _ => Self::InvalidResponse {
                message: format!("HTTP {}: {}", status_code, message),
            },
        }
    }

    /// Extract retry-after seconds, e.g. `"retryDelay": "27s"`.
    fn extract_retry_after(body: &str) -> Option<u64> {
        let re = regex::Regex::new(r#"(?i)retry.?delay"?\s*:\s*"?(\d+)"#).ok()?;
        re.captures(body)?.get(1)?.as_str().parse().ok()
    }
}

// =============================================================================
// Gemini API Request/Response Types
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    prompt_feedback: Option<PromptFeedback>,
}

/// Text and token counts of a successful response.
#[derive(Debug, Clone, PartialEq)]
pub struct GeminiReply {
    /// Concatenated text parts of the first candidate.
    pub text: String,
    /// Prompt tokens reported by the API.
    pub prompt_tokens: u32,
    /// Completion tokens reported by the API.
    pub completion_tokens: u32,
}

/// Parse a `generateContent` response body.
///
/// Falls back to a 4-chars-per-token estimate when usage metadata is missing.
pub fn parse_response(prompt: &str, body: &str) -> Result<GeminiReply, GeminiApiError> {
    let response: GenerateContentResponse =
        serde_json::from_str(body).map_err(|e| GeminiApiError::InvalidResponse {
            message: format!("Failed to parse response: {}", e),
        })?;

    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(GeminiApiError::Blocked { reason });
    }

    let Some(candidate) = response.candidates.into_iter().next() else {
        return Err(GeminiApiError::InvalidResponse {
            message: "response contained no candidates".to_string(),
        });
    };

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().map(|p| p.text).collect())
        .unwrap_or_default();

    if text.is_empty() {
        if let Some(reason) = candidate.finish_reason.filter(|r| r != "STOP") {
            return Err(GeminiApiError::Blocked { reason });
        }
    }

    let (prompt_tokens, completion_tokens) = match response.usage_metadata {
        Some(usage) => (usage.prompt_token_count, usage.candidates_token_count),
        None => ((prompt.len() / 4) as u32, (text.len() / 4) as u32),
    };

    Ok(GeminiReply {
        text,
        prompt_tokens,
        completion_tokens,
    })
}

/// Split curl output written with `-w "\n%{http_code}"` into body and status.
fn split_status(output: &str) -> (&str, u16) {
    match output.rsplit_once('\n') {
        Some((body, code)) => (body, code.trim().parse().unwrap_or(0)),
        None => ("", output.trim().parse().unwrap_or(0)),
    }
}

// =============================================================================
// Gemini Provider
// =============================================================================

/// Gemini LLM provider.
#[derive(Debug)]
pub struct GeminiProvider {
    model: GeminiModel,
    api_key_env: String,
    timeout_secs: u64,
    max_retries: u32,
    api_base: String,
    ledger: Arc<UsageLedger>,
}

impl GeminiProvider {
    /// Default timeout for requests (2 minutes).
    pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

    /// Default API base URL.
    pub const DEFAULT_API_BASE: &'static str = "https://generativelanguage.googleapis.com/v1beta";

    /// Default API key environment variable.
    pub const DEFAULT_API_KEY_ENV: &'static str = "GEMINI_API_KEY";

    /// Create a provider that records usage into `ledger`.
    #[must_use]
    pub fn new(model: GeminiModel, ledger: Arc<UsageLedger>) -> Self {
        Self {
            model,
            api_key_env: Self::DEFAULT_API_KEY_ENV.to_string(),
            timeout_secs: Self::DEFAULT_TIMEOUT_SECS,
            max_retries: 2,
            api_base: Self::DEFAULT_API_BASE.to_string(),
            ledger,
        }
    }

    /// Set the environment variable name for the API key.
    #[must_use]
    pub fn with_api_key_env(mut self, env_var: &str) -> Self {
        self.api_key_env = env_var.to_string();
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Set how many times a transient failure is retried.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set a custom API base URL (for proxies).
    #[must_use]
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    /// The configured model.
    #[must_use]
    pub fn model(&self) -> GeminiModel {
        self.model
    }

    fn api_key(&self) -> Result<String, GeminiApiError> {
        env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| GeminiApiError::ApiKeyNotFound {
                env_var: self.api_key_env.clone(),
            })
    }

    async fn execute_request(&self, prompt: &str) -> Result<GeminiReply, GeminiApiError> {
        let api_key = self.api_key()?;
        let url = format!(
            "{}/models/{}:generateContent",
            self.api_base,
            self.model.model_id()
        );
        let body = GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.0,
                max_output_tokens: 8192,
            },
        };
        let body_json =
            serde_json::to_vec(&body).map_err(|e| GeminiApiError::InvalidRequest {
                message: format!("Failed to serialize request: {}", e),
            })?;

        debug!(
            "Sending request to {} ({} chars prompt)",
            self.model,
            prompt.len()
        );

        // Body goes through stdin so large prompts never hit argv limits.
        let mut child = tokio::process::Command::new("curl")
            .args([
                "-sS",
                "-X",
                "POST",
                &url,
                "-H",
                &format!("x-goog-api-key: {}", api_key),
                "-H",
                "Content-Type: application/json",
                "--data-binary",
                "@-",
                "-w",
                "\n%{http_code}",
                "--max-time",
                &self.timeout_secs.to_string(),
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GeminiApiError::ConnectionError {
                message: format!("Failed to execute curl: {}", e),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&body_json)
                .await
                .map_err(|e| GeminiApiError::ConnectionError {
                    message: format!("Failed to send request body: {}", e),
                })?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| GeminiApiError::ConnectionError {
                message: format!("curl did not finish: {}", e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // curl exit code 28: operation timed out
            if output.status.code() == Some(28) || stderr.contains("timed out") {
                return Err(GeminiApiError::Timeout {
                    timeout_secs: self.timeout_secs,
                });
            }
            return Err(GeminiApiError::ConnectionError {
                message: format!("curl failed: {}", stderr.trim()),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let (response_body, status) = split_status(&stdout);
        if status != 200 {
            return Err(GeminiApiError::from_response(status, response_body));
        }
        parse_response(prompt, response_body)
    }
}

#[async_trait]
impl LlmClient for GeminiProvider {
    async fn run_prompt(&self, prompt: &str) -> Result<String> {
        let mut retries = 0;
        loop {
            match self.execute_request(prompt).await {
                Ok(reply) => {
                    let cost = self.model.cost(reply.prompt_tokens, reply.completion_tokens);
                    self.ledger.record(
                        self.model.model_id(),
                        reply.prompt_tokens,
                        reply.completion_tokens,
                        cost,
                    );
                    debug!(
                        "{}: {} prompt / {} completion tokens (${:.5})",
                        self.model, reply.prompt_tokens, reply.completion_tokens, cost
                    );
                    return Ok(reply.text);
                }
                Err(e) if e.is_retryable() && retries < self.max_retries => {
                    retries += 1;
                    let delay = e.retry_after().unwrap_or_default().min(MAX_RETRY_DELAY);
                    warn!(
                        "Gemini request failed ({}), retry {}/{} in {}s",
                        e,
                        retries,
                        self.max_retries,
                        delay.as_secs()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn model_name(&self) -> &str {
        self.model.model_id()
    }
}
