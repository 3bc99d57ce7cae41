//! LLM client abstraction.
//!
//! Every agent talks to a model through the object-safe [`LlmClient`] trait,
//! so the backend is chosen at runtime from [`LlmConfig`]:
//!
//! - [`GeminiProvider`] - Google Gemini over HTTPS (default)
//! - [`ClaudeCliClient`] - the `claude` CLI in print mode
//! - [`MockLlmClient`] - scripted responses for tests
//!
//! All clients share one [`UsageLedger`] per run.
//!
//! # Example
//!
//! ```rust,ignore
//! use ossdev::llm::{create_llm_client, LlmConfig, UsageLedger};
//!
//! let ledger = Arc::new(UsageLedger::new());
//! let client = create_llm_client(&LlmConfig::default(), ledger.clone())?;
//! let response = client.run_prompt("Hello, world!").await?;
//! println!("spent ${:.4}", ledger.total_cost());
//! ```

pub mod gemini;
pub mod usage;

pub use gemini::{GeminiApiError, GeminiModel, GeminiProvider};
pub use usage::{ModelUsage, UsageLedger, UsageSummary};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

/// Abstraction for LLM client operations.
///
/// Object-safe and `Send + Sync`, so clients can be shared as
/// `Arc<dyn LlmClient>` between agents.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run a prompt and return the model's response text.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unreachable, rejects the request,
    /// or returns something that is not a usable answer.
    async fn run_prompt(&self, prompt: &str) -> Result<String>;

    /// Model identifier, e.g. `gemini-2.0-flash`.
    fn model_name(&self) -> &str;
}

/// Strip a surrounding Markdown code fence from a model response.
pub(crate) fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Run a prompt that asks for JSON and deserialize the answer.
///
/// Tolerates a Markdown fence and prose around the outermost JSON value.
///
/// # Errors
///
/// Returns an error if the client fails or no JSON value of type `T` can be
/// recovered from the response.
pub async fn run_json_prompt<T: DeserializeOwned>(
    client: &dyn LlmClient,
    prompt: &str,
) -> Result<T> {
    let response = client.run_prompt(prompt).await?;
    parse_json_response(&response)
}

fn parse_json_response<T: DeserializeOwned>(response: &str) -> Result<T> {
    let body = strip_code_fence(response);
    if let Ok(value) = serde_json::from_str(body) {
        return Ok(value);
    }

    let start = body.find(['{', '[']);
    let end = body.rfind(['}', ']']);
    match (start, end) {
        (Some(start), Some(end)) if start < end => serde_json::from_str(&body[start..=end])
            .with_context(|| format!("Model returned invalid JSON: {}", preview(body))),
        _ => anyhow::bail!("Model response contained no JSON: {}", preview(body)),
    }
}

fn preview(text: &str) -> String {
    text.chars().take(120).collect()
}

// =============================================================================
// Claude CLI Client
// =============================================================================

/// Runs prompts through the `claude` CLI in print mode.
///
/// The CLI reports no token counts, so requests are recorded in the ledger
/// with estimated tokens and no cost.
#[derive(Debug, Clone)]
pub struct ClaudeCliClient {
    model: String,
    timeout: Duration,
    ledger: Arc<UsageLedger>,
}

impl ClaudeCliClient {
    /// Create a client for a model variant (`opus`, `sonnet`, `haiku`).
    #[must_use]
    pub fn new(model: &str, ledger: Arc<UsageLedger>) -> Self {
        Self {
            model: model.to_string(),
            timeout: Duration::from_secs(LlmConfig::DEFAULT_TIMEOUT_SECS),
            ledger,
        }
    }

    /// Set the per-prompt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl LlmClient for ClaudeCliClient {
    async fn run_prompt(&self, prompt: &str) -> Result<String> {
        debug!(
            "Running claude with model {} ({} chars prompt)",
            self.model,
            prompt.len()
        );

        let mut child = AsyncCommand::new("claude")
            .args(["-p", "--model", &self.model, "--output-format", "text"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to start the claude CLI")?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.flush().await?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow::anyhow!("claude timed out after {}s", self.timeout.as_secs()))??;

        if !output.status.success() {
            anyhow::bail!(
                "claude exited with code {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let text = String::from_utf8_lossy(&output.stdout).to_string();
        self.ledger.record(
            self.model_name(),
            (prompt.len() / 4) as u32,
            (text.len() / 4) as u32,
            0.0,
        );
        Ok(text)
    }

    fn model_name(&self) -> &str {
        match self.model.as_str() {
            "opus" => "claude-opus-4",
            "sonnet" => "claude-sonnet-4",
            "haiku" => "claude-haiku-3.5",
            other => other,
        }
    }
}

// =============================================================================
// Mock Client
// =============================================================================

/// Mock LLM client for testing.
///
/// Returns queued responses in order, then the fallback response. Every
/// prompt is recorded.
///
/// # Example
///
/// ```rust,ignore
/// use ossdev::llm::MockLlmClient;
///
/// let client = MockLlmClient::new()
///     .with_responses(&["first", "second"])
///     .with_response("after that");
/// ```
#[derive(Debug)]
pub struct MockLlmClient {
    queued: Mutex<VecDeque<String>>,
    response: String,
    error: Option<String>,
    model: String,
    call_count: AtomicU32,
    fail_count: AtomicU32,
    fail_error: Option<String>,
    prompts: Mutex<Vec<String>>,
    usage: Option<(Arc<UsageLedger>, f64)>,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self {
            queued: Mutex::new(VecDeque::new()),
            response: String::new(),
            error: None,
            model: "mock-llm".to_string(),
            call_count: AtomicU32::new(0),
            fail_count: AtomicU32::new(0),
            fail_error: None,
            prompts: Mutex::new(Vec::new()),
            usage: None,
        }
    }
}

impl MockLlmClient {
    /// Create a new mock client with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fallback response.
    #[must_use]
    pub fn with_response(mut self, response: &str) -> Self {
        self.response = response.to_string();
        self
    }

    /// Queue responses returned before the fallback, in order.
    #[must_use]
    pub fn with_responses(self, responses: &[&str]) -> Self {
        if let Ok(mut queued) = self.queued.lock() {
            queued.extend(responses.iter().map(|r| r.to_string()));
        }
        self
    }

    /// Configure the mock to always return an error.
    #[must_use]
    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Configure the mock to fail the first N calls, then succeed.
    #[must_use]
    pub fn with_fail_count(mut self, count: u32, error: &str) -> Self {
        self.fail_count = AtomicU32::new(count);
        self.fail_error = Some(error.to_string());
        self
    }

    /// Record `cost_usd` into `ledger` on every successful call.
    #[must_use]
    pub fn with_cost(mut self, ledger: Arc<UsageLedger>, cost_usd: f64) -> Self {
        self.usage = Some((ledger, cost_usd));
        self
    }

    /// Get the number of times `run_prompt` was called.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Every prompt received, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn run_prompt(&self, prompt: &str) -> Result<String> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }

        let current_fail_count = self.fail_count.load(Ordering::SeqCst);
        if current_fail_count > 0 {
            self.fail_count.fetch_sub(1, Ordering::SeqCst);
            match &self.fail_error {
                Some(fail_error) => anyhow::bail!("{}", fail_error),
                None => anyhow::bail!("Mock failure"),
            }
        }

        if let Some(ref error) = self.error {
            anyhow::bail!("{}", error)
        }

        if let Some((ledger, cost)) = &self.usage {
            ledger.record(&self.model, (prompt.len() / 4) as u32, 10, *cost);
        }

        let queued = self.queued.lock().ok().and_then(|mut q| q.pop_front());
        Ok(queued.unwrap_or_else(|| self.response.clone()))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// =============================================================================
// LLM Configuration
// =============================================================================

/// The `[llm]` section of the settings file.
///
/// ```toml
/// [llm]
/// provider = "gemini"
/// model = "gemini-2.0-flash"
/// api_key_env = "GEMINI_API_KEY"
/// timeout_secs = 120
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Backend: `gemini` or `claude`.
    pub provider: String,

    /// Model name; the provider's default when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Environment variable holding the API key.
    pub api_key_env: String,

    /// Per-request timeout in seconds.
    pub timeout_secs: u64,

    /// Retries for transient API failures.
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "gemini".to_string(),
            model: None,
            api_key_env: GeminiProvider::DEFAULT_API_KEY_ENV.to_string(),
            timeout_secs: Self::DEFAULT_TIMEOUT_SECS,
            max_retries: 2,
        }
    }
}

impl LlmConfig {
    /// Default request timeout.
    pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

    const PROVIDERS: [&'static str; 2] = ["gemini", "claude"];
    const CLAUDE_VARIANTS: [&'static str; 3] = ["opus", "sonnet", "haiku"];

    /// Validate the LLM configuration.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !Self::PROVIDERS.contains(&self.provider.as_str()) {
            return Err(format!(
                "Invalid provider '{}'. Valid options: {}",
                self.provider,
                Self::PROVIDERS.join(", ")
            ));
        }
        if self.timeout_secs == 0 {
            return Err("timeout_secs must be greater than 0".to_string());
        }

        match (self.provider.as_str(), self.model.as_deref()) {
            ("gemini", Some(model)) => {
                model.parse::<GeminiModel>().map_err(|e| e.to_string())?;
            }
            ("claude", Some(variant)) if !Self::CLAUDE_VARIANTS.contains(&variant) => {
                return Err(format!(
                    "Invalid Claude variant '{}'. Valid options: {}",
                    variant,
                    Self::CLAUDE_VARIANTS.join(", ")
                ));
            }
            _ => {}
        }
        Ok(())
    }

    /// Environment variable that must be set for this provider, if any.
    #[must_use]
    pub fn required_env(&self) -> Option<&str> {
        (self.provider == "gemini").then_some(self.api_key_env.as_str())
    }
}

/// Create an LLM client from configuration.
///
/// # Errors
///
/// Returns an error if the configuration is invalid.
pub fn create_llm_client(config: &LlmConfig, ledger: Arc<UsageLedger>) -> Result<Arc<dyn LlmClient>> {
    config.validate().map_err(|e| anyhow::anyhow!("{}", e))?;

    match config.provider.as_str() {
        "gemini" => {
            let model = config
                .model
                .as_deref()
                .and_then(GeminiModel::parse)
                .unwrap_or_default();
            Ok(Arc::new(
                GeminiProvider::new(model, ledger)
                    .with_api_key_env(&config.api_key_env)
                    .with_timeout(config.timeout_secs)
                    .with_max_retries(config.max_retries),
            ))
        }
        "claude" => {
            let variant = config.model.as_deref().unwrap_or("sonnet");
            Ok(Arc::new(
                ClaudeCliClient::new(variant, ledger)
                    .with_timeout(Duration::from_secs(config.timeout_secs)),
            ))
        }
        other => anyhow::bail!("Unknown provider '{}'", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n[1, 2]\n```"), "[1, 2]");
        assert_eq!(strip_code_fence("  {\"a\": 1}  "), "{\"a\": 1}");
        assert_eq!(strip_code_fence("```\nplain\n```"), "plain");
    }

    #[test]
    fn test_parse_json_response_with_prose() {
        let value: serde_json::Value =
            parse_json_response("Here you go:\n{\"a\": [1, 2]}\nHope that helps").unwrap();
        assert_eq!(value["a"][1], 2);

        let list: Vec<u32> = parse_json_response("```json\n[3, 4]\n```").unwrap();
        assert_eq!(list, vec![3, 4]);

        assert!(parse_json_response::<serde_json::Value>("no json here").is_err());
    }

    #[test]
    fn test_llm_config_defaults() {
        let config = LlmConfig::default();
        assert_eq!(config.provider, "gemini");
        assert_eq!(config.api_key_env, "GEMINI_API_KEY");
        assert_eq!(config.required_env(), Some("GEMINI_API_KEY"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_llm_config_deserialize_partial() {
        let config: LlmConfig = toml::from_str("provider = \"claude\"\nmodel = \"opus\"").unwrap();
        assert_eq!(config.provider, "claude");
        assert_eq!(config.timeout_secs, 120);
        assert!(config.required_env().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_llm_config_validate_rejects() {
        let bad_provider = LlmConfig {
            provider: "openai".to_string(),
            ..LlmConfig::default()
        };
        assert!(bad_provider.validate().unwrap_err().contains("openai"));

        let bad_model = LlmConfig {
            model: Some("gemini-0.1-nano".to_string()),
            ..LlmConfig::default()
        };
        assert!(bad_model.validate().is_err());

        let bad_variant = LlmConfig {
            provider: "claude".to_string(),
            model: Some("gigantic".to_string()),
            ..LlmConfig::default()
        };
        assert!(bad_variant.validate().unwrap_err().contains("gigantic"));

        let zero_timeout = LlmConfig {
            timeout_secs: 0,
            ..LlmConfig::default()
        };
        assert!(zero_timeout.validate().is_err());
    }

    #[test]
    fn test_create_llm_client_selects_backend() {
        let ledger = Arc::new(UsageLedger::new());
        let gemini = create_llm_client(&LlmConfig::default(), ledger.clone()).unwrap();
        assert_eq!(gemini.model_name(), "gemini-2.0-flash");

        let claude = create_llm_client(
            &LlmConfig {
                provider: "claude".to_string(),
                ..LlmConfig::default()
            },
            ledger,
        )
        .unwrap();
        assert_eq!(claude.model_name(), "claude-sonnet-4");
    }

    #[tokio::test]
    async fn test_mock_llm_client_queue_then_fallback() {
        let client = MockLlmClient::new()
            .with_responses(&["one", "two"])
            .with_response("rest");
        assert_eq!(client.run_prompt("a").await.unwrap(), "one");
        assert_eq!(client.run_prompt("b").await.unwrap(), "two");
        assert_eq!(client.run_prompt("c").await.unwrap(), "rest");
        assert_eq!(client.call_count(), 3);
        assert_eq!(client.prompts(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_mock_llm_client_fail_count() {
        let client = MockLlmClient::new()
            .with_response("ok")
            .with_fail_count(2, "overloaded");
        assert!(client.run_prompt("x").await.is_err());
        assert!(client.run_prompt("x").await.is_err());
        assert_eq!(client.run_prompt("x").await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_mock_llm_client_records_cost() {
        let ledger = Arc::new(UsageLedger::new());
        let client = MockLlmClient::new().with_cost(ledger.clone(), 0.25);
        client.run_prompt("x").await.unwrap();
        client.run_prompt("y").await.unwrap();
        assert!((ledger.total_cost() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_run_json_prompt() {
        #[derive(Deserialize)]
        struct Answer {
            value: u32,
        }
        let client = MockLlmClient::new().with_response("```json\n{\"value\": 7}\n```");
        let answer: Answer = run_json_prompt(&client, "give me json").await.unwrap();
        assert_eq!(answer.value, 7);
    }

    #[test]
    fn test_llm_client_is_object_safe() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<dyn LlmClient>();
        let clients: Vec<Arc<dyn LlmClient>> = vec![
            Arc::new(MockLlmClient::new()),
            Arc::new(ClaudeCliClient::new("opus", Arc::new(UsageLedger::new()))),
        ];
        assert_eq!(clients[1].model_name(), "claude-opus-4");
    }
}
