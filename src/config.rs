//! Configuration management for oss-dev.
//!
//! Settings are resolved in layers, later layers winning:
//!
//! 1. built-in defaults
//! 2. user file `<config_dir>/oss-dev/config.toml`
//! 3. project file `./.oss-dev.toml`
//! 4. `OSS_DEV_*` environment variables
//! 5. command-line flags (applied by the binary)
//!
//! Files are merged table by table, so a project file that only sets
//! `[sandbox] backend = "local"` keeps every other sandbox default.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{OssDevError, Result};
use crate::llm::LlmConfig;
use crate::sandbox::{SandboxBackend, SandboxConfig};
use crate::search::SearchConfig;

/// Project-level settings file name.
pub const PROJECT_CONFIG_FILE: &str = ".oss-dev.toml";

/// Environment variable overriding the cost budget.
pub const ENV_MAX_COST: &str = "OSS_DEV_MAX_COST";
/// Environment variable overriding the log filter.
pub const ENV_LOG_LEVEL: &str = "OSS_DEV_LOG_LEVEL";
/// Environment variable overriding the attempt budget.
pub const ENV_MAX_ATTEMPTS: &str = "OSS_DEV_MAX_ATTEMPTS";
/// Environment variable overriding the sandbox backend.
pub const ENV_SANDBOX: &str = "OSS_DEV_SANDBOX";
/// Environment variable overriding the model name.
pub const ENV_MODEL: &str = "OSS_DEV_MODEL";

// ============================================================================
// Config Locations
// ============================================================================

/// Where settings files are looked up.
#[derive(Debug, Clone, Default)]
pub struct ConfigLocations {
    user: Option<PathBuf>,
    project: Option<PathBuf>,
}

impl ConfigLocations {
    /// Default locations for a project directory.
    #[must_use]
    pub fn new(project_dir: &Path) -> Self {
        Self {
            user: Self::default_user_path(),
            project: Some(project_dir.join(PROJECT_CONFIG_FILE)),
        }
    }

    /// `{config_dir}/oss-dev/config.toml`, if the platform has a config dir.
    #[must_use]
    pub fn default_user_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("oss-dev").join("config.toml"))
    }

    /// Set a custom user config path.
    #[must_use]
    pub fn with_user_path(mut self, path: Option<PathBuf>) -> Self {
        self.user = path;
        self
    }

    /// Set a custom project config path.
    #[must_use]
    pub fn with_project_path(mut self, path: Option<PathBuf>) -> Self {
        self.project = path;
        self
    }

    /// The user-level settings file.
    #[must_use]
    pub fn user(&self) -> Option<&Path> {
        self.user.as_deref()
    }

    /// The project-level settings file.
    #[must_use]
    pub fn project(&self) -> Option<&Path> {
        self.project.as_deref()
    }

    /// Existing files, lowest precedence first.
    fn existing(&self) -> Vec<&PathBuf> {
        [self.user.as_ref(), self.project.as_ref()]
            .into_iter()
            .flatten()
            .filter(|p| p.is_file())
            .collect()
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Effective settings for one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Maximum fix attempts per run.
    pub max_attempts: u32,

    /// Spending limit across all model calls, in USD. Zero disables it.
    pub max_cost_usd: f64,

    /// Environment variable holding the GitHub token.
    pub github_token_env: String,

    /// Log filter directive, e.g. `debug` or `ossdev=trace`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Model backend.
    pub llm: LlmConfig,

    /// Execution environment.
    pub sandbox: SandboxConfig,

    /// Code search.
    pub search: SearchConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_cost_usd: 2.0,
            github_token_env: "GITHUB_TOKEN".to_string(),
            log_level: None,
            llm: LlmConfig::default(),
            sandbox: SandboxConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings for `project_dir` from the default locations and the
    /// process environment.
    ///
    /// # Errors
    ///
    /// Returns [`OssDevError::Config`] for unreadable or malformed files and
    /// [`OssDevError::InvalidConfig`] for unparsable environment values.
    pub fn load(project_dir: &Path) -> Result<Self> {
        Self::load_from(&ConfigLocations::new(project_dir), |key| {
            std::env::var(key).ok()
        })
    }

    /// Load settings from explicit locations and an environment lookup.
    ///
    /// # Errors
    ///
    /// See [`Settings::load`].
    pub fn load_from<F>(locations: &ConfigLocations, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut merged = toml::Table::new();
        for path in locations.existing() {
            debug!("Loading settings from {}", path.display());
            let content = std::fs::read_to_string(path).map_err(|e| {
                OssDevError::config_with_path(format!("cannot read: {}", e), path.clone())
            })?;
            let table: toml::Table = toml::from_str(&content).map_err(|e| {
                OssDevError::config_with_path(format!("invalid TOML: {}", e), path.clone())
            })?;
            merge_tables(&mut merged, table);
        }

        let text = toml::to_string(&merged)
            .map_err(|e| OssDevError::config(format!("cannot merge settings: {}", e)))?;
        let mut settings: Settings = toml::from_str(&text)
            .map_err(|e| OssDevError::config(format!("invalid settings: {}", e)))?;

        settings.apply_env(env)?;
        Ok(settings)
    }

    /// Apply `OSS_DEV_*` overrides.
    ///
    /// # Errors
    ///
    /// Returns [`OssDevError::InvalidConfig`] when a value cannot be parsed.
    pub fn apply_env<F>(&mut self, env: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        if let Some(value) = get(ENV_MAX_COST) {
            self.max_cost_usd = value
                .trim()
                .parse()
                .map_err(|_| OssDevError::invalid_config(ENV_MAX_COST, format!("'{}' is not a number", value)))?;
        }
        if let Some(value) = get(ENV_MAX_ATTEMPTS) {
            self.max_attempts = value.trim().parse().map_err(|_| {
                OssDevError::invalid_config(ENV_MAX_ATTEMPTS, format!("'{}' is not a whole number", value))
            })?;
        }
        if let Some(value) = get(ENV_SANDBOX) {
            self.sandbox.backend = value
                .parse::<SandboxBackend>()
                .map_err(|e| OssDevError::invalid_config(ENV_SANDBOX, e))?;
        }
        if let Some(value) = get(ENV_LOG_LEVEL) {
            self.log_level = Some(value.trim().to_string());
        }
        if let Some(value) = get(ENV_MODEL) {
            self.llm.model = Some(value.trim().to_string());
        }
        Ok(())
    }

    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns [`OssDevError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(OssDevError::invalid_config("max_attempts", "must be at least 1"));
        }
        if !self.max_cost_usd.is_finite() || self.max_cost_usd < 0.0 {
            return Err(OssDevError::invalid_config(
                "max_cost_usd",
                "must be a non-negative number",
            ));
        }
        self.llm
            .validate()
            .map_err(|e| OssDevError::invalid_config("llm", e))?;
        self.sandbox
            .validate()
            .map_err(|e| OssDevError::invalid_config("sandbox", e))?;
        self.search
            .validate()
            .map_err(|e| OssDevError::invalid_config("search", e))?;
        Ok(())
    }

    /// Check that every required secret is present.
    ///
    /// # Errors
    ///
    /// Returns [`OssDevError::MissingCredentials`] listing all missing
    /// variables at once.
    pub fn require_credentials<F>(&self, env: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let missing: Vec<String> = self
            .llm
            .required_env()
            .into_iter()
            .filter(|name| env(name).map_or(true, |v| v.trim().is_empty()))
            .map(str::to_string)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(OssDevError::MissingCredentials { names: missing })
        }
    }

    /// The GitHub token, if set.
    #[must_use]
    pub fn github_token(&self) -> Option<String> {
        std::env::var(&self.github_token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
    }

    /// Render as TOML for `oss-dev config show`.
    ///
    /// # Errors
    ///
    /// Returns [`OssDevError::Config`] if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| OssDevError::config(format!("cannot render settings: {}", e)))
    }
}

/// Deep-merge `overlay` into `base`; nested tables merge, other values
/// replace.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
