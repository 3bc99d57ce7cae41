//! Custom error types for oss-dev.
//!
//! Errors that belong to a single collaborator live next to it
//! ([`GenerationError`](crate::agents::GenerationError),
//! [`SandboxError`](crate::sandbox::SandboxError),
//! [`GeminiApiError`](crate::llm::gemini::GeminiApiError)). This module holds
//! the crate-level error used by the pipeline and the CLI.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for oss-dev operations
#[derive(Error, Debug)]
pub enum OssDevError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    /// Required environment variables are not set
    #[error("Missing required environment variables: {}", .names.join(", "))]
    MissingCredentials { names: Vec<String> },

    /// Missing required tool
    #[error("Missing required tool: {tool}")]
    MissingTool { tool: String },

    // =========================================================================
    // Upstream Collaborator Errors
    // =========================================================================
    /// The issue reference could not be parsed
    #[error("Invalid GitHub issue URL '{url}': {reason}")]
    InvalidIssueUrl { url: String, reason: String },

    /// GitHub API call failed
    #[error("GitHub request failed: {message}")]
    GitHub { message: String },

    /// Repository clone failed
    #[error("Failed to clone {url}: {message}")]
    Clone { url: String, message: String },

    /// Stack detection failed
    #[error("Stack detection failed for {path}: {reason}")]
    Stack { path: PathBuf, reason: String },

    /// Code search failed
    #[error("Search failed: {message}")]
    Search { message: String },

    /// Issue analysis or query planning failed
    #[error("Analysis failed: {message}")]
    Analysis { message: String },

    // =========================================================================
    // Fix Loop Errors
    // =========================================================================
    /// Every attempt was spent without a passing verification
    #[error("No passing patch after {attempts} attempts")]
    AttemptsExhausted { attempts: u32 },

    /// The fix loop could not run to completion
    #[error("Fix loop aborted: {reason}")]
    Aborted { reason: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// TOML parse error wrapper
    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OssDevError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a GitHub error
    pub fn github(message: impl Into<String>) -> Self {
        Self::GitHub {
            message: message.into(),
        }
    }

    /// Create an analysis error
    pub fn analysis(message: impl Into<String>) -> Self {
        Self::Analysis {
            message: message.into(),
        }
    }

    /// Check if this error is caused by the user's setup rather than the run
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            Self::Config { .. }
                | Self::InvalidConfig { .. }
                | Self::MissingCredentials { .. }
                | Self::MissingTool { .. }
                | Self::InvalidIssueUrl { .. }
        )
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidIssueUrl { .. } => 2,
            Self::AttemptsExhausted { .. } => 3,
            Self::Aborted { .. } => 4,
            Self::MissingTool { .. } => 6,
            Self::Config { .. } | Self::InvalidConfig { .. } | Self::MissingCredentials { .. } => 7,
            _ => 1,
        }
    }
}

/// Type alias for oss-dev results
pub type Result<T> = std::result::Result<T, OssDevError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OssDevError::AttemptsExhausted { attempts: 5 };
        assert!(err.to_string().contains('5'));
    }

    #[test]
    fn test_missing_credentials_lists_every_name() {
        let err = OssDevError::MissingCredentials {
            names: vec!["GEMINI_API_KEY".into(), "GITHUB_TOKEN".into()],
        };
        assert_eq!(
            err.to_string(),
            "Missing required environment variables: GEMINI_API_KEY, GITHUB_TOKEN"
        );
    }

    #[test]
    fn test_is_setup_error() {
        assert!(OssDevError::config("bad").is_setup_error());
        assert!(OssDevError::MissingTool { tool: "rg".into() }.is_setup_error());
        assert!(!OssDevError::github("500").is_setup_error());
        assert!(!OssDevError::AttemptsExhausted { attempts: 2 }.is_setup_error());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(OssDevError::AttemptsExhausted { attempts: 1 }.exit_code(), 3);
        assert_eq!(
            OssDevError::Aborted {
                reason: "generation".into()
            }
            .exit_code(),
            4
        );
        assert_eq!(OssDevError::config("test").exit_code(), 7);
        assert_eq!(OssDevError::github("test").exit_code(), 1);
    }

    #[test]
    fn test_config_with_path() {
        let path = PathBuf::from("/test/.oss-dev.toml");
        let err = OssDevError::config_with_path("failed to parse", path.clone());
        if let OssDevError::Config {
            message,
            path: opt_path,
        } = err
        {
            assert_eq!(message, "failed to parse");
            assert_eq!(opt_path, Some(path));
        } else {
            panic!("Wrong error variant");
        }
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: OssDevError = io_err.into();
        assert!(matches!(err, OssDevError::Io(_)));
        assert!(err.to_string().contains("access denied"));
    }
}
