//! Isolated, disposable execution environments.
//!
//! The fix loop never touches the host checkout: every candidate patch is
//! written into an [`ExecutionEnvironment`] and verified there.
//!
//! # Lifecycle
//!
//! ```text
//! provision(source, runtime) ──> write_file / run ... ──> dispose()
//!        │                                                   ▲
//!        └──────────────── on error ─────────────────────────┘
//! ```
//!
//! `dispose` is idempotent and safe to call when provisioning failed, so the
//! owner can release the environment on every exit path. `dispose_now` is
//! the blocking counterpart used when the owning future is dropped; both
//! backends also call it from `Drop`.
//!
//! # Backends
//!
//! - [`DockerSandbox`] - a long-lived container started from the runtime image
//! - [`LocalSandbox`] - a throwaway directory on the host

pub mod docker;
pub mod local;
pub(crate) mod process;

pub use docker::DockerSandbox;
pub use local::LocalSandbox;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::fix::VerificationOutcome;
use crate::stack::RuntimeDescriptor;

/// Errors that make an environment unusable for the rest of a run.
///
/// Failing verification commands are not errors; they are reported through
/// [`VerificationOutcome`].
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Environment setup failed.
    #[error("Provisioning failed: {message}")]
    Provision { message: String },

    /// Writing a file into the environment failed.
    #[error("Failed to write {path}: {message}")]
    Write { path: String, message: String },

    /// An operation was attempted before `provision` succeeded.
    #[error("Environment is not provisioned")]
    NotProvisioned,
}

impl SandboxError {
    /// Create a provisioning error
    pub fn provision(message: impl Into<String>) -> Self {
        Self::Provision {
            message: message.into(),
        }
    }

    /// Create a write error
    pub fn write(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Write {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Where the environment gets the project source from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceLocation {
    /// A git remote to clone.
    Remote(String),
    /// A checkout already on the host, copied in.
    Local(PathBuf),
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote(url) => write!(f, "{}", url),
            Self::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// An isolated workspace that accepts file writes and runs shell commands.
///
/// One instance is owned by exactly one fix run at a time; methods take
/// `&mut self` so the borrow checker enforces that.
#[async_trait]
pub trait ExecutionEnvironment: Send {
    /// Prepare the workspace: fetch the source and install dependencies.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Provision`] if any setup step fails.
    async fn provision(
        &mut self,
        source: &SourceLocation,
        runtime: &RuntimeDescriptor,
    ) -> Result<(), SandboxError>;

    /// Overwrite `path` (relative to the workspace root) with `content`.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Write`] if the path escapes the workspace or
    /// the write fails, and [`SandboxError::NotProvisioned`] before setup.
    async fn write_file(&mut self, path: &str, content: &str) -> Result<(), SandboxError>;

    /// Run `command` through a shell in the workspace root.
    ///
    /// Never fails: launch errors and timeouts come back as a non-passing
    /// outcome with a sentinel exit code.
    async fn run(&mut self, command: &str) -> VerificationOutcome;

    /// Release every resource held. Idempotent.
    async fn dispose(&mut self);

    /// Release every resource held without awaiting. Idempotent.
    ///
    /// Called from `Drop` when a run is abandoned before it reaches
    /// [`dispose`](Self::dispose), e.g. when an outer timeout drops it.
    fn dispose_now(&mut self);

    /// Short backend name for logs.
    fn name(&self) -> &str;
}

/// Which environment backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    /// Run inside a container (requires `docker`).
    #[default]
    Docker,
    /// Run in a temporary directory on the host.
    Local,
}

impl std::str::FromStr for SandboxBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" | "container" => Ok(Self::Docker),
            "local" | "host" => Ok(Self::Local),
            other => Err(format!(
                "Unknown sandbox backend '{}'. Valid options: docker, local",
                other
            )),
        }
    }
}

impl std::fmt::Display for SandboxBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// Sandbox settings, the `[sandbox]` table of the settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Backend to provision.
    pub backend: SandboxBackend,
    /// Timeout for one verification command, in seconds.
    pub command_timeout_secs: u64,
    /// Timeout for each provisioning step, in seconds.
    pub provision_timeout_secs: u64,
    /// Parent directory for local workspaces. Defaults to the system temp dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_root: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::default(),
            command_timeout_secs: 900,
            provision_timeout_secs: 900,
            work_root: None,
        }
    }
}

impl SandboxConfig {
    /// Verification command timeout.
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Provisioning step timeout.
    #[must_use]
    pub fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_timeout_secs)
    }

    /// Validate the sandbox configuration.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.command_timeout_secs == 0 {
            return Err("command_timeout_secs must be greater than 0".to_string());
        }
        if self.provision_timeout_secs == 0 {
            return Err("provision_timeout_secs must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Create an unprovisioned environment for the configured backend.
#[must_use]
pub fn create_environment(config: &SandboxConfig) -> Box<dyn ExecutionEnvironment> {
    match config.backend {
        SandboxBackend::Docker => Box::new(
            DockerSandbox::new()
                .with_command_timeout(config.command_timeout())
                .with_provision_timeout(config.provision_timeout()),
        ),
        SandboxBackend::Local => {
            let root = config.work_root.clone().unwrap_or_else(std::env::temp_dir);
            Box::new(
                LocalSandbox::new(root)
                    .with_command_timeout(config.command_timeout())
                    .with_provision_timeout(config.provision_timeout()),
            )
        }
    }
}

/// Normalize a patch path to a relative path inside the workspace.
///
/// # Errors
///
/// Rejects empty paths, absolute paths and paths containing `..`.
pub fn workspace_relative(path: &str) -> Result<PathBuf, SandboxError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(SandboxError::write(path, "empty path"));
    }

    let mut normalized = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(SandboxError::write(path, "path escapes the workspace"));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(SandboxError::write(path, "absolute paths are not allowed"));
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(SandboxError::write(path, "path names no file"));
    }
    Ok(normalized)
}

/// Quote `value` for a POSIX shell.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
