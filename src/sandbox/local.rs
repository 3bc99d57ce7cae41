//! Host-directory sandbox.
//!
//! Cheap and dependency-free, but not isolated from the host: commands run
//! as the current user. Useful for trusted repositories and for tests.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::process::{run_captured, run_step};
use super::{workspace_relative, ExecutionEnvironment, SandboxError, SourceLocation};
use crate::fix::VerificationOutcome;
use crate::stack::RuntimeDescriptor;

/// Directories never copied from a local checkout.
const SKIP_DIRS: &[&str] = &[".git", "node_modules", "target", ".venv", "__pycache__"];

/// A disposable workspace directory under a work root.
#[derive(Debug)]
pub struct LocalSandbox {
    root: PathBuf,
    workspace: Option<PathBuf>,
    command_timeout: Duration,
    provision_timeout: Duration,
}

impl LocalSandbox {
    /// Create a sandbox whose workspaces live under `root`.
    #[must_use]
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            workspace: None,
            command_timeout: Duration::from_secs(900),
            provision_timeout: Duration::from_secs(900),
        }
    }

    /// Set the verification command timeout.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the timeout for each provisioning step.
    #[must_use]
    pub fn with_provision_timeout(mut self, timeout: Duration) -> Self {
        self.provision_timeout = timeout;
        self
    }

    /// The workspace directory, once provisioned.
    #[must_use]
    pub fn workspace(&self) -> Option<&Path> {
        self.workspace.as_deref()
    }

    fn shell(&self, workspace: &Path, command: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(workspace);
        // Own process group, so a timeout also kills what the command spawned.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

#[async_trait]
impl ExecutionEnvironment for LocalSandbox {
    async fn provision(
        &mut self,
        source: &SourceLocation,
        runtime: &RuntimeDescriptor,
    ) -> Result<(), SandboxError> {
        if self.workspace.is_some() {
            return Err(SandboxError::provision("sandbox is already provisioned"));
        }

        let workspace = self.root.join(format!("oss-dev-{}", uuid::Uuid::new_v4()));
        info!("Creating local sandbox at {}", workspace.display());
        tokio::fs::create_dir_all(&workspace)
            .await
            .map_err(|e| SandboxError::provision(format!("create workspace: {}", e)))?;
        // Recorded before any fallible step so dispose() cleans up after failures.
        self.workspace = Some(workspace.clone());

        match source {
            SourceLocation::Remote(url) => {
                let mut cmd = Command::new("git");
                cmd.args(["clone", "--depth", "1", url.as_str(), "."])
                    .current_dir(&workspace);
                run_step("git clone", cmd, None, self.provision_timeout)
                    .await
                    .map_err(SandboxError::provision)?;
            }
            SourceLocation::Local(path) => {
                let from = path.clone();
                let to = workspace.clone();
                tokio::task::spawn_blocking(move || copy_tree(&from, &to))
                    .await
                    .map_err(|e| SandboxError::provision(format!("copy task failed: {}", e)))?
                    .map_err(|e| SandboxError::provision(format!("copy source: {}", e)))?;
            }
        }

        if !runtime.install_command.trim().is_empty() {
            debug!("Installing dependencies: {}", runtime.install_command);
            let cmd = self.shell(&workspace, &runtime.install_command);
            run_step("install command", cmd, None, self.provision_timeout)
                .await
                .map_err(SandboxError::provision)?;
        }

        info!("Sandbox ready");
        Ok(())
    }

    async fn write_file(&mut self, path: &str, content: &str) -> Result<(), SandboxError> {
        let workspace = self.workspace.as_ref().ok_or(SandboxError::NotProvisioned)?;
        let target = workspace.join(workspace_relative(path)?);

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SandboxError::write(path, e.to_string()))?;
        }
        tokio::fs::write(&target, content)
            .await
            .map_err(|e| SandboxError::write(path, e.to_string()))?;

        debug!("Wrote {} ({} bytes)", target.display(), content.len());
        Ok(())
    }

    async fn run(&mut self, command: &str) -> VerificationOutcome {
        let Some(workspace) = self.workspace.clone() else {
            return VerificationOutcome::launch_failure(
                "environment is not provisioned",
                Duration::ZERO,
            );
        };
        debug!("Running `{}` in {}", command, workspace.display());
        run_captured(self.shell(&workspace, command), None, self.command_timeout).await
    }

    async fn dispose(&mut self) {
        if let Some(workspace) = self.workspace.take() {
            match tokio::fs::remove_dir_all(&workspace).await {
                Ok(()) => debug!("Removed sandbox {}", workspace.display()),
                Err(e) => warn!(
                    "Failed to remove sandbox {}: {}",
                    workspace.display(),
                    e
                ),
            }
        }
    }

    fn dispose_now(&mut self) {
        if let Some(workspace) = self.workspace.take() {
            match std::fs::remove_dir_all(&workspace) {
                Ok(()) => debug!("Removed sandbox {}", workspace.display()),
                Err(e) => warn!(
                    "Failed to remove sandbox {}: {}",
                    workspace.display(),
                    e
                ),
            }
        }
    }

    fn name(&self) -> &str {
        "local"
    }
}

impl Drop for LocalSandbox {
    fn drop(&mut self) {
        self.dispose_now();
    }
}

/// Copy a checkout into `to`, skipping VCS metadata and build output.
fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(from)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !(e.file_type().is_dir()
                    && SKIP_DIRS.contains(&e.file_name().to_string_lossy().as_ref()))
        })
    {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = match entry.path().strip_prefix(from) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let dest = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn runtime_with_install(install: &str) -> RuntimeDescriptor {
        RuntimeDescriptor {
            install_command: install.to_string(),
            ..RuntimeDescriptor::default()
        }
    }

    fn project() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("app.py"), "print('bug')\n").unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();
        dir
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_provision_copies_source_without_vcs() {
        let source = project();
        let root = TempDir::new().unwrap();
        let mut sandbox = LocalSandbox::new(root.path());

        sandbox
            .provision(
                &SourceLocation::Local(source.path().to_path_buf()),
                &runtime_with_install(""),
            )
            .await
            .unwrap();

        let ws = sandbox.workspace().unwrap().to_path_buf();
        assert!(ws.join("app.py").exists());
        assert!(!ws.join(".git").exists());

        sandbox.dispose().await;
        assert!(!ws.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_then_run() {
        let source = project();
        let root = TempDir::new().unwrap();
        let mut sandbox = LocalSandbox::new(root.path());
        sandbox
            .provision(
                &SourceLocation::Local(source.path().to_path_buf()),
                &runtime_with_install(""),
            )
            .await
            .unwrap();

        sandbox.write_file("pkg/fixed.txt", "fixed").await.unwrap();
        let outcome = sandbox.run("cat pkg/fixed.txt").await;
        assert!(outcome.passed);
        assert_eq!(outcome.stdout, "fixed");

        let failing = sandbox.run("echo broken >&2; exit 1").await;
        assert!(!failing.passed);
        assert_eq!(failing.stderr.trim(), "broken");

        sandbox.dispose().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_install_is_provision_error_and_disposable() {
        let source = project();
        let root = TempDir::new().unwrap();
        let mut sandbox = LocalSandbox::new(root.path());

        let err = sandbox
            .provision(
                &SourceLocation::Local(source.path().to_path_buf()),
                &runtime_with_install("exit 9"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Provision { .. }));

        let ws = sandbox.workspace().unwrap().to_path_buf();
        sandbox.dispose().await;
        sandbox.dispose().await;
        assert!(!ws.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_drop_removes_workspace() {
        let source = project();
        let root = TempDir::new().unwrap();
        let mut sandbox = LocalSandbox::new(root.path());
        sandbox
            .provision(
                &SourceLocation::Local(source.path().to_path_buf()),
                &runtime_with_install(""),
            )
            .await
            .unwrap();

        let ws = sandbox.workspace().unwrap().to_path_buf();
        assert!(ws.exists());
        drop(sandbox);
        assert!(!ws.exists());
    }

    #[tokio::test]
    async fn test_write_before_provision_fails() {
        let mut sandbox = LocalSandbox::new(std::env::temp_dir());
        let err = sandbox.write_file("a.txt", "x").await.unwrap_err();
        assert!(matches!(err, SandboxError::NotProvisioned));
    }

    #[tokio::test]
    async fn test_run_before_provision_is_failed_outcome() {
        let mut sandbox = LocalSandbox::new(std::env::temp_dir());
        let outcome = sandbox.run("true").await;
        assert!(!outcome.passed);
        assert_eq!(outcome.exit_code, crate::fix::LAUNCH_FAILED_EXIT_CODE);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_rejects_escaping_path() {
        let source = project();
        let root = TempDir::new().unwrap();
        let mut sandbox = LocalSandbox::new(root.path());
        sandbox
            .provision(
                &SourceLocation::Local(source.path().to_path_buf()),
                &runtime_with_install(""),
            )
            .await
            .unwrap();

        let err = sandbox.write_file("../outside.txt", "x").await.unwrap_err();
        assert!(matches!(err, SandboxError::Write { .. }));
        sandbox.dispose().await;
    }
}
