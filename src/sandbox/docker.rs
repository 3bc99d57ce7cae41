//! Container sandbox driven through the `docker` CLI.
//!
//! The container is started once with `sleep infinity` and every later step
//! is a `docker exec` into it, so file writes and test side effects persist
//! across attempts until the container is removed.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::process::{run_captured, run_step};
use super::{shell_quote, workspace_relative, ExecutionEnvironment, SandboxError, SourceLocation};
use crate::fix::{VerificationOutcome, TIMED_OUT_EXIT_CODE};
use crate::stack::RuntimeDescriptor;

/// Working directory inside the container.
pub const CONTAINER_WORKDIR: &str = "/workspace";

/// Kills every process in the container except its init (`sleep infinity`).
const REAP_SCRIPT: &str = "kill -KILL -1";

/// Sandbox backed by a single long-lived container.
#[derive(Debug)]
pub struct DockerSandbox {
    docker: String,
    container: Option<String>,
    command_timeout: Duration,
    provision_timeout: Duration,
}

impl Default for DockerSandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerSandbox {
    /// Create a sandbox using the `docker` binary on `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            docker: "docker".to_string(),
            container: None,
            command_timeout: Duration::from_secs(900),
            provision_timeout: Duration::from_secs(900),
        }
    }

    /// Use a different container CLI (e.g. `podman`).
    #[must_use]
    pub fn with_binary(mut self, binary: &str) -> Self {
        self.docker = binary.to_string();
        self
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

    /// The running container id, once provisioned.
    #[must_use]
    pub fn container_id(&self) -> Option<&str> {
        self.container.as_deref()
    }

    fn exec(&self, container: &str, interactive: bool, script: &str) -> Command {
        let mut cmd = Command::new(&self.docker);
        cmd.arg("exec");
        if interactive {
            cmd.arg("-i");
        }
        cmd.args(["-w", CONTAINER_WORKDIR, container, "sh", "-c", script]);
        cmd
    }

    /// Kill whatever a timed-out command left running in the container.
    ///
    /// Killing the host-side `docker exec` client does not stop the process
    /// it started, so the next attempt would otherwise share the container
    /// with the previous test run.
    async fn reap(&self, container: &str) {
        let outcome = run_captured(
            self.exec(container, false, REAP_SCRIPT),
            None,
            Duration::from_secs(60),
        )
        .await;
        if outcome.exit_code == TIMED_OUT_EXIT_CODE {
            warn!("Could not stop timed-out command in {}", container);
        } else {
            debug!("Stopped leftover processes in {}", container);
        }
    }

    async fn start_container(&self, image: &str) -> Result<String, SandboxError> {
        let mut cmd = Command::new(&self.docker);
        cmd.args([
            "run",
            "-d",
            "--rm",
            "-w",
            CONTAINER_WORKDIR,
            image,
            "sleep",
            "infinity",
        ]);
        let outcome = run_step("docker run", cmd, None, self.provision_timeout)
            .await
            .map_err(SandboxError::provision)?;

        let id = outcome.stdout.trim().to_string();
        if id.is_empty() {
            return Err(SandboxError::provision("docker run returned no container id"));
        }
        Ok(id)
    }

    async fn load_source(&self, container: &str, source: &SourceLocation) -> Result<(), SandboxError> {
        let step = match source {
            SourceLocation::Remote(url) => {
                let script = format!("git clone --depth 1 {} .", shell_quote(url));
                run_step("git clone", self.exec(container, false, &script), None, self.provision_timeout).await
            }
            SourceLocation::Local(path) => {
                let mut cmd = Command::new(&self.docker);
                cmd.arg("cp")
                    .arg(format!("{}/.", path.display()))
                    .arg(format!("{}:{}", container, CONTAINER_WORKDIR));
                run_step("docker cp", cmd, None, self.provision_timeout).await
            }
        };
        step.map(|_| ()).map_err(SandboxError::provision)
    }
}

#[async_trait]
impl ExecutionEnvironment for DockerSandbox {
    async fn provision(
        &mut self,
        source: &SourceLocation,
        runtime: &RuntimeDescriptor,
    ) -> Result<(), SandboxError> {
        if self.container.is_some() {
            return Err(SandboxError::provision("sandbox is already provisioned"));
        }

        info!("Creating container sandbox from {}", runtime.runtime);
        let container = self.start_container(&runtime.runtime).await?;
        self.container = Some(container.clone());

        self.load_source(&container, source).await?;

        if !runtime.install_command.trim().is_empty() {
            debug!("Installing dependencies: {}", runtime.install_command);
            run_step(
                "install command",
                self.exec(&container, false, &runtime.install_command),
                None,
                self.provision_timeout,
            )
            .await
            .map_err(SandboxError::provision)?;
        }

        info!("Sandbox ready ({})", &container[..container.len().min(12)]);
        Ok(())
    }

    async fn write_file(&mut self, path: &str, content: &str) -> Result<(), SandboxError> {
        let container = self.container.clone().ok_or(SandboxError::NotProvisioned)?;
        let relative = workspace_relative(path)?;
        let target = Path::new(CONTAINER_WORKDIR).join(&relative);
        let parent = target
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| CONTAINER_WORKDIR.to_string());

        let script = format!(
            "mkdir -p {} && cat > {}",
            shell_quote(&parent),
            shell_quote(&target.display().to_string())
        );
        run_step(
            "file write",
            self.exec(&container, true, &script),
            Some(content.as_bytes()),
            self.provision_timeout,
        )
        .await
        .map_err(|e| SandboxError::write(path, e))?;

        debug!("Wrote {} ({} bytes)", target.display(), content.len());
        Ok(())
    }

    async fn run(&mut self, command: &str) -> VerificationOutcome {
        let Some(container) = self.container.clone() else {
            return VerificationOutcome::launch_failure(
                "environment is not provisioned",
                Duration::ZERO,
            );
        };
        debug!("Running `{}` in container", command);
        let outcome =
            run_captured(self.exec(&container, false, command), None, self.command_timeout).await;
        if outcome.exit_code == TIMED_OUT_EXIT_CODE {
            warn!("`{}` timed out; stopping it inside the container", command);
            self.reap(&container).await;
        }
        outcome
    }

    async fn dispose(&mut self) {
        // Cleared only after removal so an interrupted dispose falls back to
        // dispose_now.
        if let Some(container) = self.container.clone() {
            let mut cmd = Command::new(&self.docker);
            cmd.args(["rm", "-f", &container]);
            let outcome = run_captured(cmd, None, Duration::from_secs(60)).await;
            self.container = None;
            if outcome.passed {
                debug!("Removed container {}", container);
            } else {
                warn!(
                    "Failed to remove container {}: {}",
                    container,
                    outcome.stderr.trim()
                );
            }
        }
    }

    fn dispose_now(&mut self) {
        if let Some(container) = self.container.take() {
            let removed = std::process::Command::new(&self.docker)
                .args(["rm", "-f", &container])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            match removed {
                Ok(status) if status.success() => debug!("Removed container {}", container),
                Ok(status) => warn!("Failed to remove container {}: {}", container, status),
                Err(e) => warn!("Failed to remove container {}: {}", container, e),
            }
        }
    }

    fn name(&self) -> &str {
        "docker"
    }
}

impl Drop for DockerSandbox {
    fn drop(&mut self) {
        self.dispose_now();
    }
}
