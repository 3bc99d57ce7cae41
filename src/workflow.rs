//! End-to-end pipeline for one issue.
//!
//! issue URL → issue → problem statement → checkout → stack → search plan →
//! excerpts → sandbox → fix loop → report.
//!
//! Setup problems (bad URL, missing tools, missing secrets) are returned as
//! errors before any work starts. Anything that goes wrong after that is
//! folded into the [`WorkflowResult`] so a report can always be written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agents::{Engineer, IssueAnalyzer, Scout, SearchQuery};
use crate::config::Settings;
use crate::error::{OssDevError, Result};
use crate::fix::{
    AttemptBudget, AttemptRecord, CandidatePatch, FixController, LoopOutcome, LoopResult,
};
use crate::github::{parse_issue_url, GitHubClient, IssueRef};
use crate::llm::{create_llm_client, LlmClient, UsageLedger};
use crate::sandbox::{create_environment, SandboxBackend, SourceLocation};
use crate::search::{collect_excerpts, project_map, RipgrepSearch, DEFAULT_MAP_DEPTH};
use crate::stack::{detect_stack, RuntimeDescriptor};

/// Per-run options, usually from the command line.
#[derive(Debug, Clone, Default)]
pub struct WorkflowOptions {
    /// Stop after locating code; never provision a sandbox.
    pub dry_run: bool,
    /// Overrides `max_attempts` from the settings.
    pub max_attempts: Option<u32>,
    /// Use this checkout instead of cloning.
    pub local_path: Option<PathBuf>,
    /// Overrides the configured sandbox backend.
    pub sandbox: Option<SandboxBackend>,
    /// Where to write the JSON report.
    pub output: Option<PathBuf>,
}

/// How a workflow run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Fixed,
    Exhausted,
    Aborted,
    Cancelled,
    Error,
    /// `--dry-run` finished locating code.
    DryRun,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Fixed => "fixed",
            Self::Exhausted => "exhausted",
            Self::Aborted => "aborted",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
            Self::DryRun => "dry_run",
        };
        f.write_str(label)
    }
}

/// Report of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    /// `owner/repo#n`.
    pub issue: String,
    pub status: WorkflowStatus,
    /// The verified patch, when fixed.
    pub patch: Option<CandidatePatch>,
    /// Attempts that completed verification.
    pub attempts: u32,
    pub duration_secs: f64,
    pub cost_usd: f64,
    /// What went wrong, for every status but `fixed` and `dry_run`.
    pub error: Option<String>,
    pub stack: Option<RuntimeDescriptor>,
    pub queries: Vec<SearchQuery>,
    pub excerpt_count: usize,
    /// Failed attempts in order.
    pub history: Vec<AttemptRecord>,
    pub finished_at: DateTime<Utc>,
}

impl WorkflowResult {
    fn new(issue: &IssueRef) -> Self {
        Self {
            issue: issue.to_string(),
            status: WorkflowStatus::Error,
            patch: None,
            attempts: 0,
            duration_secs: 0.0,
            cost_usd: 0.0,
            error: None,
            stack: None,
            queries: Vec::new(),
            excerpt_count: 0,
            history: Vec::new(),
            finished_at: Utc::now(),
        }
    }

    /// Record the controller's verdict.
    pub fn apply_loop_result(&mut self, result: LoopResult) {
        self.attempts = result.attempts;
        self.history = result.history;
        match result.outcome {
            LoopOutcome::Fixed(patch) => {
                self.status = WorkflowStatus::Fixed;
                self.patch = Some(patch);
            }
            LoopOutcome::Exhausted => {
                self.status = WorkflowStatus::Exhausted;
                self.error = Some(format!(
                    "no passing patch after {} attempts",
                    self.attempts
                ));
            }
            LoopOutcome::Aborted(cause) => {
                self.status = WorkflowStatus::Aborted;
                self.error = Some(cause.to_string());
            }
            LoopOutcome::Cancelled => self.mark_cancelled(),
        }
    }

    fn mark_cancelled(&mut self) {
        self.status = WorkflowStatus::Cancelled;
        self.error = Some("cancelled by user".to_string());
    }

    /// Whether the run ended the way the user asked for.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.status, WorkflowStatus::Fixed | WorkflowStatus::DryRun)
    }

    /// The error the CLI should exit with, if any.
    #[must_use]
    pub fn to_error(&self) -> Option<OssDevError> {
        let reason = || self.error.clone().unwrap_or_else(|| self.status.to_string());
        match self.status {
            WorkflowStatus::Fixed | WorkflowStatus::DryRun => None,
            WorkflowStatus::Exhausted => Some(OssDevError::AttemptsExhausted {
                attempts: self.attempts,
            }),
            WorkflowStatus::Aborted | WorkflowStatus::Cancelled => {
                Some(OssDevError::Aborted { reason: reason() })
            }
            WorkflowStatus::Error => Some(OssDevError::Other(anyhow::anyhow!(reason()))),
        }
    }

    /// Write the report as pretty JSON, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`OssDevError::Io`] or [`OssDevError::Json`] on failure.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Check that every tool is on `PATH`.
///
/// # Errors
///
/// Returns [`OssDevError::MissingTool`] for the first tool not found.
pub fn require_tools(tools: &[&str]) -> Result<()> {
    for tool in tools {
        if which::which(tool).is_err() {
            return Err(OssDevError::MissingTool {
                tool: (*tool).to_string(),
            });
        }
    }
    Ok(())
}

/// Tools a run needs, given its options and backend.
#[must_use]
pub fn required_tools(options: &WorkflowOptions, backend: SandboxBackend) -> Vec<&'static str> {
    let mut tools = vec!["rg"];
    if options.local_path.is_none() {
        tools.push("git");
    }
    if !options.dry_run && backend == SandboxBackend::Docker {
        tools.push("docker");
    }
    tools
}

/// Callback receiving a short description of each phase as it starts.
pub type PhaseReporter = Arc<dyn Fn(&str) + Send + Sync>;

/// One configured pipeline; run it once per issue.
pub struct FixWorkflow {
    settings: Settings,
    options: WorkflowOptions,
    client: Arc<dyn LlmClient>,
    ledger: Arc<UsageLedger>,
    github: GitHubClient,
    search: RipgrepSearch,
    reporter: Option<PhaseReporter>,
}

impl FixWorkflow {
    /// Build a workflow from settings, creating the configured model client.
    ///
    /// # Errors
    ///
    /// Returns [`OssDevError::InvalidConfig`] for invalid settings or
    /// overrides and [`OssDevError::Config`] if the client cannot be built.
    pub fn new(settings: Settings, options: WorkflowOptions) -> Result<Self> {
        let ledger = Arc::new(UsageLedger::new());
        let client = create_llm_client(&settings.llm, Arc::clone(&ledger))
            .map_err(|e| OssDevError::config(format!("{:#}", e)))?;
        Self::with_client(settings, options, client, ledger)
    }

    /// Build a workflow around an existing model client.
    ///
    /// # Errors
    ///
    /// Returns [`OssDevError::InvalidConfig`] for invalid settings or a zero
    /// attempt override.
    pub fn with_client(
        mut settings: Settings,
        options: WorkflowOptions,
        client: Arc<dyn LlmClient>,
        ledger: Arc<UsageLedger>,
    ) -> Result<Self> {
        if let Some(max_attempts) = options.max_attempts {
            settings.max_attempts = max_attempts;
        }
        if let Some(backend) = options.sandbox {
            settings.sandbox.backend = backend;
        }
        settings.validate()?;

        let github = GitHubClient::new(settings.github_token());
        Ok(Self {
            settings,
            options,
            client,
            ledger,
            github,
            search: RipgrepSearch::new(),
            reporter: None,
        })
    }

    /// Use a different GitHub client.
    #[must_use]
    pub fn with_github(mut self, github: GitHubClient) -> Self {
        self.github = github;
        self
    }

    /// Use a different search runner.
    #[must_use]
    pub fn with_search(mut self, search: RipgrepSearch) -> Self {
        self.search = search;
        self
    }

    /// Report phase changes to `reporter`.
    #[must_use]
    pub fn with_reporter(mut self, reporter: PhaseReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// The effective settings after overrides.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn phase(&self, message: &str) {
        info!("{}", message);
        if let Some(reporter) = &self.reporter {
            reporter(message);
        }
    }

    /// Run the pipeline for `issue_url`.
    ///
    /// # Errors
    ///
    /// Returns [`OssDevError::InvalidIssueUrl`] before doing any work. Every
    /// later failure is reported through [`WorkflowResult::status`].
    pub async fn run(&self, issue_url: &str, cancel: &CancellationToken) -> Result<WorkflowResult> {
        let issue = parse_issue_url(issue_url)?;
        let started = Instant::now();
        let mut report = WorkflowResult::new(&issue);

        let checkout = match &self.options.local_path {
            Some(path) => Checkout::Existing(path.clone()),
            None => Checkout::Temporary(
                std::env::temp_dir().join(format!("oss-dev-clone-{}", uuid::Uuid::new_v4())),
            ),
        };

        if let Err(e) = self.execute(&issue, &checkout, &mut report, cancel).await {
            warn!("Workflow for {} failed: {}", issue, e);
            report.status = WorkflowStatus::Error;
            report.error = Some(e.to_string());
        }
        checkout.cleanup().await;

        report.duration_secs = started.elapsed().as_secs_f64();
        report.cost_usd = self.ledger.total_cost();
        report.finished_at = Utc::now();

        if let Some(path) = &self.options.output {
            report.write_json(path)?;
            info!("Report written to {}", path.display());
        }
        Ok(report)
    }

    async fn execute(
        &self,
        issue: &IssueRef,
        checkout: &Checkout,
        report: &mut WorkflowResult,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.phase(&format!("Fetching issue {}", issue));
        let details = self.github.fetch_issue(issue).await?;
        if cancel.is_cancelled() {
            report.mark_cancelled();
            return Ok(());
        }

        self.phase("Analyzing issue");
        let problem = IssueAnalyzer::new(Arc::clone(&self.client))
            .analyze(&details)
            .await?;
        info!("Problem: {}", problem.summary);

        if let Checkout::Temporary(dir) = checkout {
            self.phase("Cloning repository");
            self.github.clone_repo(issue, dir).await?;
        }
        let repo = checkout.path();
        if cancel.is_cancelled() {
            report.mark_cancelled();
            return Ok(());
        }

        let runtime = detect_stack(repo)?;
        info!(
            "Detected {} project (test command: {})",
            runtime.language, runtime.test_command
        );
        report.stack = Some(runtime.clone());

        self.phase("Locating relevant code");
        let queries = Scout::new(Arc::clone(&self.client))
            .plan_queries(&problem, runtime.language)
            .await;
        let excerpts = collect_excerpts(&self.search, repo, &queries, &self.settings.search).await;
        report.queries = queries;
        report.excerpt_count = excerpts.len();

        if self.options.dry_run {
            info!("Dry run: skipping sandbox and fix loop");
            report.status = WorkflowStatus::DryRun;
            return Ok(());
        }
        if cancel.is_cancelled() {
            report.mark_cancelled();
            return Ok(());
        }

        let engineer = Arc::new(
            Engineer::new(Arc::clone(&self.client))
                .with_budget(Arc::clone(&self.ledger), self.settings.max_cost_usd)
                .with_project_map(project_map(repo, DEFAULT_MAP_DEPTH)),
        );
        let controller = FixController::new(
            engineer.clone(),
            engineer,
            AttemptBudget::new(self.settings.max_attempts)?,
        );

        let source = match (&self.options.local_path, self.settings.sandbox.backend) {
            (None, SandboxBackend::Docker) => SourceLocation::Remote(issue.clone_url()),
            _ => SourceLocation::Local(repo.to_path_buf()),
        };

        self.phase(&format!(
            "Fixing in {} sandbox (up to {} attempts)",
            self.settings.sandbox.backend, self.settings.max_attempts
        ));
        let mut env = create_environment(&self.settings.sandbox);
        let result = controller
            .provision_and_run(env.as_mut(), &source, &runtime, &problem, &excerpts, cancel)
            .await;
        report.apply_loop_result(result);
        Ok(())
    }
}

/// Where the repository lives for the duration of a run.
enum Checkout {
    /// Owned by the caller; never removed.
    Existing(PathBuf),
    /// Cloned for this run; removed afterwards.
    Temporary(PathBuf),
}

impl Checkout {
    fn path(&self) -> &Path {
        match self {
            Self::Existing(path) | Self::Temporary(path) => path,
        }
    }

    async fn cleanup(&self) {
        if let Self::Temporary(dir) = self {
            if dir.exists() {
                if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                    warn!("Failed to remove {}: {}", dir.display(), e);
                }
            }
        }
    }
}

/// Check the tools and secrets a run needs.
///
/// # Errors
///
/// Returns [`OssDevError::MissingTool`] or
/// [`OssDevError::MissingCredentials`].
pub fn preflight(options: &WorkflowOptions, settings: &Settings) -> Result<()> {
    let backend = options.sandbox.unwrap_or(settings.sandbox.backend);
    require_tools(&required_tools(options, backend))?;
    settings.require_credentials(|name| std::env::var(name).ok())
}

/// Check tools and secrets, then run the pipeline for `issue_url`.
///
/// # Errors
///
/// Returns setup errors ([`OssDevError::InvalidIssueUrl`],
/// [`OssDevError::MissingTool`], [`OssDevError::MissingCredentials`],
/// configuration errors). Pipeline failures are reported in the result.
pub async fn run_fix_workflow(
    issue_url: &str,
    options: WorkflowOptions,
    settings: Settings,
    cancel: &CancellationToken,
    reporter: Option<PhaseReporter>,
) -> Result<WorkflowResult> {
    parse_issue_url(issue_url)?;
    preflight(&options, &settings)?;

    let mut workflow = FixWorkflow::new(settings, options)?;
    if let Some(reporter) = reporter {
        workflow = workflow.with_reporter(reporter);
    }
    workflow.run(issue_url, cancel).await
}
