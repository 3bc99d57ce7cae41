//! Scriptable test doubles for the fix loop's collaborators.
//!
//! These mocks record every call so tests can assert call counts and the
//! exact arguments the controller passed.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::agents::{FailureDiagnoser, GenerationError, PatchGenerator};
use crate::fix::{AttemptRecord, CandidatePatch, CodeExcerpt, ProblemStatement, VerificationOutcome};
use crate::sandbox::{workspace_relative, ExecutionEnvironment, SandboxError, SourceLocation};
use crate::stack::RuntimeDescriptor;

/// Mock patch generator.
///
/// Call `n` returns a patch to `src/fix.rs` whose content is `// attempt n`,
/// unless configured to fail or cancel on that call.
///
/// # Example
///
/// ```rust,ignore
/// let generator = ScriptedGenerator::new().with_error_on(2, "unparsable");
/// ```
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    path: String,
    error_on: Option<(u32, String)>,
    cancel_on: Option<(u32, CancellationToken)>,
    hang_on: Option<u32>,
    call_count: AtomicU32,
    histories: Mutex<Vec<Vec<AttemptRecord>>>,
    excerpt_counts: Mutex<Vec<usize>>,
}

impl ScriptedGenerator {
    /// Create a generator that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            path: "src/fix.rs".to_string(),
            ..Self::default()
        }
    }

    /// Target a different file path.
    #[must_use]
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    /// Fail with a malformed-response error on call `call` (1-based).
    #[must_use]
    pub fn with_error_on(mut self, call: u32, reason: &str) -> Self {
        self.error_on = Some((call, reason.to_string()));
        self
    }

    /// Cancel `token` while serving call `call`, then block until cancelled.
    #[must_use]
    pub fn with_cancel_on(mut self, call: u32, token: CancellationToken) -> Self {
        self.cancel_on = Some((call, token));
        self
    }

    /// Never return from call `call`.
    #[must_use]
    pub fn with_hang_on(mut self, call: u32) -> Self {
        self.hang_on = Some(call);
        self
    }

    /// Number of `generate` calls made.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// The history passed to each call, in call order.
    pub fn histories(&self) -> Vec<Vec<AttemptRecord>> {
        self.histories
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// The number of excerpts passed to each call.
    pub fn excerpt_counts(&self) -> Vec<usize> {
        self.excerpt_counts
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PatchGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        _problem: &ProblemStatement,
        excerpts: &[CodeExcerpt],
        history: &[AttemptRecord],
    ) -> Result<CandidatePatch, GenerationError> {
        let call = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut seen) = self.histories.lock() {
            seen.push(history.to_vec());
        }
        if let Ok(mut counts) = self.excerpt_counts.lock() {
            counts.push(excerpts.len());
        }

        if let Some((cancel_call, token)) = &self.cancel_on {
            if *cancel_call == call {
                token.cancel();
                std::future::pending::<()>().await;
            }
        }

        if self.hang_on == Some(call) {
            std::future::pending::<()>().await;
        }

        if let Some((error_call, reason)) = &self.error_on {
            if *error_call == call {
                return Err(GenerationError::malformed(reason.clone()));
            }
        }

        Ok(CandidatePatch::new(
            self.path.clone(),
            format!("// attempt {}\n", call),
        ))
    }
}

/// Mock failure diagnoser.
#[derive(Debug, Default)]
pub struct ScriptedDiagnoser {
    diagnosis: String,
    error: Option<String>,
    call_count: AtomicU32,
    error_texts: Mutex<Vec<String>>,
}

impl ScriptedDiagnoser {
    /// Create a diagnoser that answers `"diagnosis"`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            diagnosis: "diagnosis".to_string(),
            ..Self::default()
        }
    }

    /// Set the diagnosis text returned.
    #[must_use]
    pub fn with_diagnosis(mut self, diagnosis: &str) -> Self {
        self.diagnosis = diagnosis.to_string();
        self
    }

    /// Make every call fail.
    #[must_use]
    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Number of `diagnose` calls made.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// The error text passed to each call.
    pub fn error_texts(&self) -> Vec<String> {
        self.error_texts
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl FailureDiagnoser for ScriptedDiagnoser {
    async fn diagnose(&self, _patch: &CandidatePatch, error_text: &str) -> anyhow::Result<String> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut texts) = self.error_texts.lock() {
            texts.push(error_text.to_string());
        }
        match &self.error {
            Some(error) => anyhow::bail!("{}", error),
            None => Ok(self.diagnosis.clone()),
        }
    }
}

/// In-memory execution environment.
///
/// Run `n` fails with stderr `test failure #n` unless `n` is the configured
/// passing run.
#[derive(Debug, Default)]
pub struct MockEnvironment {
    pass_on: Option<u32>,
    provision_error: Option<String>,
    write_error_on: Option<u32>,
    files: HashMap<String, String>,
    writes: Vec<(String, String)>,
    commands: Vec<String>,
    provision_count: u32,
    dispose_count: u32,
}

impl MockEnvironment {
    /// Create an environment where every run fails.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Let run `run` (1-based) pass.
    #[must_use]
    pub fn with_pass_on(mut self, run: u32) -> Self {
        self.pass_on = Some(run);
        self
    }

    /// Make `provision` fail.
    #[must_use]
    pub fn with_provision_error(mut self, message: &str) -> Self {
        self.provision_error = Some(message.to_string());
        self
    }

    /// Make write number `write` (1-based) fail.
    #[must_use]
    pub fn with_write_error_on(mut self, write: u32) -> Self {
        self.write_error_on = Some(write);
        self
    }

    /// The stderr text produced by failing run `run`.
    #[must_use]
    pub fn stderr_for(&self, run: u32) -> String {
        format!("test failure #{}", run)
    }

    /// Number of `provision` calls.
    pub fn provision_count(&self) -> u32 {
        self.provision_count
    }

    /// Number of `dispose` and `dispose_now` calls.
    pub fn dispose_count(&self) -> u32 {
        self.dispose_count
    }

    /// Commands run, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.clone()
    }

    /// `(path, content)` of every successful write, in order.
    pub fn writes(&self) -> Vec<(String, String)> {
        self.writes.clone()
    }

    /// Current content of a file.
    pub fn file(&self, path: &str) -> Option<String> {
        self.files.get(path).cloned()
    }
}

#[async_trait]
impl ExecutionEnvironment for MockEnvironment {
    async fn provision(
        &mut self,
        _source: &SourceLocation,
        _runtime: &RuntimeDescriptor,
    ) -> Result<(), SandboxError> {
        self.provision_count += 1;
        if let Some(message) = &self.provision_error {
            return Err(SandboxError::provision(message.clone()));
        }
        Ok(())
    }

    async fn write_file(&mut self, path: &str, content: &str) -> Result<(), SandboxError> {
        workspace_relative(path)?;
        let write = self.writes.len() as u32 + 1;
        if self.write_error_on == Some(write) {
            return Err(SandboxError::write(path, "disk full"));
        }
        self.files.insert(path.to_string(), content.to_string());
        self.writes.push((path.to_string(), content.to_string()));
        Ok(())
    }

    async fn run(&mut self, command: &str) -> VerificationOutcome {
        self.commands.push(command.to_string());
        let run = self.commands.len() as u32;
        if self.pass_on == Some(run) {
            VerificationOutcome::from_exit(0, "all tests passed", "", Duration::from_millis(10))
        } else {
            VerificationOutcome::from_exit(1, "", self.stderr_for(run), Duration::from_millis(10))
        }
    }

    async fn dispose(&mut self) {
        self.dispose_count += 1;
    }

    fn dispose_now(&mut self) {
        self.dispose_count += 1;
    }

    fn name(&self) -> &str {
        "mock"
    }
}
