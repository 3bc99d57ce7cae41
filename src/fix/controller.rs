//! The fix-iteration controller.
//!
//! Drives the bounded generate → write → verify → diagnose loop. Attempts run
//! strictly one after another; each attempt's patch may depend on the
//! diagnosis of the one before it.

use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::history::FailureHistory;
use super::types::{AbortCause, AttemptRecord, CodeExcerpt, LoopResult, ProblemStatement};
use crate::agents::{FailureDiagnoser, PatchGenerator};
use crate::error::{OssDevError, Result};
use crate::sandbox::{ExecutionEnvironment, SourceLocation};
use crate::stack::RuntimeDescriptor;

/// Characters of stderr echoed to the log for a failed attempt.
const LOGGED_STDERR_CHARS: usize = 200;

/// Maximum number of attempts for one run; never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptBudget(NonZeroU32);

impl AttemptBudget {
    /// Create a budget of `max_attempts`.
    ///
    /// # Errors
    ///
    /// Returns [`OssDevError::InvalidConfig`] when `max_attempts` is zero.
    pub fn new(max_attempts: u32) -> Result<Self> {
        NonZeroU32::new(max_attempts)
            .map(Self)
            .ok_or_else(|| OssDevError::invalid_config("max_attempts", "must be at least 1"))
    }

    /// The attempt limit.
    #[must_use]
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl Default for AttemptBudget {
    fn default() -> Self {
        Self(NonZeroU32::MIN.saturating_add(4))
    }
}

/// Coordinates patch generation, verification and failure feedback.
///
/// Holds no per-run state, so one controller may serve several runs as long
/// as each run owns its own environment.
pub struct FixController {
    generator: Arc<dyn PatchGenerator>,
    diagnoser: Arc<dyn FailureDiagnoser>,
    budget: AttemptBudget,
}

impl FixController {
    /// Create a controller.
    #[must_use]
    pub fn new(
        generator: Arc<dyn PatchGenerator>,
        diagnoser: Arc<dyn FailureDiagnoser>,
        budget: AttemptBudget,
    ) -> Self {
        Self {
            generator,
            diagnoser,
            budget,
        }
    }

    /// The configured attempt limit.
    #[must_use]
    pub fn budget(&self) -> AttemptBudget {
        self.budget
    }

    /// Provision `env`, run the loop, and dispose `env`.
    ///
    /// The environment is disposed exactly once whether provisioning fails,
    /// the loop succeeds, runs out of attempts, aborts, or is cancelled.
    /// Dropping the returned future early disposes it as well.
    pub async fn provision_and_run(
        &self,
        env: &mut dyn ExecutionEnvironment,
        source: &SourceLocation,
        runtime: &RuntimeDescriptor,
        problem: &ProblemStatement,
        excerpts: &[CodeExcerpt],
        cancel: &CancellationToken,
    ) -> LoopResult {
        let mut guard = DisposeGuard::new(env);
        info!("Provisioning {} sandbox for {}", guard.env.name(), source);
        match until_cancelled(cancel, guard.env.provision(source, runtime)).await {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                error!("Sandbox provisioning failed: {}", e);
                guard.dispose().await;
                return LoopResult::aborted(0, AbortCause::Environment(e), Vec::new());
            }
            None => {
                guard.dispose().await;
                return LoopResult::cancelled(0);
            }
        }
        let result = self
            .drive(problem, excerpts, &mut *guard.env, &runtime.test_command, cancel)
            .await;
        guard.dispose().await;
        result
    }

    /// Run the fix loop against an already provisioned environment.
    ///
    /// Takes over the environment for the duration of the call and disposes
    /// it before returning, on every path. If the future is dropped before
    /// completion the environment is released with
    /// [`ExecutionEnvironment::dispose_now`].
    pub async fn run(
        &self,
        problem: &ProblemStatement,
        excerpts: &[CodeExcerpt],
        env: &mut dyn ExecutionEnvironment,
        verify_command: &str,
        cancel: &CancellationToken,
    ) -> LoopResult {
        let mut guard = DisposeGuard::new(env);
        let result = self
            .drive(problem, excerpts, &mut *guard.env, verify_command, cancel)
            .await;
        guard.dispose().await;
        result
    }

    async fn drive(
        &self,
        problem: &ProblemStatement,
        excerpts: &[CodeExcerpt],
        env: &mut dyn ExecutionEnvironment,
        verify_command: &str,
        cancel: &CancellationToken,
    ) -> LoopResult {
        let max_attempts = self.budget.get();
        let mut history = FailureHistory::new();

        for attempt in 1..=max_attempts {
            let completed = attempt - 1;
            if cancel.is_cancelled() {
                info!("Fix run cancelled after {} attempts", completed);
                return LoopResult::cancelled(completed);
            }

            info!("Fix attempt {}/{}", attempt, max_attempts);

            let generated = until_cancelled(
                cancel,
                self.generator
                    .generate(problem, excerpts, history.records()),
            )
            .await;
            let patch = match generated {
                Some(Ok(patch)) => patch,
                Some(Err(e)) => {
                    error!("Patch generation failed on attempt {}: {}", attempt, e);
                    return LoopResult::aborted(
                        completed,
                        AbortCause::Generation(e),
                        history.into_records(),
                    );
                }
                None => return LoopResult::cancelled(completed),
            };

            if let Some(previous) = history.find_repeat(&patch) {
                warn!(
                    "Attempt {} repeats the patch from failed attempt {}",
                    attempt, previous
                );
            }
            debug!(
                "Applying patch to {} ({} bytes)",
                patch.path(),
                patch.content().len()
            );

            match until_cancelled(cancel, env.write_file(patch.path(), patch.content())).await {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    error!("Could not apply patch on attempt {}: {}", attempt, e);
                    return LoopResult::aborted(
                        completed,
                        AbortCause::Environment(e),
                        history.into_records(),
                    );
                }
                None => return LoopResult::cancelled(completed),
            }

            let Some(outcome) = until_cancelled(cancel, env.run(verify_command)).await else {
                return LoopResult::cancelled(completed);
            };

            if outcome.passed {
                info!("Tests passed on attempt {}!", attempt);
                return LoopResult::fixed(attempt, patch, history.into_records());
            }

            warn!(
                "Tests failed (exit {}): {}",
                outcome.exit_code,
                truncate_chars(outcome.stderr.trim(), LOGGED_STDERR_CHARS)
            );

            let diagnosis = match until_cancelled(
                cancel,
                self.diagnoser.diagnose(&patch, &outcome.stderr),
            )
            .await
            {
                Some(Ok(text)) => text.trim().to_string(),
                Some(Err(e)) => {
                    warn!("Diagnosis failed on attempt {}, continuing: {}", attempt, e);
                    String::new()
                }
                None => return LoopResult::cancelled(attempt),
            };
            debug!("Diagnosis: {}", diagnosis);

            history.record(AttemptRecord {
                attempt,
                patch,
                outcome,
                diagnosis,
            });
        }

        error!("Failed after {} attempts", max_attempts);
        LoopResult::exhausted(max_attempts, history.into_records())
    }
}

/// Owns the environment for one run and releases it if the run is dropped
/// before its own `dispose().await`.
struct DisposeGuard<'a> {
    env: &'a mut dyn ExecutionEnvironment,
    armed: bool,
}

impl<'a> DisposeGuard<'a> {
    fn new(env: &'a mut dyn ExecutionEnvironment) -> Self {
        Self { env, armed: true }
    }

    async fn dispose(mut self) {
        self.env.dispose().await;
        self.armed = false;
    }
}

impl Drop for DisposeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("Fix run abandoned; releasing {} sandbox", self.env.name());
            self.env.dispose_now();
        }
    }
}

/// Await `fut` unless `cancel` fires first.
async fn until_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        output = fut => Some(output),
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockEnvironment, ScriptedDiagnoser, ScriptedGenerator};

    fn controller(
        generator: &Arc<ScriptedGenerator>,
        diagnoser: &Arc<ScriptedDiagnoser>,
        max_attempts: u32,
    ) -> FixController {
        FixController::new(
            generator.clone(),
            diagnoser.clone(),
            AttemptBudget::new(max_attempts).unwrap(),
        )
    }

    #[test]
    fn test_attempt_budget_rejects_zero() {
        assert!(matches!(
            AttemptBudget::new(0),
            Err(OssDevError::InvalidConfig { .. })
        ));
        assert_eq!(AttemptBudget::new(3).unwrap().get(), 3);
        assert_eq!(AttemptBudget::default().get(), 5);
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("abcdef", 3), "abc");
        assert_eq!(truncate_chars("ab", 3), "ab");
        assert_eq!(truncate_chars("日本語テキスト", 3), "日本語");
    }

    #[tokio::test]
    async fn test_first_attempt_passes() {
        let generator = Arc::new(ScriptedGenerator::new());
        let diagnoser = Arc::new(ScriptedDiagnoser::new());
        let mut env = MockEnvironment::new().with_pass_on(1);

        let result = controller(&generator, &diagnoser, 5)
            .run(
                &ProblemStatement::new("bug"),
                &[],
                &mut env,
                "make test",
                &CancellationToken::new(),
            )
            .await;

        assert!(result.succeeded());
        assert_eq!(result.attempts, 1);
        assert!(result.history.is_empty());
        assert_eq!(generator.call_count(), 1);
        assert_eq!(diagnoser.call_count(), 0);
        assert_eq!(env.dispose_count(), 1);
        assert_eq!(env.commands(), vec!["make test".to_string()]);
    }

    #[tokio::test]
    async fn test_patch_is_written_before_verification() {
        let generator = Arc::new(ScriptedGenerator::new());
        let diagnoser = Arc::new(ScriptedDiagnoser::new());
        let mut env = MockEnvironment::new().with_pass_on(2);

        let result = controller(&generator, &diagnoser, 3)
            .run(
                &ProblemStatement::new("bug"),
                &[],
                &mut env,
                "pytest",
                &CancellationToken::new(),
            )
            .await;

        assert!(result.succeeded());
        let writes = env.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[1].1, result.winning_patch().unwrap().content());
        assert_eq!(env.file("src/fix.rs").as_deref(), Some(writes[1].1.as_str()));
    }

    #[tokio::test]
    async fn test_diagnosis_is_trimmed_and_threaded() {
        let generator = Arc::new(ScriptedGenerator::new());
        let diagnoser = Arc::new(ScriptedDiagnoser::new().with_diagnosis("  off by one \n"));
        let mut env = MockEnvironment::new().with_pass_on(2);

        controller(&generator, &diagnoser, 2)
            .run(
                &ProblemStatement::new("bug"),
                &[],
                &mut env,
                "pytest",
                &CancellationToken::new(),
            )
            .await;

        let seen = generator.histories();
        assert_eq!(seen[1][0].diagnosis, "off by one");
        assert_eq!(diagnoser.error_texts()[0], env.stderr_for(1));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_disposes() {
        let generator = Arc::new(ScriptedGenerator::new());
        let diagnoser = Arc::new(ScriptedDiagnoser::new());
        let mut env = MockEnvironment::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = controller(&generator, &diagnoser, 3)
            .run(&ProblemStatement::new("bug"), &[], &mut env, "t", &cancel)
            .await;

        assert_eq!(result.status(), "cancelled");
        assert_eq!(result.attempts, 0);
        assert_eq!(generator.call_count(), 0);
        assert_eq!(env.dispose_count(), 1);
    }

    #[tokio::test]
    async fn test_provision_failure_disposes_once() {
        let generator = Arc::new(ScriptedGenerator::new());
        let diagnoser = Arc::new(ScriptedDiagnoser::new());
        let mut env = MockEnvironment::new().with_provision_error("image not found");

        let result = controller(&generator, &diagnoser, 3)
            .provision_and_run(
                &mut env,
                &SourceLocation::Remote("https://github.com/o/r.git".into()),
                &RuntimeDescriptor::default(),
                &ProblemStatement::new("bug"),
                &[],
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(
            result.abort_cause(),
            Some(AbortCause::Environment(_))
        ));
        assert_eq!(result.attempts, 0);
        assert_eq!(generator.call_count(), 0);
        assert_eq!(env.dispose_count(), 1);
    }

    #[tokio::test]
    async fn test_provision_and_run_uses_runtime_test_command() {
        let generator = Arc::new(ScriptedGenerator::new());
        let diagnoser = Arc::new(ScriptedDiagnoser::new());
        let mut env = MockEnvironment::new().with_pass_on(1);
        let runtime = RuntimeDescriptor {
            test_command: "go test ./...".to_string(),
            ..RuntimeDescriptor::default()
        };

        let result = controller(&generator, &diagnoser, 3)
            .provision_and_run(
                &mut env,
                &SourceLocation::Local(std::path::PathBuf::from("/repo")),
                &runtime,
                &ProblemStatement::new("bug"),
                &[],
                &CancellationToken::new(),
            )
            .await;

        assert!(result.succeeded());
        assert_eq!(env.provision_count(), 1);
        assert_eq!(env.dispose_count(), 1);
        assert_eq!(env.commands(), vec!["go test ./...".to_string()]);
    }

    #[tokio::test]
    async fn test_dropped_run_disposes_once() {
        let generator = Arc::new(ScriptedGenerator::new().with_hang_on(2));
        let diagnoser = Arc::new(ScriptedDiagnoser::new());
        let mut env = MockEnvironment::new();
        let controller = controller(&generator, &diagnoser, 3);
        let problem = ProblemStatement::new("bug");
        let cancel = CancellationToken::new();

        let timed_out = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            controller.run(&problem, &[], &mut env, "t", &cancel),
        )
        .await
        .is_err();

        assert!(timed_out);
        assert_eq!(generator.call_count(), 2);
        assert_eq!(env.dispose_count(), 1);
    }

    #[tokio::test]
    async fn test_write_error_aborts_with_environment_cause() {
        let generator = Arc::new(ScriptedGenerator::new());
        let diagnoser = Arc::new(ScriptedDiagnoser::new());
        let mut env = MockEnvironment::new().with_write_error_on(2);

        let result = controller(&generator, &diagnoser, 4)
            .run(
                &ProblemStatement::new("bug"),
                &[],
                &mut env,
                "t",
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(
            result.abort_cause(),
            Some(AbortCause::Environment(_))
        ));
        assert_eq!(result.attempts, 1);
        assert_eq!(result.history.len(), 1);
        assert_eq!(env.commands().len(), 1);
        assert_eq!(env.dispose_count(), 1);
    }
}
