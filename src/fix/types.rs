//! Value types that flow through the fix loop.
//!
//! Everything here is produced once and never mutated afterwards: a failed
//! [`CandidatePatch`] is superseded by the next attempt's patch, not edited.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::agents::GenerationError;
use crate::sandbox::SandboxError;

/// Exit code reported when the verification command could not be launched.
pub const LAUNCH_FAILED_EXIT_CODE: i32 = -1;

/// Exit code reported when the verification command exceeded its timeout.
pub const TIMED_OUT_EXIT_CODE: i32 = -2;

/// Normalized description of the defect being fixed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProblemStatement {
    /// What is broken, in one or two sentences.
    #[serde(alias = "problem")]
    pub summary: String,
    /// Expected behavior.
    pub expected: String,
    /// Observed behavior.
    pub actual: String,
    /// Terms worth searching the code base for.
    pub keywords: Vec<String>,
    /// Files the reporter mentioned explicitly.
    pub mentioned_files: Vec<String>,
    /// Reporter-facing severity (`low`, `medium`, `high`).
    pub severity: Option<String>,
    /// Issue category (`bug`, `feature`, `docs`).
    pub category: Option<String>,
}

impl ProblemStatement {
    /// Create a statement with only a summary.
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Self::default()
        }
    }

    /// Set expected and actual behavior.
    #[must_use]
    pub fn with_behavior(mut self, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        self.expected = expected.into();
        self.actual = actual.into();
        self
    }

    /// Set the keyword list.
    #[must_use]
    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }
}

/// A located slice of source code believed relevant to the defect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeExcerpt {
    /// Path relative to the repository root.
    pub path: String,
    /// The excerpt text, including context lines.
    pub content: String,
    /// First line covered (1-based).
    pub start_line: u64,
    /// Last line covered (1-based, inclusive).
    pub end_line: u64,
    /// Relevance indicator in `0.0..=1.0`.
    pub relevance: f32,
}

impl CodeExcerpt {
    /// Create an excerpt with full relevance and unknown line span.
    #[must_use]
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            start_line: 0,
            end_line: 0,
            relevance: 1.0,
        }
    }

    /// Set the covered line span.
    #[must_use]
    pub fn with_lines(mut self, start_line: u64, end_line: u64) -> Self {
        self.start_line = start_line;
        self.end_line = end_line;
        self
    }
}

/// A file-level patch: the full replacement content of one file.
///
/// Fields are private so a patch cannot be edited once generated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePatch {
    path: String,
    content: String,
}

impl CandidatePatch {
    /// Create a patch targeting `path` (relative to the workspace root).
    #[must_use]
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }

    /// Target file path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Full new file content.
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Hex SHA-256 over path and content, used to spot repeated patches.
    #[must_use]
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.path.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.content.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Result of running the verification command once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    /// Whether the command exited with status 0.
    pub passed: bool,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Process exit code, or one of the sentinel codes.
    pub exit_code: i32,
    /// Wall-clock time spent.
    pub duration: Duration,
}

impl VerificationOutcome {
    /// Build an outcome from a finished process.
    #[must_use]
    pub fn from_exit(
        exit_code: i32,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            passed: exit_code == 0,
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
            duration,
        }
    }

    /// Outcome for a command that could not be started at all.
    #[must_use]
    pub fn launch_failure(message: impl Into<String>, duration: Duration) -> Self {
        Self {
            passed: false,
            stdout: String::new(),
            stderr: message.into(),
            exit_code: LAUNCH_FAILED_EXIT_CODE,
            duration,
        }
    }

    /// Outcome for a command killed after exceeding its timeout.
    #[must_use]
    pub fn timed_out(timeout: Duration) -> Self {
        Self {
            passed: false,
            stdout: String::new(),
            stderr: format!("verification timed out after {}s", timeout.as_secs()),
            exit_code: TIMED_OUT_EXIT_CODE,
            duration: timeout,
        }
    }
}

/// One failed attempt, as remembered by the loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt index.
    pub attempt: u32,
    /// The patch that was tried.
    pub patch: CandidatePatch,
    /// What the verification command reported.
    pub outcome: VerificationOutcome,
    /// Advisory explanation; empty when the diagnoser failed.
    pub diagnosis: String,
}

/// Why a run stopped before it could finish its attempts.
#[derive(Debug)]
pub enum AbortCause {
    /// The patch generator failed.
    Generation(GenerationError),
    /// Provisioning or writing to the environment failed.
    Environment(SandboxError),
}

impl std::fmt::Display for AbortCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generation(e) => write!(f, "patch generation failed: {}", e),
            Self::Environment(e) => write!(f, "execution environment failed: {}", e),
        }
    }
}

/// Terminal state of a fix run.
#[derive(Debug)]
pub enum LoopOutcome {
    /// Verification passed with this patch.
    Fixed(CandidatePatch),
    /// Every attempt was spent without a passing verification.
    Exhausted,
    /// The run could not continue.
    Aborted(AbortCause),
    /// The caller cancelled the run.
    Cancelled,
}

/// The single value produced by one controller invocation.
#[derive(Debug)]
pub struct LoopResult {
    /// Attempts that completed verification.
    pub attempts: u32,
    /// How the run ended.
    pub outcome: LoopOutcome,
    /// Every failed attempt in order. Empty after cancellation.
    pub history: Vec<AttemptRecord>,
}

impl LoopResult {
    pub(crate) fn fixed(attempts: u32, patch: CandidatePatch, history: Vec<AttemptRecord>) -> Self {
        Self {
            attempts,
            outcome: LoopOutcome::Fixed(patch),
            history,
        }
    }

    pub(crate) fn exhausted(attempts: u32, history: Vec<AttemptRecord>) -> Self {
        Self {
            attempts,
            outcome: LoopOutcome::Exhausted,
            history,
        }
    }

    pub(crate) fn aborted(attempts: u32, cause: AbortCause, history: Vec<AttemptRecord>) -> Self {
        Self {
            attempts,
            outcome: LoopOutcome::Aborted(cause),
            history,
        }
    }

    pub(crate) fn cancelled(attempts: u32) -> Self {
        Self {
            attempts,
            outcome: LoopOutcome::Cancelled,
            history: Vec::new(),
        }
    }

    /// Whether a verified patch was found.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, LoopOutcome::Fixed(_))
    }

    /// The verified patch, if any.
    #[must_use]
    pub fn winning_patch(&self) -> Option<&CandidatePatch> {
        match &self.outcome {
            LoopOutcome::Fixed(patch) => Some(patch),
            _ => None,
        }
    }

    /// The abort cause, if the run could not continue.
    #[must_use]
    pub fn abort_cause(&self) -> Option<&AbortCause> {
        match &self.outcome {
            LoopOutcome::Aborted(cause) => Some(cause),
            _ => None,
        }
    }

    /// Short status label used in reports.
    #[must_use]
    pub fn status(&self) -> &'static str {
        match self.outcome {
            LoopOutcome::Fixed(_) => "fixed",
            LoopOutcome::Exhausted => "exhausted",
            LoopOutcome::Aborted(_) => "aborted",
            LoopOutcome::Cancelled => "cancelled",
        }
    }
}
