//! The engineer agent: writes candidate patches and explains failed ones.

use async_trait::async_trait;
use regex::Regex;
use std::fmt::Write as _;
use std::sync::{Arc, LazyLock};
use tracing::debug;

use super::{FailureDiagnoser, GenerationError, PatchGenerator};
use crate::fix::{AttemptRecord, CandidatePatch, CodeExcerpt, ProblemStatement};
use crate::llm::{LlmClient, UsageLedger};
use crate::sandbox::process::tail;

/// Characters of test output repeated back to the model per failed attempt.
const HISTORY_OUTPUT_CHARS: usize = 2_000;

/// Characters of test output sent with a diagnosis request.
const DIAGNOSIS_OUTPUT_CHARS: usize = 4_000;

/// Patch generator and failure diagnoser backed by an [`LlmClient`].
///
/// The model answers with the full replacement content of a single file:
///
/// ````text
/// File: src/login.js
/// ```js
/// ...
/// ```
/// ````
pub struct Engineer {
    client: Arc<dyn LlmClient>,
    budget: Option<(Arc<UsageLedger>, f64)>,
    project_map: Option<String>,
}

impl Engineer {
    /// Create an engineer with no spending limit.
    #[must_use]
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            budget: None,
            project_map: None,
        }
    }

    /// Include a directory listing of the repository in every fix prompt.
    #[must_use]
    pub fn with_project_map(mut self, map: impl Into<String>) -> Self {
        let map = map.into();
        self.project_map = (!map.trim().is_empty()).then_some(map);
        self
    }

    /// Refuse to call the model once `ledger` has reached `max_cost_usd`.
    #[must_use]
    pub fn with_budget(mut self, ledger: Arc<UsageLedger>, max_cost_usd: f64) -> Self {
        self.budget = Some((ledger, max_cost_usd));
        self
    }

    fn check_budget(&self) -> Result<(), GenerationError> {
        match &self.budget {
            Some((ledger, budget)) if ledger.exceeds(*budget) => {
                Err(GenerationError::BudgetExceeded {
                    spent: ledger.total_cost(),
                    budget: *budget,
                })
            }
            _ => Ok(()),
        }
    }
}

/// Build the patch-generation prompt.
pub fn build_fix_prompt(
    problem: &ProblemStatement,
    excerpts: &[CodeExcerpt],
    history: &[AttemptRecord],
    project_map: Option<&str>,
) -> String {
    let mut prompt = String::from("You are a senior developer fixing a bug.\n\n");

    let _ = writeln!(prompt, "Issue: {}", problem.summary);
    if !problem.expected.is_empty() {
        let _ = writeln!(prompt, "Expected: {}", problem.expected);
    }
    if !problem.actual.is_empty() {
        let _ = writeln!(prompt, "Actual: {}", problem.actual);
    }

    if let Some(map) = project_map {
        let _ = writeln!(prompt, "\nProject layout:\n```\n{}\n```", map);
    }

    prompt.push_str("\nRelevant Code:\n");
    if excerpts.is_empty() {
        prompt.push_str("(no code located; infer the file from the issue)\n");
    }
    for excerpt in excerpts {
        if excerpt.start_line > 0 {
            let _ = writeln!(
                prompt,
                "File: {} (lines {}-{})",
                excerpt.path, excerpt.start_line, excerpt.end_line
            );
        } else {
            let _ = writeln!(prompt, "File: {}", excerpt.path);
        }
        let _ = writeln!(prompt, "```\n{}\n```\n", excerpt.content.trim_end());
    }

    if !history.is_empty() {
        prompt.push_str("\nPrevious attempts failed. Do not repeat them:\n");
        for record in history {
            let output = if record.outcome.stderr.trim().is_empty() {
                &record.outcome.stdout
            } else {
                &record.outcome.stderr
            };
            let _ = writeln!(
                prompt,
                "\nAttempt {} rewrote {}:\n```\n{}\n```",
                record.attempt,
                record.patch.path(),
                record.patch.content().trim_end()
            );
            let _ = writeln!(
                prompt,
                "Tests failed (exit {}):\n```\n{}\n```",
                record.outcome.exit_code,
                tail(output.trim(), HISTORY_OUTPUT_CHARS)
            );
            if !record.diagnosis.is_empty() {
                let _ = writeln!(prompt, "Diagnosis: {}", record.diagnosis);
            }
        }
    }

    prompt.push_str(
        "\nGenerate the FIXED code. Respond with the complete new content of ONE file:\n\
         File: <filepath>\n```\n<fixed code>\n```",
    );
    prompt
}

static FILE_LINE_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"File:\s*(.+)"));
static CODE_FENCE_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"(?s)```[^\n]*\n(.*?)```"));

/// Extract the `File:` line and the fenced block that follows it.
///
/// # Errors
///
/// Returns [`GenerationError::MalformedResponse`] when either part is missing.
pub fn parse_fix_response(response: &str) -> Result<CandidatePatch, GenerationError> {
    let file_re = FILE_LINE_RE
        .as_ref()
        .map_err(|e| GenerationError::malformed(e.to_string()))?;
    let code_re = CODE_FENCE_RE
        .as_ref()
        .map_err(|e| GenerationError::malformed(e.to_string()))?;

    let file_match = file_re
        .captures(response)
        .and_then(|c| c.get(1))
        .ok_or_else(|| GenerationError::malformed("response has no `File:` line"))?;

    let path = file_match
        .as_str()
        .trim()
        .trim_matches(|c: char| c == '`' || c == '*' || c == '"' || c.is_whitespace())
        .trim_start_matches("./")
        .to_string();
    if path.is_empty() {
        return Err(GenerationError::malformed("`File:` line names no path"));
    }

    let content = code_re
        .captures(&response[file_match.end()..])
        .and_then(|c| c.get(1))
        .ok_or_else(|| GenerationError::malformed("response has no fenced code block"))?
        .as_str();

    let mut content = content.trim_end().to_string();
    content.push('\n');
    Ok(CandidatePatch::new(path, content))
}

/// Build the one-sentence diagnosis prompt.
pub fn build_diagnosis_prompt(patch: &CandidatePatch, error_text: &str) -> String {
    format!(
        "Test failed with this error:\n\n```\n{}\n```\n\n\
         The code I wrote for {} was:\n```\n{}\n```\n\n\
         In ONE sentence, explain why this failed and what needs to change.\n\
         Be specific and actionable.",
        tail(error_text.trim(), DIAGNOSIS_OUTPUT_CHARS),
        patch.path(),
        patch.content().trim_end()
    )
}

#[async_trait]
impl PatchGenerator for Engineer {
    async fn generate(
        &self,
        problem: &ProblemStatement,
        excerpts: &[CodeExcerpt],
        history: &[AttemptRecord],
    ) -> Result<CandidatePatch, GenerationError> {
        self.check_budget()?;
        let prompt = build_fix_prompt(problem, excerpts, history, self.project_map.as_deref());
        debug!(
            "Requesting patch from {} ({} excerpts, {} prior failures)",
            self.client.model_name(),
            excerpts.len(),
            history.len()
        );
        let response = self
            .client
            .run_prompt(&prompt)
            .await
            .map_err(|e| GenerationError::backend(format!("{:#}", e)))?;
        parse_fix_response(&response)
    }
}

#[async_trait]
impl FailureDiagnoser for Engineer {
    async fn diagnose(&self, patch: &CandidatePatch, error_text: &str) -> anyhow::Result<String> {
        self.check_budget()?;
        let response = self
            .client
            .run_prompt(&build_diagnosis_prompt(patch, error_text))
            .await?;
        Ok(response.trim().to_string())
    }
}
