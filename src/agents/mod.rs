//! LLM-backed collaborators of the fix loop.
//!
//! - [`PatchGenerator`] / [`FailureDiagnoser`] - the two narrow contracts the
//!   controller depends on
//! - [`Engineer`] - implements both over an [`LlmClient`](crate::llm::LlmClient)
//! - [`IssueAnalyzer`] - turns a GitHub issue into a [`ProblemStatement`]
//! - [`Scout`] - plans code searches for a problem

pub mod analyzer;
pub mod engineer;
pub mod scout;

pub use analyzer::IssueAnalyzer;
pub use engineer::Engineer;
pub use scout::{Scout, SearchQuery};

use async_trait::async_trait;
use thiserror::Error;

use crate::fix::{AttemptRecord, CandidatePatch, CodeExcerpt, ProblemStatement};

/// Patch generation failed; fatal to a fix run.
#[derive(Error, Debug)]
pub enum GenerationError {
    /// The text-generation backend failed.
    #[error("generation backend failed: {message}")]
    Backend { message: String },

    /// The response did not contain a usable patch.
    #[error("malformed patch response: {reason}")]
    MalformedResponse { reason: String },

    /// The configured spending limit was reached.
    #[error("cost budget exhausted: ${spent:.4} of ${budget:.2}")]
    BudgetExceeded { spent: f64, budget: f64 },
}

impl GenerationError {
    /// Create a backend error
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Create a malformed response error
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            reason: reason.into(),
        }
    }
}

/// Produces one candidate patch per call.
///
/// `history` holds every failed attempt so far, oldest first, including the
/// patch content that was tried, so implementations can avoid repeating an
/// approach that already failed.
#[async_trait]
pub trait PatchGenerator: Send + Sync {
    /// Generate the next candidate patch.
    ///
    /// # Errors
    ///
    /// Returns a [`GenerationError`] if no usable patch could be produced.
    async fn generate(
        &self,
        problem: &ProblemStatement,
        excerpts: &[CodeExcerpt],
        history: &[AttemptRecord],
    ) -> Result<CandidatePatch, GenerationError>;
}

/// Explains a verification failure. Advisory only.
#[async_trait]
pub trait FailureDiagnoser: Send + Sync {
    /// Produce a short causal explanation of why `patch` failed.
    ///
    /// # Errors
    ///
    /// Any error; callers substitute an empty diagnosis.
    async fn diagnose(&self, patch: &CandidatePatch, error_text: &str) -> anyhow::Result<String>;
}
