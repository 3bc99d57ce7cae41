//! Search planning: which patterns to grep for, given a problem.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::fix::ProblemStatement;
use crate::llm::{run_json_prompt, LlmClient};
use crate::stack::StackLanguage;

/// Most queries kept from one plan.
pub const MAX_QUERIES: usize = 5;

/// One code search to run against the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    /// Regular expression passed to ripgrep.
    pub pattern: String,
    /// File extension filter, e.g. `jsx`.
    #[serde(default)]
    pub file_type: Option<String>,
    /// Lines of context around each match.
    #[serde(default)]
    pub context_lines: Option<u32>,
    /// Why the query is expected to help.
    #[serde(default)]
    pub reason: String,
}

impl SearchQuery {
    /// A literal search for `term`.
    #[must_use]
    pub fn literal(term: &str, reason: impl Into<String>) -> Self {
        Self {
            pattern: regex::escape(term),
            file_type: None,
            context_lines: None,
            reason: reason.into(),
        }
    }
}

/// Plans code searches, falling back to the problem's keywords when the
/// model is unavailable.
pub struct Scout {
    client: Arc<dyn LlmClient>,
}

impl Scout {
    #[must_use]
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }

    /// Produce up to [`MAX_QUERIES`] searches for `problem`.
    ///
    /// Never fails: a model error or an empty plan degrades to literal
    /// keyword and mentioned-file searches.
    pub async fn plan_queries(
        &self,
        problem: &ProblemStatement,
        language: StackLanguage,
    ) -> Vec<SearchQuery> {
        info!("Generating search queries...");

        let planned: Vec<SearchQuery> =
            match run_json_prompt(self.client.as_ref(), &build_prompt(problem, language)).await {
                Ok(queries) => queries,
                Err(e) => {
                    warn!("Search planning failed, using issue keywords: {:#}", e);
                    Vec::new()
                }
            };

        let mut queries: Vec<SearchQuery> = planned
            .into_iter()
            .filter(|q| !q.pattern.trim().is_empty())
            .collect();
        if queries.is_empty() {
            queries = fallback_queries(problem);
        }
        queries.truncate(MAX_QUERIES);
        queries
    }
}

fn build_prompt(problem: &ProblemStatement, language: StackLanguage) -> String {
    format!(
        r#"Issue: {}
Issue Keywords: {}
Mentioned Files: {}
Language: {}

Generate 3-5 ripgrep queries to find relevant files.

JSON array:
[
  {{
    "pattern": "LoginButton",
    "fileType": "jsx",
    "contextLines": 20,
    "reason": "Component definition"
  }}
]"#,
        problem.summary,
        problem.keywords.join(", "),
        problem.mentioned_files.join(", "),
        language
    )
}

fn fallback_queries(problem: &ProblemStatement) -> Vec<SearchQuery> {
    let files = problem.mentioned_files.iter().filter_map(|f| {
        let name = f.rsplit('/').next()?.split('.').next()?;
        (!name.is_empty()).then(|| SearchQuery::literal(name, format!("Mentioned file {}", f)))
    });
    let keywords = problem
        .keywords
        .iter()
        .filter(|k| !k.trim().is_empty())
        .map(|k| SearchQuery::literal(k.trim(), "Issue keyword"));
    files.chain(keywords).collect()
}
