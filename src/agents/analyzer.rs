//! Issue analysis: GitHub issue text to a [`ProblemStatement`].

use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

use crate::error::{OssDevError, Result};
use crate::fix::ProblemStatement;
use crate::github::GitHubIssue;
use crate::llm::{run_json_prompt, LlmClient};

/// Characters of issue body sent to the model.
const MAX_BODY_CHARS: usize = 12_000;

/// Extracts a structured problem statement from an issue.
pub struct IssueAnalyzer {
    client: Arc<dyn LlmClient>,
}

impl IssueAnalyzer {
    #[must_use]
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }

    /// Analyze `issue`.
    ///
    /// An empty summary from the model falls back to the issue title.
    ///
    /// # Errors
    ///
    /// Returns [`OssDevError::Analysis`] if the model fails or answers with
    /// something other than the requested JSON object.
    pub async fn analyze(&self, issue: &GitHubIssue) -> Result<ProblemStatement> {
        info!("Analyzing issue #{}...", issue.number);

        let mut problem: ProblemStatement =
            run_json_prompt(self.client.as_ref(), &build_prompt(issue))
                .await
                .map_err(|e| OssDevError::analysis(format!("issue analysis failed: {:#}", e)))?;

        if problem.summary.trim().is_empty() {
            problem.summary = issue.title.clone();
        }
        let mut seen = HashSet::new();
        problem
            .keywords
            .retain(|k| !k.trim().is_empty() && seen.insert(k.clone()));
        Ok(problem)
    }
}

fn build_prompt(issue: &GitHubIssue) -> String {
    let body: String = issue.body.chars().take(MAX_BODY_CHARS).collect();
    format!(
        r#"You are a senior engineer analyzing a bug report.

Issue:
Title: {}
Body: {}
Labels: {}

Extract in JSON:
{{
  "problem": "What's broken? (1-2 sentences)",
  "expected": "Expected behavior",
  "actual": "Actual behavior",
  "keywords": ["relevant", "terms"],
  "mentionedFiles": ["src/file.js"],
  "severity": "low|medium|high",
  "category": "bug|feature|docs"
}}"#,
        issue.title,
        body,
        issue.labels.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    fn issue() -> GitHubIssue {
        GitHubIssue {
            number: 42,
            title: "Login button does nothing".to_string(),
            body: "Clicking login in Safari has no effect.".to_string(),
            labels: vec!["bug".to_string()],
            html_url: String::new(),
        }
    }

    #[tokio::test]
    async fn test_analyze_parses_fenced_json() {
        let client = Arc::new(MockLlmClient::new().with_response(
            "```json\n{\"problem\": \"Login handler never fires\", \"keywords\": [\"handleLogin\", \"\", \"handleLogin\"], \"severity\": \"high\"}\n```",
        ));
        let problem = IssueAnalyzer::new(client.clone()).analyze(&issue()).await.unwrap();
        assert_eq!(problem.summary, "Login handler never fires");
        assert_eq!(problem.keywords, vec!["handleLogin"]);
        assert_eq!(problem.severity.as_deref(), Some("high"));

        let prompt = &client.prompts()[0];
        assert!(prompt.contains("Title: Login button does nothing"));
        assert!(prompt.contains("Labels: bug"));
    }

    #[tokio::test]
    async fn test_analyze_falls_back_to_title() {
        let client = Arc::new(MockLlmClient::new().with_response("{\"keywords\": [\"login\"]}"));
        let problem = IssueAnalyzer::new(client).analyze(&issue()).await.unwrap();
        assert_eq!(problem.summary, "Login button does nothing");
    }

    #[tokio::test]
    async fn test_analyze_drops_repeated_keywords_keeping_order() {
        let client = Arc::new(MockLlmClient::new().with_response(
            "{\"problem\": \"p\", \"keywords\": [\"session\", \"cookie\", \"session\", \"login\", \"cookie\"]}",
        ));
        let problem = IssueAnalyzer::new(client).analyze(&issue()).await.unwrap();
        assert_eq!(problem.keywords, vec!["session", "cookie", "login"]);
    }

    #[tokio::test]
    async fn test_analyze_rejects_prose() {
        let client = Arc::new(MockLlmClient::new().with_response("I could not parse that issue."));
        let err = IssueAnalyzer::new(client).analyze(&issue()).await.unwrap_err();
        assert!(matches!(err, OssDevError::Analysis { .. }));
    }
}
