//! Testing infrastructure for oss-dev.
//!
//! Test doubles for the fix loop's three collaborators, plus assertions and
//! project fixtures, so the controller can be exercised without a container
//! runtime or a language model.
//!
//! # Example
//!
//! ```rust,ignore
//! use ossdev::testing::{MockEnvironment, ScriptedDiagnoser, ScriptedGenerator};
//!
//! let generator = ScriptedGenerator::new().with_error_on(2, "no File: line");
//! let diagnoser = ScriptedDiagnoser::new().with_diagnosis("wrong branch");
//! let env = MockEnvironment::new().with_pass_on(3);
//! ```

pub mod assertions;
#[cfg(test)]
pub mod fixtures;
pub mod mocks;

pub use assertions::*;
#[cfg(test)]
pub use fixtures::*;
pub use mocks::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{FailureDiagnoser, PatchGenerator};
    use crate::fix::{CandidatePatch, ProblemStatement};
    use crate::sandbox::{ExecutionEnvironment, SandboxError};

    #[tokio::test]
    async fn test_scripted_generator_distinct_patches() {
        let generator = ScriptedGenerator::new();
        let problem = ProblemStatement::new("bug");
        let first = generator.generate(&problem, &[], &[]).await.unwrap();
        let second = generator.generate(&problem, &[], &[]).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(first.path(), "src/fix.rs");
        assert_eq!(generator.call_count(), 2);
    }

    #[tokio::test]
    async fn test_scripted_generator_error_on_call() {
        let generator = ScriptedGenerator::new().with_error_on(2, "garbage");
        let problem = ProblemStatement::new("bug");
        assert!(generator.generate(&problem, &[], &[]).await.is_ok());
        assert!(generator.generate(&problem, &[], &[]).await.is_err());
        assert!(generator.generate(&problem, &[], &[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_scripted_diagnoser_records_error_text() {
        let diagnoser = ScriptedDiagnoser::new().with_diagnosis("null check missing");
        let patch = CandidatePatch::new("a.js", "x");
        let text = diagnoser.diagnose(&patch, "TypeError").await.unwrap();
        assert_eq!(text, "null check missing");
        assert_eq!(diagnoser.error_texts(), vec!["TypeError".to_string()]);

        let failing = ScriptedDiagnoser::new().with_error("rate limited");
        assert!(failing.diagnose(&patch, "x").await.is_err());
        assert_eq!(failing.call_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_environment_pass_on() {
        let mut env = MockEnvironment::new().with_pass_on(2);
        let first = env.run("npm test").await;
        let second = env.run("npm test").await;
        assert!(!first.passed);
        assert_eq!(first.stderr, env.stderr_for(1));
        assert!(second.passed);
    }

    #[tokio::test]
    async fn test_mock_environment_rejects_escaping_paths() {
        let mut env = MockEnvironment::new();
        assert!(matches!(
            env.write_file("../etc/passwd", "x").await,
            Err(SandboxError::Write { .. })
        ));
        assert!(env.writes().is_empty());
    }
}
