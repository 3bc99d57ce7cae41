//! oss-dev - autonomous single-issue fixer
//!
//! Takes a GitHub issue, locates the relevant code, and iterates on
//! candidate patches inside a disposable sandbox until the project's own
//! test suite passes or the attempt budget runs out.
//!
//! # Architecture
//!
//! - [`fix`] - The bounded generate / verify / diagnose loop
//! - [`agents`] - Patch generation, diagnosis, issue analysis, search planning
//! - [`sandbox`] - Execution environments (container, host directory)
//! - [`llm`] - Model clients and the cost ledger
//! - [`github`] - Issue retrieval and cloning
//! - [`search`] - Ripgrep-backed code location
//! - [`stack`] - Project language and command detection
//! - [`config`] - Layered settings
//! - [`workflow`] - The end-to-end pipeline
//! - [`testing`] - Mocks and assertions for the loop
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ossdev::fix::{AttemptBudget, FixController, ProblemStatement};
//! use ossdev::testing::{MockEnvironment, ScriptedDiagnoser, ScriptedGenerator};
//! use tokio_util::sync::CancellationToken;
//!
//! let controller = FixController::new(
//!     Arc::new(ScriptedGenerator::new()),
//!     Arc::new(ScriptedDiagnoser::new()),
//!     AttemptBudget::new(5)?,
//! );
//! let mut env = MockEnvironment::new().with_pass_on(3);
//! let result = controller
//!     .run(&ProblemStatement::new("login fails"), &[], &mut env, "npm test", &CancellationToken::new())
//!     .await;
//! assert!(result.succeeded());
//! ```

pub mod agents;
pub mod config;
pub mod error;
pub mod fix;
pub mod github;
pub mod llm;
pub mod sandbox;
pub mod search;
pub mod stack;
pub mod testing;
pub mod workflow;

// Re-export commonly used types
pub use error::{OssDevError, Result};

pub use config::Settings;

pub use fix::{
    AbortCause, AttemptBudget, AttemptRecord, CandidatePatch, CodeExcerpt, FixController,
    LoopOutcome, LoopResult, ProblemStatement, VerificationOutcome,
};

pub use agents::{FailureDiagnoser, GenerationError, PatchGenerator};

pub use sandbox::{ExecutionEnvironment, SandboxBackend, SandboxError, SourceLocation};

pub use stack::{detect_stack, RuntimeDescriptor, StackLanguage};

pub use workflow::{run_fix_workflow, FixWorkflow, WorkflowOptions, WorkflowResult, WorkflowStatus};
