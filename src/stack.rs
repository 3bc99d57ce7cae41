//! Stack detection.
//!
//! A pure classifier: looks for well-known manifest files and returns the
//! container image plus the install and test commands for the project.
//! Root manifests win over manifests in common monorepo subdirectories.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{OssDevError, Result};

/// Subdirectories searched when the root holds no manifest.
const SUBPROJECT_DIRS: &[&str] = &["backend", "server", "api", "src"];

/// Languages the detector can classify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StackLanguage {
    #[default]
    JavaScript,
    Go,
    Python,
    Rust,
}

impl StackLanguage {
    /// Lowercase identifier, also used as the search file-type hint.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::JavaScript => "javascript",
            Self::Go => "go",
            Self::Python => "python",
            Self::Rust => "rust",
        }
    }
}

impl std::fmt::Display for StackLanguage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to provision and verify a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RuntimeDescriptor {
    /// Primary language.
    pub language: StackLanguage,
    /// Container image / runtime identifier.
    pub runtime: String,
    /// Package manager name.
    pub package_manager: String,
    /// Command that installs dependencies.
    pub install_command: String,
    /// Command that runs the test suite; used verbatim for verification.
    pub test_command: String,
}

impl RuntimeDescriptor {
    fn for_language(language: StackLanguage, subdir: Option<&str>) -> Self {
        let (runtime, package_manager, install, test) = match language {
            StackLanguage::JavaScript => ("node:20", "npm", "npm install", "npm test"),
            StackLanguage::Go => ("golang:1.21", "go", "go mod download", "go test ./..."),
            StackLanguage::Python => (
                "python:3.11",
                "pip",
                "pip install -r requirements.txt",
                "pytest",
            ),
            StackLanguage::Rust => ("rust:latest", "cargo", "cargo build", "cargo test"),
        };
        let prefixed = |cmd: &str| match subdir {
            Some(dir) => format!("cd {} && {}", dir, cmd),
            None => cmd.to_string(),
        };
        Self {
            language,
            runtime: runtime.to_string(),
            package_manager: package_manager.to_string(),
            install_command: prefixed(install),
            test_command: prefixed(test),
        }
    }
}

/// Classify the project rooted at `repo_path`.
///
/// # Errors
///
/// Returns [`OssDevError::Stack`] when no supported manifest is found.
pub fn detect_stack(repo_path: &Path) -> Result<RuntimeDescriptor> {
    let root_order = [
        ("package.json", StackLanguage::JavaScript),
        ("go.mod", StackLanguage::Go),
        ("requirements.txt", StackLanguage::Python),
        ("Cargo.toml", StackLanguage::Rust),
    ];
    for (manifest, language) in root_order {
        if repo_path.join(manifest).is_file() {
            return Ok(RuntimeDescriptor::for_language(language, None));
        }
    }

    let subdir_order = [
        ("go.mod", StackLanguage::Go),
        ("package.json", StackLanguage::JavaScript),
        ("requirements.txt", StackLanguage::Python),
    ];
    for dir in SUBPROJECT_DIRS {
        let sub = repo_path.join(dir);
        if !sub.is_dir() {
            continue;
        }
        for (manifest, language) in subdir_order {
            if sub.join(manifest).is_file() {
                return Ok(RuntimeDescriptor::for_language(language, Some(dir)));
            }
        }
    }

    Err(OssDevError::Stack {
        path: repo_path.to_path_buf(),
        reason: "unsupported language (no known manifest found)".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, rel: &str) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, "").unwrap();
    }

    #[test]
    fn test_detects_root_manifests() {
        let cases = [
            ("package.json", StackLanguage::JavaScript, "npm test"),
            ("go.mod", StackLanguage::Go, "go test ./..."),
            ("requirements.txt", StackLanguage::Python, "pytest"),
            ("Cargo.toml", StackLanguage::Rust, "cargo test"),
        ];
        for (manifest, language, test_command) in cases {
            let dir = TempDir::new().unwrap();
            touch(dir.path(), manifest);
            let stack = detect_stack(dir.path()).unwrap();
            assert_eq!(stack.language, language, "manifest {}", manifest);
            assert_eq!(stack.test_command, test_command);
        }
    }

    #[test]
    fn test_package_json_wins_over_cargo_toml() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "Cargo.toml");
        touch(dir.path(), "package.json");
        assert_eq!(
            detect_stack(dir.path()).unwrap().language,
            StackLanguage::JavaScript
        );
    }

    #[test]
    fn test_subdirectory_commands_are_prefixed() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "backend/go.mod");
        let stack = detect_stack(dir.path()).unwrap();
        assert_eq!(stack.language, StackLanguage::Go);
        assert_eq!(stack.runtime, "golang:1.21");
        assert_eq!(stack.install_command, "cd backend && go mod download");
        assert_eq!(stack.test_command, "cd backend && go test ./...");
    }

    #[test]
    fn test_root_manifest_beats_subdirectory() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "requirements.txt");
        touch(dir.path(), "server/package.json");
        let stack = detect_stack(dir.path()).unwrap();
        assert_eq!(stack.language, StackLanguage::Python);
        assert_eq!(stack.test_command, "pytest");
    }

    #[test]
    fn test_fixture_projects() {
        let node = crate::testing::ProjectFixture::node_project();
        assert_eq!(detect_stack(node.path()).unwrap().test_command, "npm test");

        let go = crate::testing::ProjectFixture::go_backend_project();
        let stack = detect_stack(go.path()).unwrap();
        assert_eq!(stack.language, StackLanguage::Go);
        assert_eq!(stack.test_command, "cd backend && go test ./...");
    }

    #[test]
    fn test_unsupported_project() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "README.md");
        let err = detect_stack(dir.path()).unwrap_err();
        assert!(matches!(err, OssDevError::Stack { .. }));
        assert!(err.to_string().contains("unsupported"));
    }
}
