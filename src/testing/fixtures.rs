//! Temporary project trees for stack detection, search and sandbox tests.

use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A temporary project directory, removed on drop.
///
/// # Example
///
/// ```rust,ignore
/// let fixture = ProjectFixture::node_project();
/// assert!(fixture.path().join("package.json").exists());
/// ```
pub struct ProjectFixture {
    temp_dir: TempDir,
}

impl ProjectFixture {
    /// An empty project.
    ///
    /// # Panics
    ///
    /// Panics if temporary directory creation fails.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// A Node project with a failing-looking handler.
    #[must_use]
    pub fn node_project() -> Self {
        Self::empty()
            .with_file(
                "package.json",
                r#"{"name": "demo", "scripts": {"test": "node test.js"}}"#,
            )
            .with_file(
                "src/login.js",
                "function handleLogin(user) {\n  return user.name;\n}\nmodule.exports = { handleLogin };\n",
            )
    }

    /// A Go project nested under `backend/`.
    #[must_use]
    pub fn go_backend_project() -> Self {
        Self::empty()
            .with_file("backend/go.mod", "module example.com/demo\n\ngo 1.21\n")
            .with_file("backend/main.go", "package main\n\nfunc main() {}\n")
    }

    /// Add a file, creating parent directories.
    ///
    /// # Panics
    ///
    /// Panics if the file cannot be written.
    #[must_use]
    pub fn with_file(self, relative: &str, content: &str) -> Self {
        let path = self.temp_dir.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent directory");
        }
        std::fs::write(&path, content).expect("Failed to write fixture file");
        self
    }

    /// Root of the project.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Absolute path of a file inside the project.
    #[must_use]
    pub fn file(&self, relative: &str) -> PathBuf {
        self.temp_dir.path().join(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_project_layout() {
        let fixture = ProjectFixture::node_project();
        assert!(fixture.file("package.json").is_file());
        assert!(fixture.file("src/login.js").is_file());
    }

    #[test]
    fn test_with_file_creates_parents() {
        let fixture = ProjectFixture::empty().with_file("a/b/c.txt", "x");
        assert_eq!(std::fs::read_to_string(fixture.file("a/b/c.txt")).unwrap(), "x");
    }
}
