//! Ripgrep-backed code search.
//!
//! Runs `rg --json` and folds each file's begin/match/context/end events
//! into one [`CodeExcerpt`].

use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{OssDevError, Result};
use crate::fix::CodeExcerpt;

/// Lines kept per excerpt; matches past this are dropped.
const MAX_EXCERPT_LINES: usize = 400;

#[derive(Debug, Deserialize)]
struct RgText {
    text: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RgData {
    path: Option<RgText>,
    lines: Option<RgText>,
    line_number: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RgEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: RgData,
}

struct PendingExcerpt {
    path: String,
    content: String,
    start_line: u64,
    end_line: u64,
    lines: usize,
}

impl PendingExcerpt {
    fn finish(self) -> Option<CodeExcerpt> {
        (!self.content.is_empty())
            .then(|| CodeExcerpt::new(self.path, self.content).with_lines(self.start_line, self.end_line))
    }
}

/// Parse `rg --json` output.
///
/// Lines that are not valid JSON are skipped with a warning; lines with
/// non-UTF-8 content carry no text and are ignored.
pub fn parse_rg_json(output: &str) -> Vec<CodeExcerpt> {
    let mut excerpts = Vec::new();
    let mut current: Option<PendingExcerpt> = None;

    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let event: RgEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                warn!("Failed to parse ripgrep JSON line: {}", e);
                continue;
            }
        };

        match event.kind.as_str() {
            "begin" => {
                let path = event
                    .data
                    .path
                    .and_then(|p| p.text)
                    .unwrap_or_default();
                current = Some(PendingExcerpt {
                    path: path.trim_start_matches("./").to_string(),
                    content: String::new(),
                    start_line: 0,
                    end_line: 0,
                    lines: 0,
                });
            }
            "match" | "context" => {
                let (Some(pending), Some(text)) =
                    (current.as_mut(), event.data.lines.and_then(|l| l.text))
                else {
                    continue;
                };
                if pending.lines >= MAX_EXCERPT_LINES {
                    continue;
                }
                let line_number = event.data.line_number.unwrap_or(0);
                if pending.start_line == 0 {
                    pending.start_line = line_number;
                }
                pending.end_line = line_number;
                pending.content.push_str(&text);
                pending.lines += 1;
            }
            "end" => {
                if let Some(excerpt) = current.take().and_then(PendingExcerpt::finish) {
                    excerpts.push(excerpt);
                }
            }
            _ => {}
        }
    }

    excerpts
}

/// Runs `rg` in a repository.
#[derive(Debug, Clone)]
pub struct RipgrepSearch {
    binary: String,
    timeout: Duration,
}

impl Default for RipgrepSearch {
    fn default() -> Self {
        Self::new()
    }
}

impl RipgrepSearch {
    #[must_use]
    pub fn new() -> Self {
        Self {
            binary: "rg".to_string(),
            timeout: Duration::from_secs(60),
        }
    }

    /// Use a different ripgrep binary.
    #[must_use]
    pub fn with_binary(mut self, binary: &str) -> Self {
        self.binary = binary.to_string();
        self
    }

    /// Set the per-search timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Search `repo` for `pattern`.
    ///
    /// `file_type` is an extension (`jsx`, `.go`); no match is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`OssDevError::Search`] if `rg` cannot run, times out, or
    /// rejects the pattern.
    pub async fn search(
        &self,
        pattern: &str,
        repo: &Path,
        file_type: Option<&str>,
        context_lines: u32,
    ) -> Result<Vec<CodeExcerpt>> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["--json", "--context", &context_lines.to_string()]);
        if let Some(ext) = file_type.map(|t| t.trim().trim_start_matches("*.").trim_start_matches('.')) {
            if !ext.is_empty() {
                cmd.args(["-g", &format!("*.{}", ext)]);
            }
        }
        cmd.args(["-e", pattern, "."])
            .current_dir(repo)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!("rg -e {:?} (type {:?}, context {})", pattern, file_type, context_lines);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| OssDevError::Search {
                message: format!("rg timed out after {}s", self.timeout.as_secs()),
            })?
            .map_err(|e| OssDevError::Search {
                message: format!("failed to run {}: {}", self.binary, e),
            })?;

        match output.status.code() {
            Some(0) => Ok(parse_rg_json(&String::from_utf8_lossy(&output.stdout))),
            Some(1) => Ok(Vec::new()),
            code => Err(OssDevError::Search {
                message: format!(
                    "rg exited with {:?} for pattern {:?}: {}",
                    code,
                    pattern,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RG_OUTPUT: &str = r#"{"type":"begin","data":{"path":{"text":"./src/login.js"}}}
{"type":"context","data":{"path":{"text":"./src/login.js"},"lines":{"text":"function handleLogin(user) {\n"},"line_number":1,"absolute_offset":0,"submatches":[]}}
{"type":"match","data":{"path":{"text":"./src/login.js"},"lines":{"text":"  return user.name;\n"},"line_number":2,"absolute_offset":28,"submatches":[{"match":{"text":"user.name"},"start":9,"end":18}]}}
{"type":"end","data":{"path":{"text":"./src/login.js"},"binary_offset":null,"stats":{}}}
{"type":"begin","data":{"path":{"text":"lib/util.js"}}}
{"type":"match","data":{"path":{"text":"lib/util.js"},"lines":{"text":"user.name = x;\n"},"line_number":40}}
{"type":"end","data":{"path":{"text":"lib/util.js"}}}
{"data":{"elapsed_total":{"human":"0.01s"}},"type":"summary"}"#;

    #[test]
    fn test_parse_rg_json_folds_events() {
        let excerpts = parse_rg_json(RG_OUTPUT);
        assert_eq!(excerpts.len(), 2);
        assert_eq!(excerpts[0].path, "src/login.js");
        assert_eq!(excerpts[0].start_line, 1);
        assert_eq!(excerpts[0].end_line, 2);
        assert_eq!(
            excerpts[0].content,
            "function handleLogin(user) {\n  return user.name;\n"
        );
        assert_eq!(excerpts[1].path, "lib/util.js");
        assert_eq!(excerpts[1].start_line, 40);
        assert!((excerpts[1].relevance - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_parse_rg_json_skips_garbage() {
        let output = format!("not json\n{}\n{{\"type\":\"match\"", RG_OUTPUT);
        assert_eq!(parse_rg_json(&output).len(), 2);
    }

    #[test]
    fn test_parse_rg_json_drops_empty_files() {
        let output = r#"{"type":"begin","data":{"path":{"text":"a.bin"}}}
{"type":"match","data":{"lines":{"bytes":"AAEC"},"line_number":1}}
{"type":"end","data":{"path":{"text":"a.bin"}}}"#;
        assert!(parse_rg_json(output).is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary_is_search_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = RipgrepSearch::new()
            .with_binary("definitely-not-rg-ossdev")
            .search("x", dir.path(), None, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, OssDevError::Search { .. }));
    }
}
