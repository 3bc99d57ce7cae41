//! Code-location search.
//!
//! - [`RipgrepSearch`] runs one pattern and returns excerpts
//! - [`collect_excerpts`] runs a whole plan of [`SearchQuery`]s
//! - [`project_map`] lists the repository layout for prompts

pub mod mapper;
pub mod ripgrep;

pub use mapper::{project_map, DEFAULT_MAP_DEPTH};
pub use ripgrep::{parse_rg_json, RipgrepSearch};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

use crate::agents::SearchQuery;
use crate::fix::CodeExcerpt;

/// The `[search]` section of the settings file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Context lines when a query does not say.
    pub context_lines: u32,
    /// Most excerpts handed to the fix loop.
    pub max_excerpts: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            context_lines: 20,
            max_excerpts: 12,
        }
    }
}

impl SearchConfig {
    /// Validate the search configuration.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_excerpts == 0 {
            return Err("max_excerpts must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Run every query against `repo` and merge the results.
///
/// A failing query is logged and skipped. Excerpts with the same path and
/// start line are kept once, in first-seen order, up to `max_excerpts`.
pub async fn collect_excerpts(
    search: &RipgrepSearch,
    repo: &Path,
    queries: &[SearchQuery],
    config: &SearchConfig,
) -> Vec<CodeExcerpt> {
    let mut seen = HashSet::new();
    let mut excerpts = Vec::new();

    for query in queries {
        let context = query.context_lines.unwrap_or(config.context_lines);
        let found = match search
            .search(&query.pattern, repo, query.file_type.as_deref(), context)
            .await
        {
            Ok(found) => found,
            Err(e) => {
                warn!("Skipping query {:?}: {}", query.pattern, e);
                continue;
            }
        };

        for excerpt in found {
            if excerpts.len() >= config.max_excerpts {
                break;
            }
            if seen.insert((excerpt.path.clone(), excerpt.start_line)) {
                excerpts.push(excerpt);
            }
        }
    }

    info!("Found {} code snippets", excerpts.len());
    excerpts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_config_defaults() {
        let config = SearchConfig::default();
        assert_eq!(config.context_lines, 20);
        assert!(config.validate().is_ok());
        assert!(SearchConfig {
            max_excerpts: 0,
            ..SearchConfig::default()
        }
        .validate()
        .is_err());
    }

    #[tokio::test]
    async fn test_collect_excerpts_tolerates_failing_search() {
        let dir = tempfile::TempDir::new().unwrap();
        let search = RipgrepSearch::new().with_binary("definitely-not-rg-ossdev");
        let queries = vec![SearchQuery::literal("x", "test")];
        let excerpts = collect_excerpts(&search, dir.path(), &queries, &SearchConfig::default()).await;
        assert!(excerpts.is_empty());
    }
}
