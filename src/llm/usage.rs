//! Token and cost accounting across LLM calls.
//!
//! A [`UsageLedger`] is created once per run and handed to every client as an
//! `Arc`, so the spending limit covers the analyzer, the scout and every
//! engineer call together.
//!
//! # Example
//!
//! ```rust
//! use ossdev::llm::usage::UsageLedger;
//!
//! let ledger = UsageLedger::new();
//! ledger.record("gemini-2.0-flash", 1_000, 500, 0.0003);
//! assert_eq!(ledger.summary().total_tokens, 1_500);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

/// Usage totals for one model.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ModelUsage {
    /// Prompt tokens sent.
    pub prompt_tokens: u64,
    /// Completion tokens received.
    pub completion_tokens: u64,
    /// Estimated cost in USD.
    pub cost_usd: f64,
    /// Number of requests made.
    pub request_count: u64,
}

impl ModelUsage {
    /// Total tokens (prompt + completion).
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    fn record(&mut self, prompt_tokens: u32, completion_tokens: u32, cost_usd: f64) {
        self.prompt_tokens += u64::from(prompt_tokens);
        self.completion_tokens += u64::from(completion_tokens);
        self.cost_usd += cost_usd;
        self.request_count += 1;
    }
}

/// Point-in-time copy of a ledger.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct UsageSummary {
    /// Per-model totals, ordered by model name.
    pub models: BTreeMap<String, ModelUsage>,
    /// Sum of all model costs.
    pub total_cost_usd: f64,
    /// Sum of all model tokens.
    pub total_tokens: u64,
}

/// Thread-safe accumulator of LLM usage.
#[derive(Debug, Default)]
pub struct UsageLedger {
    models: Mutex<HashMap<String, ModelUsage>>,
}

impl UsageLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ModelUsage>> {
        // A panic while holding the lock cannot leave a half-written entry.
        self.models.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record one request.
    pub fn record(&self, model: &str, prompt_tokens: u32, completion_tokens: u32, cost_usd: f64) {
        self.lock()
            .entry(model.to_string())
            .or_default()
            .record(prompt_tokens, completion_tokens, cost_usd);
    }

    /// Total estimated cost so far.
    #[must_use]
    pub fn total_cost(&self) -> f64 {
        self.lock().values().map(|u| u.cost_usd).sum()
    }

    /// Whether spending has reached `budget_usd`. A budget of zero disables
    /// the limit.
    #[must_use]
    pub fn exceeds(&self, budget_usd: f64) -> bool {
        budget_usd > 0.0 && self.total_cost() >= budget_usd
    }

    /// Snapshot the ledger.
    #[must_use]
    pub fn summary(&self) -> UsageSummary {
        let models: BTreeMap<String, ModelUsage> = self
            .lock()
            .iter()
            .map(|(name, usage)| (name.clone(), usage.clone()))
            .collect();
        UsageSummary {
            total_cost_usd: models.values().map(|u| u.cost_usd).sum(),
            total_tokens: models.values().map(ModelUsage::total_tokens).sum(),
            models,
        }
    }

    /// One line per model plus a total, for terminal output.
    #[must_use]
    pub fn format_summary(&self) -> String {
        let summary = self.summary();
        let mut lines: Vec<String> = summary
            .models
            .iter()
            .map(|(name, usage)| {
                format!(
                    "  {}: {} requests, {} tokens, ${:.4}",
                    name,
                    usage.request_count,
                    usage.total_tokens(),
                    usage.cost_usd
                )
            })
            .collect();
        lines.push(format!(
            "  Total: {} tokens, ${:.4}",
            summary.total_tokens, summary.total_cost_usd
        ));
        lines.join("\n")
    }
}
