//! Accumulated memory of failed attempts.

use super::types::{AttemptRecord, CandidatePatch};

/// Append-only list of failed attempts.
///
/// Records are kept in attempt order and are never reordered or dropped;
/// the only mutation is [`FailureHistory::record`].
#[derive(Debug, Default, Clone)]
pub struct FailureHistory {
    records: Vec<AttemptRecord>,
}

impl FailureHistory {
    /// Create an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the record of the attempt that just failed.
    ///
    /// Attempt indices must arrive as `1, 2, 3, ...`.
    pub fn record(&mut self, record: AttemptRecord) {
        debug_assert_eq!(
            record.attempt as usize,
            self.records.len() + 1,
            "attempt records must be appended in order"
        );
        self.records.push(record);
    }

    /// All records so far, oldest first.
    #[must_use]
    pub fn records(&self) -> &[AttemptRecord] {
        &self.records
    }

    /// Number of failed attempts recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no attempt has failed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Attempt index of an earlier failure with an identical patch.
    #[must_use]
    pub fn find_repeat(&self, patch: &CandidatePatch) -> Option<u32> {
        let digest = patch.digest();
        self.records
            .iter()
            .find(|r| r.patch.digest() == digest)
            .map(|r| r.attempt)
    }

    /// Consume the history.
    #[must_use]
    pub fn into_records(self) -> Vec<AttemptRecord> {
        self.records
    }
}
