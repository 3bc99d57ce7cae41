//! Custom assertions for fix-loop results.

use crate::fix::{AbortCause, LoopResult};

/// Assert that the run found a verified patch after `attempts` attempts.
///
/// # Panics
///
/// Panics with the run's status and history length if it did not.
///
/// # Example
///
/// ```rust,ignore
/// let result = controller.run(&problem, &[], &mut env, "npm test", &cancel).await;
/// assert_fixed_after(&result, 3);
/// ```
pub fn assert_fixed_after(result: &LoopResult, attempts: u32) {
    assert!(
        result.succeeded(),
        "Expected the run to be fixed, but it ended as {} after {} attempts (history: {})",
        result.status(),
        result.attempts,
        result.history.len()
    );
    assert_eq!(
        result.attempts, attempts,
        "Expected a fix on attempt {}, got attempt {}",
        attempts, result.attempts
    );
}

/// Assert that the run spent all `attempts` without success.
///
/// # Panics
///
/// Panics if the run did not end as exhausted.
pub fn assert_exhausted(result: &LoopResult, attempts: u32) {
    assert_eq!(
        result.status(),
        "exhausted",
        "Expected the run to be exhausted, but it ended as {}",
        result.status()
    );
    assert_eq!(result.attempts, attempts);
}

/// Assert that the run aborted because the patch generator failed.
///
/// # Panics
///
/// Panics if the run did not abort, or aborted for another reason.
pub fn assert_generation_abort(result: &LoopResult) {
    assert!(
        matches!(result.abort_cause(), Some(AbortCause::Generation(_))),
        "Expected a generation abort, but the run ended as {}",
        result.status()
    );
}

/// Assert that history indices run `1..=n` in order.
///
/// # Panics
///
/// Panics on the first out-of-order record.
pub fn assert_history_ordered(result: &LoopResult) {
    for (idx, record) in result.history.iter().enumerate() {
        assert_eq!(
            record.attempt as usize,
            idx + 1,
            "History record {} carries attempt index {}",
            idx,
            record.attempt
        );
    }
}
