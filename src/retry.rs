//! Backoff for optimistic-concurrency conflicts.
//!
//! Every balance, status and settings write is a conditional update that
//! loses when another writer got there first. The loser re-reads and tries
//! again under `conflict_backoff`; nothing else is retried.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::error::LedgerError;

/// Total attempts, first try included, before `ConcurrencyConflict` reaches
/// the caller.
pub const MAX_SETTLEMENT_ATTEMPTS: usize = 5;

/// Backoff between conflicting conditional updates.
///
/// - Min delay: 1ms
/// - Max delay: 50ms
/// - Retries: `MAX_SETTLEMENT_ATTEMPTS - 1`
/// - Jitter enabled
pub fn conflict_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(50))
        .with_max_times(MAX_SETTLEMENT_ATTEMPTS - 1)
        .with_jitter()
}

/// The error a single losing attempt reports.
pub fn conflict() -> LedgerError {
    LedgerError::ConcurrencyConflict {
        attempts: MAX_SETTLEMENT_ATTEMPTS,
    }
}

/// Only lost conditional updates are worth another attempt.
pub fn is_conflict(e: &LedgerError) -> bool {
    matches!(e, LedgerError::ConcurrencyConflict { .. })
}
