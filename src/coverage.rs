// ⏳ Coverage Analyzer - Reconstruct the latest unbroken subscription run
//
// Ledgers are append-only and never say "lapsed". A lapse can only be inferred
// from a calendar gap: a payment that lands AFTER the projected stop date of
// everything before it starts a fresh run, and the older history is dropped.

use chrono::{DateTime, Duration, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::ledger::Transaction;

// ============================================================================
// COVERAGE RUN
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageRun {
    /// Compressed transactions of the most recent unbroken chain, ascending
    pub transactions: Vec<Transaction>,

    /// When coverage lapses absent further payment (None = nothing paid yet)
    pub stop_date: Option<DateTime<FixedOffset>>,
}

impl CoverageRun {
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Stop date pushed out by the grace period.
    pub fn stop_with_leeway(&self, leeway_days: i64) -> Option<DateTime<FixedOffset>> {
        self.stop_date.map(|stop| stop + Duration::days(leeway_days.abs()))
    }

    /// True when the run (plus leeway) still reaches `now`.
    pub fn is_active(&self, now: DateTime<FixedOffset>, leeway_days: i64) -> bool {
        !self.is_empty()
            && self
                .stop_with_leeway(leeway_days)
                .map_or(false, |stop| stop >= now)
    }
}

// ============================================================================
// ANALYZER
// ============================================================================

/// Walk compressed transactions (ascending) and keep only the latest unbroken
/// chain of payments.
///
/// Continuity case: `diff = |date - stop|` is rolled forward so an early or
/// late-but-covered payment never shrinks the projected coverage.
pub fn analyze(transactions: &[Transaction]) -> CoverageRun {
    let mut run: Vec<Transaction> = Vec::new();
    let mut stop_date: Option<DateTime<FixedOffset>> = None;

    for tx in transactions {
        match stop_date {
            Some(stop) if tx.date <= stop => {
                let diff = (tx.date - stop).abs();
                stop_date = Some(tx.end() + diff);
            }
            _ => {
                // Gap: previous run no longer reaches this payment
                run.clear();
                stop_date = Some(tx.end());
            }
        }
        run.push(tx.clone());
    }

    CoverageRun {
        transactions: run,
        stop_date,
    }
}

// ============================================================================
// TESTS
// ============================================================================
