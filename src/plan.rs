// 🎯 Plan Resolver - Coverage run → one current plan id
//
// The ledger records amounts, not plans. A fee map translates amounts back to
// plans, and when a run mixes several fees (upgrade, downgrade, back-payment at
// an old price) a per-day timeline decides which fee covers "now".
//
// The timeline is a best-effort heuristic, not an exact reconstruction:
// - higher fees claim days first, so overlaps resolve to the higher plan
// - fees missing from the map (discontinued plans) claim nothing; their days
//   read as the lowest known fee of the run

use chrono::{DateTime, Datelike, FixedOffset};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::coverage::{analyze, CoverageRun};
use crate::ledger::{BillingPeriod, SupporterRecord, Transaction};

/// Slots on either side of "now" inspected in the timeline.
const TIMELINE_TOLERANCE_DAYS: usize = 2;

// ============================================================================
// PLAN ID + FEE MAP
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub String);

impl PlanId {
    pub fn new(id: impl Into<String>) -> Self {
        PlanId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fee amount → plan id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanFeeMap {
    fees: BTreeMap<i64, PlanId>,
}

impl PlanFeeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, fee: i64, plan: PlanId) -> Option<PlanId> {
        self.fees.insert(fee, plan)
    }

    pub fn get(&self, fee: i64) -> Option<&PlanId> {
        self.fees.get(&fee)
    }

    pub fn contains_fee(&self, fee: i64) -> bool {
        self.fees.contains_key(&fee)
    }

    pub fn len(&self) -> usize {
        self.fees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fees.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, &PlanId)> {
        self.fees.iter().map(|(fee, plan)| (*fee, plan))
    }

    /// Additive merge: `fresh` wins on collisions, keys only we hold survive.
    pub fn merged_with(&self, fresh: &PlanFeeMap) -> PlanFeeMap {
        let mut merged = self.clone();
        for (fee, plan) in fresh.iter() {
            merged.insert(fee, plan.clone());
        }
        merged
    }

    /// Plan whose fee is closest to `fee`. Equal distances go to the lower fee.
    pub fn nearest(&self, fee: i64) -> Option<&PlanId> {
        let mut best: Option<(i64, &PlanId)> = None;
        for (candidate, plan) in self.iter() {
            let distance = (candidate - fee).abs();
            if best.map_or(true, |(d, _)| distance < d) {
                best = Some((distance, plan));
            }
        }
        best.map(|(_, plan)| plan)
    }
}

impl FromIterator<(i64, PlanId)> for PlanFeeMap {
    fn from_iter<I: IntoIterator<Item = (i64, PlanId)>>(iter: I) -> Self {
        PlanFeeMap {
            fees: iter.into_iter().collect(),
        }
    }
}

// ============================================================================
// RESOLUTION MODE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMode {
    /// Only charges in the current month (plus the previous one during leeway)
    #[default]
    RangeLimited,

    /// The whole coverage run, gated on coverage reaching now
    Coverage,

    /// Highest plan ever paid for, regardless of coverage
    HighestEver,
}

// ============================================================================
// PLAN RESOLVER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanResolver {
    /// Grace period added to the projected stop date
    pub leeway_days: i64,

    /// Restrict resolution to the current (and during leeway, previous) month
    pub limit_range: bool,
}

impl PlanResolver {
    pub fn new(leeway_days: i64, limit_range: bool) -> Self {
        PlanResolver {
            leeway_days: leeway_days.abs(),
            limit_range,
        }
    }

    /// Full pipeline: compress → coverage → plan.
    pub fn resolve(
        &self,
        record: &SupporterRecord,
        fees: &PlanFeeMap,
        now: DateTime<FixedOffset>,
    ) -> Option<PlanId> {
        let run = analyze(&record.compressed_ascending());
        self.resolve_run(&run, fees, now)
    }

    pub fn resolve_run(
        &self,
        run: &CoverageRun,
        fees: &PlanFeeMap,
        now: DateTime<FixedOffset>,
    ) -> Option<PlanId> {
        let stop = run.stop_with_leeway(self.leeway_days)?;

        let candidates: Vec<Transaction> = if self.limit_range {
            // The month window overrides the coverage verdict either way
            let restricted = self.restrict_to_window(&run.transactions, now);
            if restricted.is_empty() {
                return None;
            }
            restricted
        } else {
            if !run.is_active(now, self.leeway_days) {
                return None;
            }
            run.transactions.clone()
        };

        let mut distinct: Vec<i64> = candidates.iter().map(|tx| tx.amount).collect();
        distinct.sort_unstable();
        distinct.dedup();

        if let [only] = distinct.as_slice() {
            return fees.get(*only).cloned();
        }

        let fee = timeline_fee(&candidates, stop, fees, now)?;
        fees.get(fee).cloned()
    }

    /// Transactions dated in now's calendar month, or also the previous month
    /// when now falls within the first `leeway_days` days.
    fn restrict_to_window(
        &self,
        transactions: &[Transaction],
        now: DateTime<FixedOffset>,
    ) -> Vec<Transaction> {
        let offset = *now.offset();
        let current = BillingPeriod::containing(&now);
        let first = if i64::from(now.day()) <= self.leeway_days {
            current.previous()
        } else {
            current
        };

        let (Some(start), Some(end)) = (first.start_in(offset), current.next().start_in(offset))
        else {
            return Vec::new();
        };

        transactions
            .iter()
            .filter(|tx| tx.date >= start && tx.date < end)
            .cloned()
            .collect()
    }
}

/// Highest fee ever paid, mapped to the nearest catalog fee.
///
/// Ignores coverage and leeway entirely; tolerant of price changes because the
/// match is by distance, not equality.
pub fn compute_highest_plan_id(record: &SupporterRecord, fees: &PlanFeeMap) -> Option<PlanId> {
    let highest = record
        .compressed_ascending()
        .iter()
        .map(|tx| tx.amount)
        .max()?;
    fees.nearest(highest).cloned()
}

// ============================================================================
// DAY TIMELINE (multi-fee runs)
// ============================================================================

/// Build a per-day timeline from the first transaction to `stop` and read the
/// fee covering the slots around `now`.
fn timeline_fee(
    transactions: &[Transaction],
    stop: DateTime<FixedOffset>,
    fees: &PlanFeeMap,
    now: DateTime<FixedOffset>,
) -> Option<i64> {
    let start = transactions.iter().map(|tx| tx.date).min()?;
    let len = usize::try_from((stop - start).num_days()).unwrap_or(0).max(1);
    let mut days: Vec<Option<i64>> = vec![None; len];

    let mut known: Vec<i64> = transactions
        .iter()
        .map(|tx| tx.amount)
        .filter(|fee| fees.contains_fee(*fee))
        .collect();
    known.sort_unstable_by(|a, b| b.cmp(a));
    known.dedup();

    // Highest first: a lower fee only ever takes days nobody claimed yet
    for fee in &known {
        for tx in transactions.iter().filter(|tx| tx.amount == *fee) {
            let mut day = usize::try_from((tx.date - start).num_days()).unwrap_or(0);
            let mut remaining = tx.span;
            while remaining > 0 && day < len {
                if days[day].is_none() {
                    days[day] = Some(*fee);
                    remaining -= 1;
                }
                day += 1;
            }
        }
    }

    let lowest_known = known.last().copied();
    let now_index = usize::try_from((now - start).num_days())
        .unwrap_or(0)
        .min(len - 1);
    let lo = now_index.saturating_sub(TIMELINE_TOLERANCE_DAYS);
    let hi = (now_index + TIMELINE_TOLERANCE_DAYS).min(len - 1);

    days[lo..=hi]
        .iter()
        .filter_map(|slot| slot.or(lowest_known))
        .max()
}

// ============================================================================
// TESTS
// ============================================================================
