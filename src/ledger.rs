// 🧾 Billing Ledger - Raw charges + per-period compression
//
// The provider hands us an append-only list of charges. Retries and partial
// charges show up as several rows for the SAME billing period, so before any
// coverage reasoning happens those rows collapse into one Transaction.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, TimeZone};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

// ============================================================================
// BILLING PERIOD (year-month)
// ============================================================================

/// Calendar month a charge is attributed to, independent of its timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BillingPeriod {
    pub year: i32,
    pub month: u32,
}

impl BillingPeriod {
    pub fn new(year: i32, month: u32) -> Result<Self, SyncError> {
        if !(1..=12).contains(&month) {
            return Err(SyncError::Transient(format!(
                "billing period month out of range: {}-{}",
                year, month
            )));
        }
        Ok(BillingPeriod { year, month })
    }

    pub fn first_day(&self) -> NaiveDate {
        // month is validated on construction
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn next(&self) -> BillingPeriod {
        if self.month == 12 {
            BillingPeriod { year: self.year + 1, month: 1 }
        } else {
            BillingPeriod { year: self.year, month: self.month + 1 }
        }
    }

    pub fn previous(&self) -> BillingPeriod {
        if self.month == 1 {
            BillingPeriod { year: self.year - 1, month: 12 }
        } else {
            BillingPeriod { year: self.year, month: self.month - 1 }
        }
    }

    /// Midnight of the first day of this period, in `offset`'s local time.
    pub fn start_in(&self, offset: FixedOffset) -> Option<DateTime<FixedOffset>> {
        let midnight = self.first_day().and_hms_opt(0, 0, 0)?;
        offset.from_local_datetime(&midnight).single()
    }

    /// Number of calendar days in this period (28..=31).
    pub fn days(&self) -> i64 {
        (self.next().first_day() - self.first_day()).num_days()
    }

    pub fn containing<D: Datelike>(date: &D) -> BillingPeriod {
        BillingPeriod { year: date.year(), month: date.month() }
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for BillingPeriod {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, month) = s
            .split_once('-')
            .ok_or_else(|| SyncError::Transient(format!("malformed billing period: {:?}", s)))?;
        let year = year
            .parse()
            .map_err(|_| SyncError::Transient(format!("malformed billing year: {:?}", s)))?;
        let month = month
            .parse()
            .map_err(|_| SyncError::Transient(format!("malformed billing month: {:?}", s)))?;
        BillingPeriod::new(year, month)
    }
}

impl TryFrom<String> for BillingPeriod {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BillingPeriod> for String {
    fn from(period: BillingPeriod) -> Self {
        period.to_string()
    }
}

// ============================================================================
// RAW CHARGE (provider wire shape)
// ============================================================================

/// One row of the provider's support-transaction list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCharge {
    #[serde(rename = "paidAmount")]
    pub amount: i64,

    #[serde(rename = "targetMonth")]
    pub billing_period: BillingPeriod,

    #[serde(rename = "transactionDatetime")]
    pub date: DateTime<FixedOffset>,
}

/// Everything we keep about one subscriber: the raw ledger, newest first
/// (the provider's native order).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SupporterRecord {
    #[serde(rename = "supportTransactions", default)]
    pub transactions: Vec<RawCharge>,
}

impl SupporterRecord {
    pub fn new(transactions: Vec<RawCharge>) -> Self {
        SupporterRecord { transactions }
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Compressed ledger in ascending chronological order, ready for
    /// coverage analysis.
    pub fn compressed_ascending(&self) -> Vec<Transaction> {
        let mut compressed = compress(&self.transactions);
        compressed.sort_by_key(|tx| tx.date);
        compressed
    }
}

// ============================================================================
// COMPRESSED TRANSACTION
// ============================================================================

/// One billing period's worth of charges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Sum of every raw charge in the period (minor currency units)
    pub amount: i64,

    pub billing_period: BillingPeriod,

    /// Earliest raw charge date in the period
    pub date: DateTime<FixedOffset>,

    /// Calendar days in `billing_period`
    pub span: i64,
}

impl Transaction {
    pub fn from_charge(charge: &RawCharge) -> Self {
        Transaction {
            amount: charge.amount,
            billing_period: charge.billing_period,
            date: charge.date,
            span: charge.billing_period.days(),
        }
    }

    /// The instant this payment's own span runs out.
    pub fn end(&self) -> DateTime<FixedOffset> {
        self.date + Duration::days(self.span)
    }
}

// ============================================================================
// TRANSACTION COMPRESSOR
// ============================================================================

/// Merge contiguous same-period charges into one Transaction per period.
///
/// Charges for one period must be adjacent in the input (true of the
/// provider's ordering). Groups keep their input order; nothing is re-sorted.
pub fn compress(charges: &[RawCharge]) -> Vec<Transaction> {
    let mut compressed: Vec<Transaction> = Vec::new();

    for charge in charges {
        match compressed.last_mut() {
            Some(last) if last.billing_period == charge.billing_period => {
                last.amount += charge.amount;
                if charge.date < last.date {
                    last.date = charge.date;
                }
            }
            _ => compressed.push(Transaction::from_charge(charge)),
        }
    }

    compressed
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn charge(amount: i64, period: &str, date: &str) -> RawCharge {
        RawCharge {
            amount,
            billing_period: period.parse().unwrap(),
            date: DateTime::parse_from_rfc3339(date).unwrap(),
        }
    }

    #[test]
    fn test_period_days() {
        assert_eq!(BillingPeriod::new(2024, 2).unwrap().days(), 29);
        assert_eq!(BillingPeriod::new(2023, 2).unwrap().days(), 28);
        assert_eq!(BillingPeriod::new(2024, 4).unwrap().days(), 30);
        assert_eq!(BillingPeriod::new(2024, 12).unwrap().days(), 31);
    }

    #[test]
    fn test_period_neighbours_and_local_start() {
        let january = BillingPeriod::new(2024, 1).unwrap();
        assert_eq!(january.previous(), BillingPeriod { year: 2023, month: 12 });
        assert_eq!(january.previous().next(), january);

        let jst = FixedOffset::east_opt(9 * 3600).unwrap();
        let start = january.start_in(jst).unwrap();
        assert_eq!(start.to_rfc3339(), "2024-01-01T00:00:00+09:00");
    }

    #[test]
    fn test_period_parse_and_display() {
        let period: BillingPeriod = "2024-03".parse().unwrap();
        assert_eq!(period, BillingPeriod { year: 2024, month: 3 });
        assert_eq!(period.to_string(), "2024-03");
        assert!("2024-13".parse::<BillingPeriod>().is_err());
        assert!("202403".parse::<BillingPeriod>().is_err());
    }

    #[test]
    fn test_deserialize_provider_payload() {
        let json = r#"{
            "supportingPlan": null,
            "supportTransactions": [
                {"paidAmount": 500, "transactionDatetime": "2024-05-14T00:00:00+09:00", "targetMonth": "2024-05"},
                {"paidAmount": 400, "transactionDatetime": "2024-03-16T00:00:00+09:00", "targetMonth": "2024-03"}
            ]
        }"#;

        let record: SupporterRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.transactions.len(), 2);
        assert_eq!(record.transactions[0].amount, 500);
        assert_eq!(record.transactions[1].billing_period.month, 3);
    }

    #[test]
    fn test_compress_same_period() {
        let charges = vec![
            charge(500, "2024-05", "2024-05-14T00:00:00+09:00"),
            charge(500, "2024-04", "2024-04-01T00:00:00+09:00"),
            charge(500, "2024-03", "2024-03-15T00:00:00+09:00"),
            charge(400, "2024-03", "2024-03-16T00:00:00+09:00"),
        ];

        let compressed = compress(&charges);

        assert_eq!(compressed.len(), 3);
        assert_eq!(compressed[2].amount, 900);
        assert_eq!(
            compressed[2].date,
            DateTime::parse_from_rfc3339("2024-03-15T00:00:00+09:00").unwrap()
        );
        assert_eq!(compressed[2].span, 31);
        assert_eq!(compressed[1].span, 30);
    }

    #[test]
    fn test_compress_does_not_resort_groups() {
        let charges = vec![
            charge(500, "2024-05", "2024-05-14T00:00:00+09:00"),
            charge(500, "2024-03", "2024-03-15T00:00:00+09:00"),
        ];

        let compressed = compress(&charges);
        assert_eq!(compressed[0].billing_period.month, 5);
        assert_eq!(compressed[1].billing_period.month, 3);

        let record = SupporterRecord::new(charges);
        let ascending = record.compressed_ascending();
        assert_eq!(ascending[0].billing_period.month, 3);
    }

    proptest! {
        #[test]
        fn prop_same_period_compresses_to_sum(
            amounts in proptest::collection::vec(1i64..100_000, 1..12),
            day_offsets in proptest::collection::vec(0u32..27, 12),
        ) {
            let charges: Vec<RawCharge> = amounts
                .iter()
                .zip(day_offsets.iter())
                .map(|(amount, day)| charge(
                    *amount,
                    "2024-08",
                    &format!("2024-08-{:02}T12:00:00+09:00", day + 1),
                ))
                .collect();

            let compressed = compress(&charges);

            prop_assert_eq!(compressed.len(), 1);
            prop_assert_eq!(compressed[0].amount, amounts.iter().sum::<i64>());
            let earliest = charges.iter().map(|c| c.date).min().unwrap();
            prop_assert_eq!(compressed[0].date, earliest);
        }
    }
}
