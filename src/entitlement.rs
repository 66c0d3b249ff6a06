// 🎟️ Entitlement Policy - Ledger → desired role
//
// Glues the resolver to the configured plan roles:
//   RangeLimited / Coverage → PlanResolver
//   HighestEver             → highest fee ever paid, regardless of coverage
// If coverage is active but no plan maps to a role, the fallback role applies
// (when configured).

use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::Config;
use crate::coverage::analyze;
use crate::guild::RoleId;
use crate::ledger::SupporterRecord;
use crate::plan::{compute_highest_plan_id, PlanFeeMap, PlanId, PlanResolver, ResolutionMode};

/// Verdict for one ledger at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entitlement {
    pub coverage_active: bool,
    pub plan: Option<PlanId>,
    pub role: Option<RoleId>,
}

impl Entitlement {
    pub fn none() -> Self {
        Entitlement {
            coverage_active: false,
            plan: None,
            role: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EntitlementPolicy {
    pub mode: ResolutionMode,
    pub resolver: PlanResolver,
    pub plan_roles: BTreeMap<PlanId, RoleId>,
    pub fallback_role: Option<RoleId>,
    pub offset: FixedOffset,
}

impl EntitlementPolicy {
    pub fn from_config(config: &Config) -> Self {
        EntitlementPolicy {
            mode: config.resolution,
            resolver: config.resolver(),
            plan_roles: config.plan_roles.clone(),
            fallback_role: config.fallback_role,
            offset: config.offset(),
        }
    }

    /// Every role this policy can hand out.
    pub fn role_set(&self) -> Vec<RoleId> {
        let mut roles: Vec<RoleId> = self.plan_roles.values().copied().collect();
        roles.extend(self.fallback_role);
        roles.sort();
        roles.dedup();
        roles
    }

    pub fn evaluate(
        &self,
        record: Option<&SupporterRecord>,
        fees: &PlanFeeMap,
        now: DateTime<Utc>,
    ) -> Entitlement {
        let Some(record) = record else {
            return Entitlement::none();
        };

        let now = now.with_timezone(&self.offset);
        let run = analyze(&record.compressed_ascending());
        let coverage_active = run.is_active(now, self.resolver.leeway_days);

        let plan = match self.mode {
            ResolutionMode::RangeLimited | ResolutionMode::Coverage => {
                self.resolver.resolve_run(&run, fees, now)
            }
            ResolutionMode::HighestEver => compute_highest_plan_id(record, fees),
        };

        let role = plan
            .as_ref()
            .and_then(|plan| self.plan_roles.get(plan).copied())
            .or_else(|| self.fallback_role.filter(|_| coverage_active));

        Entitlement {
            coverage_active,
            plan,
            role,
        }
    }

    pub fn desired_role(
        &self,
        record: Option<&SupporterRecord>,
        fees: &PlanFeeMap,
        now: DateTime<Utc>,
    ) -> Option<RoleId> {
        self.evaluate(record, fees, now).role
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::RawCharge;

    fn charge(amount: i64, period: &str, date: &str) -> RawCharge {
        RawCharge {
            amount,
            billing_period: period.parse().unwrap(),
            date: DateTime::parse_from_rfc3339(date).unwrap(),
        }
    }

    /// Provider order: newest first
    fn scenario_ledger() -> SupporterRecord {
        SupporterRecord::new(vec![
            charge(500, "2024-05", "2024-05-14T00:00:00+09:00"),
            charge(500, "2024-04", "2024-04-01T00:00:00+09:00"),
            charge(400, "2024-03", "2024-03-16T00:00:00+09:00"),
            charge(500, "2024-03", "2024-03-15T00:00:00+09:00"),
        ])
    }

    fn fees() -> PlanFeeMap {
        [
            (500, PlanId::new("1")),
            (1000, PlanId::new("2")),
            (1500, PlanId::new("3")),
        ]
        .into_iter()
        .collect()
    }

    fn policy(mode: ResolutionMode, fallback: Option<RoleId>) -> EntitlementPolicy {
        let mut plan_roles = BTreeMap::new();
        plan_roles.insert(PlanId::new("1"), RoleId(1001));
        plan_roles.insert(PlanId::new("2"), RoleId(1002));
        plan_roles.insert(PlanId::new("3"), RoleId(1003));

        EntitlementPolicy {
            mode,
            resolver: PlanResolver::new(5, mode == ResolutionMode::RangeLimited),
            plan_roles,
            fallback_role: fallback,
            offset: FixedOffset::east_opt(9 * 3600).unwrap(),
        }
    }

    fn at(ts: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(ts).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_range_limited_scenario() {
        let verdict = policy(ResolutionMode::RangeLimited, None).evaluate(
            Some(&scenario_ledger()),
            &fees(),
            at("2024-06-01T00:00:01+09:00"),
        );
        assert_eq!(verdict.plan, Some(PlanId::new("1")));
        assert_eq!(verdict.role, Some(RoleId(1001)));
        assert!(verdict.coverage_active);
    }

    #[test]
    fn test_highest_ever_scenario() {
        let role = policy(ResolutionMode::HighestEver, None).desired_role(
            Some(&scenario_ledger()),
            &fees(),
            at("2024-06-01T00:00:01+09:00"),
        );
        assert_eq!(role, Some(RoleId(1002)));
    }

    #[test]
    fn test_highest_ever_ignores_lapsed_coverage() {
        let verdict = policy(ResolutionMode::HighestEver, Some(RoleId(1999))).evaluate(
            Some(&scenario_ledger()),
            &fees(),
            at("2024-09-01T00:00:00+09:00"),
        );
        assert!(!verdict.coverage_active);
        assert_eq!(verdict.plan, Some(PlanId::new("2")));
        assert_eq!(verdict.role, Some(RoleId(1002)));
    }

    #[test]
    fn test_no_ledger_is_no_role() {
        let verdict = policy(ResolutionMode::Coverage, Some(RoleId(1999))).evaluate(
            None,
            &fees(),
            at("2024-06-01T00:00:01+09:00"),
        );
        assert_eq!(verdict, Entitlement::none());
    }

    #[test]
    fn test_fallback_when_active_but_unmapped() {
        let ledger = SupporterRecord::new(vec![charge(777, "2024-05", "2024-05-14T00:00:00+09:00")]);
        let now = at("2024-05-20T00:00:00+09:00");

        let without = policy(ResolutionMode::Coverage, None).evaluate(Some(&ledger), &fees(), now);
        assert!(without.coverage_active);
        assert_eq!(without.role, None);

        let with = policy(ResolutionMode::Coverage, Some(RoleId(1999))).evaluate(Some(&ledger), &fees(), now);
        assert_eq!(with.plan, None);
        assert_eq!(with.role, Some(RoleId(1999)));
    }

    #[test]
    fn test_fallback_never_applies_after_lapse() {
        let ledger = SupporterRecord::new(vec![charge(777, "2024-01", "2024-01-14T00:00:00+09:00")]);
        let role = policy(ResolutionMode::Coverage, Some(RoleId(1999))).desired_role(
            Some(&ledger),
            &fees(),
            at("2024-05-20T00:00:00+09:00"),
        );
        assert_eq!(role, None);
    }

    #[test]
    fn test_role_set_includes_fallback() {
        let roles = policy(ResolutionMode::Coverage, Some(RoleId(1999))).role_set();
        assert_eq!(roles, vec![RoleId(1001), RoleId(1002), RoleId(1003), RoleId(1999)]);
    }
}
