// 🗃️ User Data Cache - Last fetched ledger per subscriber
//
// Staleness policy: the cached ledger is trusted only when it still yields a
// role AND the member already holds that role. Anything else (no cache entry,
// a not-found marker, a lapsed verdict, a role mismatch, a forced check) goes
// back to the provider and overwrites the entry.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

use crate::billing::{BillingClient, SubscriberId};
use crate::db::{self, Database, UserRecord};
use crate::entitlement::EntitlementPolicy;
use crate::error::Result;
use crate::guild::RoleId;
use crate::ledger::SupporterRecord;
use crate::plan::PlanFeeMap;

/// What the caller already knows about the member being checked.
#[derive(Debug, Clone, Copy)]
pub struct CacheContext<'a> {
    pub held_roles: &'a [RoleId],
    pub fees: &'a PlanFeeMap,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UserDataCache {
    db: Arc<Database>,
    policy: EntitlementPolicy,
}

impl UserDataCache {
    pub fn new(db: Arc<Database>, policy: EntitlementPolicy) -> Self {
        UserDataCache { db, policy }
    }

    pub fn stored(&self, subscriber: &SubscriberId) -> Result<Option<UserRecord>> {
        self.db.with_conn(|conn| db::get_user_record(conn, subscriber))
    }

    /// Ledger for `subscriber`, from cache when it can be trusted.
    /// `Ok(None)` means the provider does not know the subscriber.
    pub async fn get<B: BillingClient + ?Sized>(
        &self,
        billing: &B,
        subscriber: &SubscriberId,
        context: CacheContext<'_>,
        force: bool,
    ) -> Result<Option<SupporterRecord>> {
        if !force {
            if let Some(ledger) = self.stored(subscriber)?.and_then(|record| record.ledger) {
                let provisional = self.policy.desired_role(Some(&ledger), context.fees, context.now);
                if provisional.map_or(false, |role| context.held_roles.contains(&role)) {
                    debug!(subscriber = %subscriber, "cached ledger trusted");
                    return Ok(Some(ledger));
                }
            }
        }

        self.refresh(billing, subscriber).await
    }

    /// Always fetch, then overwrite the cache (a not-found answer writes a
    /// marker so a stale ledger can never mask a removed subscriber).
    pub async fn refresh<B: BillingClient + ?Sized>(
        &self,
        billing: &B,
        subscriber: &SubscriberId,
    ) -> Result<Option<SupporterRecord>> {
        let ledger = billing.get_ledger(subscriber).await?;

        debug!(subscriber = %subscriber, found = ledger.is_some(), "ledger fetched");

        let record = UserRecord {
            subscriber_id: subscriber.clone(),
            ledger,
            fetched_at: Utc::now(),
        };
        self.db.with_conn(|conn| db::put_user_record(conn, &record))?;

        Ok(record.ledger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::CatalogPlan;
    use crate::error::SyncError;
    use crate::ledger::RawCharge;
    use crate::plan::{PlanId, PlanResolver, ResolutionMode};
    use async_trait::async_trait;
    use chrono::FixedOffset;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Serves whatever ledger is currently scripted and counts calls.
    struct Scripted {
        ledger: Mutex<Option<SupporterRecord>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(ledger: Option<SupporterRecord>) -> Self {
            Scripted {
                ledger: Mutex::new(ledger),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl BillingClient for Scripted {
        async fn get_ledger(&self, _subscriber: &SubscriberId) -> Result<Option<SupporterRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.ledger.lock().unwrap().clone())
        }

        async fn get_catalog(&self) -> Result<Vec<CatalogPlan>> {
            Err(SyncError::Transient("not used".into()))
        }
    }

    fn active_ledger() -> SupporterRecord {
        SupporterRecord::new(vec![RawCharge {
            amount: 500,
            billing_period: "2024-05".parse().unwrap(),
            date: DateTime::parse_from_rfc3339("2024-05-14T00:00:00+09:00").unwrap(),
        }])
    }

    fn cache() -> UserDataCache {
        let mut plan_roles = BTreeMap::new();
        plan_roles.insert(PlanId::new("1"), RoleId(1001));
        let policy = EntitlementPolicy {
            mode: ResolutionMode::Coverage,
            resolver: PlanResolver::new(5, false),
            plan_roles,
            fallback_role: None,
            offset: FixedOffset::east_opt(9 * 3600).unwrap(),
        };
        UserDataCache::new(Arc::new(Database::open_in_memory().unwrap()), policy)
    }

    fn fees() -> PlanFeeMap {
        [(500, PlanId::new("1"))].into_iter().collect()
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-20T00:00:00+09:00")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn test_trusts_cache_when_role_held() {
        let cache = cache();
        let billing = Scripted::new(Some(active_ledger()));
        let id = SubscriberId::new("1");
        let fees = fees();
        let held = [RoleId(1001)];
        let ctx = CacheContext { held_roles: &held, fees: &fees, now: now() };

        cache.get(&billing, &id, ctx, false).await.unwrap();
        cache.get(&billing, &id, ctx, false).await.unwrap();
        assert_eq!(billing.calls.load(Ordering::SeqCst), 1);

        // Forced checks always go out
        cache.get(&billing, &id, ctx, true).await.unwrap();
        assert_eq!(billing.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refetches_when_role_not_held() {
        let cache = cache();
        let billing = Scripted::new(Some(active_ledger()));
        let id = SubscriberId::new("1");
        let fees = fees();
        let ctx = CacheContext { held_roles: &[], fees: &fees, now: now() };

        cache.get(&billing, &id, ctx, false).await.unwrap();
        cache.get(&billing, &id, ctx, false).await.unwrap();
        assert_eq!(billing.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_not_found_overwrites_with_marker() {
        let cache = cache();
        let billing = Scripted::new(Some(active_ledger()));
        let id = SubscriberId::new("1");
        let fees = fees();
        let held = [RoleId(1001)];
        let ctx = CacheContext { held_roles: &held, fees: &fees, now: now() };

        assert!(cache.get(&billing, &id, ctx, true).await.unwrap().is_some());

        // Subscriber disappears at the provider
        *billing.ledger.lock().unwrap() = None;
        assert!(cache.get(&billing, &id, ctx, true).await.unwrap().is_none());

        let stored = cache.stored(&id).unwrap().unwrap();
        assert!(stored.ledger.is_none());

        // The marker is never trusted: the next check goes out again
        cache.get(&billing, &id, ctx, false).await.unwrap();
        assert_eq!(billing.calls.load(Ordering::SeqCst), 3);
    }
}
