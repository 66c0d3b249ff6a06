// 💴 Fee Lookup Cache - fee → plan map that never forgets
//
// Plans get repriced or discontinued, but old charges in a ledger still carry
// the old amounts. The fresh catalog is merged over the persisted map so those
// amounts keep resolving.

use std::sync::Arc;
use tracing::{debug, info};

use crate::billing::{catalog_to_fee_map, BillingClient};
use crate::db::{self, Database};
use crate::error::Result;
use crate::plan::PlanFeeMap;

#[derive(Debug, Clone)]
pub struct FeeLookupCache {
    db: Arc<Database>,
}

impl FeeLookupCache {
    pub fn new(db: Arc<Database>) -> Self {
        FeeLookupCache { db }
    }

    /// Persisted map only, no network.
    pub fn cached(&self) -> Result<PlanFeeMap> {
        self.db.with_conn(db::load_fee_lookup)
    }

    /// Fetch the catalog, merge it over the persisted map (fresh wins), persist
    /// and return the merged map.
    pub async fn resolve<B: BillingClient + ?Sized>(&self, billing: &B) -> Result<PlanFeeMap> {
        let fresh = catalog_to_fee_map(&billing.get_catalog().await?);
        let cached = self.cached()?;
        let merged = cached.merged_with(&fresh);

        self.db.with_conn(|conn| db::store_fee_lookup(conn, &merged))?;

        let retained = merged.len() - fresh.len();
        if retained > 0 {
            debug!(retained = retained, "fees kept from discontinued plans");
        }
        info!(fees = merged.len(), catalog = fresh.len(), "fee lookup refreshed");

        Ok(merged)
    }

    /// Persisted map, or a fresh resolve when nothing has been persisted yet.
    pub async fn cached_or_resolve<B: BillingClient + ?Sized>(&self, billing: &B) -> Result<PlanFeeMap> {
        let cached = self.cached()?;
        if cached.is_empty() {
            return self.resolve(billing).await;
        }
        Ok(cached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::{CatalogPlan, SubscriberId};
    use crate::ledger::SupporterRecord;
    use crate::plan::PlanId;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Catalog(Mutex<Vec<CatalogPlan>>);

    #[async_trait]
    impl BillingClient for Catalog {
        async fn get_ledger(&self, _subscriber: &SubscriberId) -> Result<Option<SupporterRecord>> {
            Ok(None)
        }

        async fn get_catalog(&self) -> Result<Vec<CatalogPlan>> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    fn plan(fee: i64, id: &str) -> CatalogPlan {
        CatalogPlan { fee, plan_id: PlanId::new(id) }
    }

    #[tokio::test]
    async fn test_discontinued_fees_survive_refresh() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let cache = FeeLookupCache::new(db);
        let billing = Catalog(Mutex::new(vec![plan(300, "0"), plan(500, "1")]));

        let first = cache.resolve(&billing).await.unwrap();
        assert_eq!(first.len(), 2);

        // 300 discontinued, 500 repriced to a new plan, 1000 added
        *billing.0.lock().unwrap() = vec![plan(500, "1b"), plan(1000, "2")];
        let second = cache.resolve(&billing).await.unwrap();

        assert_eq!(second.len(), 3);
        assert_eq!(second.get(300), Some(&PlanId::new("0")));
        assert_eq!(second.get(500), Some(&PlanId::new("1b")));
        assert_eq!(cache.cached().unwrap(), second);
    }

    #[tokio::test]
    async fn test_cached_or_resolve_fetches_once() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let cache = FeeLookupCache::new(db);
        let billing = Catalog(Mutex::new(vec![plan(500, "1")]));

        assert_eq!(cache.cached_or_resolve(&billing).await.unwrap().len(), 1);

        // Catalog changes are not picked up until the next full resolve
        *billing.0.lock().unwrap() = vec![plan(500, "1"), plan(1000, "2")];
        assert_eq!(cache.cached_or_resolve(&billing).await.unwrap().len(), 1);
    }
}
