// 🔄 Sync Service - Every membership operation in one place
//
// One member at a time: cache lookup → entitlement → role correction runs
// under that member's async mutex, so a sweep and an interactive check can
// never interleave on the same member. Bulk operations (reset, purge) also
// hold a service-wide lock so they never overlap each other.
//
// Error policy:
//   sweep        per-member failures are logged and skipped; fatal aborts
//   check_access failures become SystemError; fatal notifies the admin and
//                propagates
//   admin ops    errors propagate to the caller

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::access::{extract_subscriber_id, AccessOutcome, AccessThrottle};
use crate::billing::{BillingClient, SubscriberId};
use crate::config::Config;
use crate::db::{self, Database, Event};
use crate::entitlement::{Entitlement, EntitlementPolicy};
use crate::error::Result;
use crate::fee_lookup::FeeLookupCache;
use crate::guild::{Guild, MemberId};
use crate::plan::PlanFeeMap;
use crate::reconciliation::{RoleChange, RoleReconciler};
use crate::user_cache::{CacheContext, UserDataCache};

/// Source of "now". Swappable so ledgers can be replayed at a fixed instant.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

// ============================================================================
// REPORTS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Members holding a managed role that were reconciled
    pub checked: usize,
    pub changed: usize,
    /// Members holding no managed role (not inspected)
    pub skipped: usize,
    pub failed: usize,
}

impl SweepReport {
    pub fn summary(&self) -> String {
        format!(
            "{} checked, {} changed, {} skipped, {} failed",
            self.checked, self.changed, self.skipped, self.failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberLookup {
    pub member_id: MemberId,
    /// None when the user is no longer a member
    pub name: Option<String>,
    pub subscriber_id: Option<SubscriberId>,
}

// ============================================================================
// PER-MEMBER LOCKS
// ============================================================================

#[derive(Default)]
struct MemberLocks {
    locks: Mutex<HashMap<MemberId, Arc<AsyncMutex<()>>>>,
}

impl MemberLocks {
    fn lock_for(&self, member: MemberId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // A count of one means only the map holds it: nobody is waiting or working
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(member).or_default())
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }
}

// ============================================================================
// SERVICE
// ============================================================================

pub struct SyncService<G, B> {
    guild: Arc<G>,
    billing: Arc<B>,
    db: Arc<Database>,
    fees: FeeLookupCache,
    users: UserDataCache,
    policy: EntitlementPolicy,
    reconciler: RoleReconciler,
    throttle: AccessThrottle,
    strict_access: bool,
    admin_id: Option<MemberId>,
    member_age: ChronoDuration,
    member_locks: MemberLocks,
    bulk_lock: AsyncMutex<()>,
    clock: Clock,
}

impl<G: Guild, B: BillingClient> SyncService<G, B> {
    pub fn new(config: &Config, guild: Arc<G>, billing: Arc<B>, db: Arc<Database>) -> Self {
        let policy = EntitlementPolicy::from_config(config);

        SyncService {
            guild,
            billing,
            fees: FeeLookupCache::new(Arc::clone(&db)),
            users: UserDataCache::new(Arc::clone(&db), policy.clone()),
            reconciler: RoleReconciler::new(policy.role_set()),
            policy,
            db,
            throttle: AccessThrottle::new(config.access_rate_limit()),
            strict_access: config.strict_access,
            admin_id: config.admin_id,
            member_age: ChronoDuration::hours(config.cleanup.member_age_hours),
            member_locks: MemberLocks::default(),
            bulk_lock: AsyncMutex::new(()),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn record(&self, event: Event) -> Result<()> {
        self.db.with_conn(|conn| db::insert_event(conn, &event))
    }

    // ------------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------------

    /// Bring one member's roles in line with their bound ledger. Unbound
    /// members are entitled to nothing.
    pub async fn reconcile_member(
        &self,
        member_id: MemberId,
        fees: &PlanFeeMap,
        force: bool,
        actor: &str,
    ) -> Result<RoleChange> {
        let lock = self.member_locks.lock_for(member_id);
        let _guard = lock.lock().await;

        // Snapshot taken under the lock
        let Some(member) = self.guild.member(member_id).await? else {
            return Ok(RoleChange::Unchanged);
        };

        let binding = self.db.with_conn(|conn| db::get_binding(conn, member_id))?;
        let now = self.now();

        let ledger = match &binding {
            Some(subscriber) => {
                let context = CacheContext {
                    held_roles: &member.roles,
                    fees,
                    now,
                };
                self.users.get(&*self.billing, subscriber, context, force).await?
            }
            None => None,
        };

        let desired = self.policy.desired_role(ledger.as_ref(), fees, now);
        let change = self.reconciler.apply(&*self.guild, &member, desired).await?;

        if change.changed() {
            info!(
                member = %member_id,
                subscriber = ?binding.as_ref().map(SubscriberId::as_str),
                change = %change.summary(),
                "roles reconciled"
            );
            self.record(Event::for_member(
                change.event_type(),
                member_id,
                json!({ "subscriber_id": binding, "change": change }),
                actor,
            ))?;
        }

        Ok(change)
    }

    /// One pass over the membership. Only members holding a managed role are
    /// inspected; granting is left to interactive checks.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let fees = self.fees.resolve(&*self.billing).await?;
        let members = self.guild.members().await?;
        let mut report = SweepReport::default();

        info!(members = members.len(), "sweep started");

        for member in members {
            if !member.has_any_role(self.reconciler.role_set()) {
                report.skipped += 1;
                continue;
            }

            match self.reconcile_member(member.id, &fees, false, "sweep").await {
                Ok(change) => {
                    report.checked += 1;
                    if change.changed() {
                        report.changed += 1;
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!(member = %member.id, error = %e, "sweep aborted");
                    return Err(e);
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(member = %member.id, error = %e, "member skipped");
                }
            }
        }

        info!(report = %report.summary(), "sweep finished");
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Interactive access
    // ------------------------------------------------------------------------

    /// Handle a direct message asking for access, reply to the sender and
    /// return the outcome.
    pub async fn check_access(&self, member_id: MemberId, message: &str) -> Result<AccessOutcome> {
        let outcome = match self.access_flow(member_id, message).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_fatal() => {
                error!(member = %member_id, error = %e, "fatal error during access check");
                self.reply(member_id, &AccessOutcome::SystemError).await;
                self.notify_admin(&format!("Shutting down: {}", e)).await;
                return Err(e);
            }
            Err(e) => {
                error!(member = %member_id, error = %e, "access check failed");
                AccessOutcome::SystemError
            }
        };

        info!(
            member = %member_id,
            message = message,
            outcome = outcome.condition(),
            "access check"
        );
        self.reply(member_id, &outcome).await;
        Ok(outcome)
    }

    async fn access_flow(&self, member_id: MemberId, message: &str) -> Result<AccessOutcome> {
        if self.guild.member(member_id).await?.is_none() {
            return Ok(AccessOutcome::Ignored);
        }

        if let Err(wait) = self.throttle.check(member_id) {
            let retry_after_seconds = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            return Ok(AccessOutcome::RateLimited { retry_after_seconds });
        }

        let Some(subscriber) = extract_subscriber_id(message) else {
            return Ok(AccessOutcome::NoIdFound);
        };

        if self.strict_access {
            let bound = self
                .db
                .with_conn(|conn| db::members_for_subscriber(conn, &subscriber))?;
            if !bound.is_empty() && !bound.contains(&member_id) {
                return Ok(AccessOutcome::IdBound { subscriber_id: subscriber });
            }
        }

        self.grant(member_id, &subscriber, "access").await
    }

    async fn reply(&self, member_id: MemberId, outcome: &AccessOutcome) {
        if let Some(text) = outcome.reply() {
            if let Err(e) = self.guild.send_direct_message(member_id, &text).await {
                warn!(member = %member_id, error = %e, "reply not delivered");
            }
        }
    }

    /// Forced check of `subscriber`; on success bind and grant.
    async fn grant(&self, member_id: MemberId, subscriber: &SubscriberId, actor: &str) -> Result<AccessOutcome> {
        let fees = self.fees.cached_or_resolve(&*self.billing).await?;

        let lock = self.member_locks.lock_for(member_id);
        let _guard = lock.lock().await;

        let Some(member) = self.guild.member(member_id).await? else {
            return Ok(AccessOutcome::Ignored);
        };

        let ledger = self.users.refresh(&*self.billing, subscriber).await?;
        let Some(role) = self.policy.desired_role(ledger.as_ref(), &fees, self.now()) else {
            return Ok(AccessOutcome::Denied {
                subscriber_id: subscriber.clone(),
            });
        };

        self.db
            .with_conn(|conn| db::bind_member(conn, member_id, subscriber))?;
        self.record(Event::for_member(
            "member_bound",
            member_id,
            json!({ "subscriber_id": subscriber }),
            actor,
        ))?;

        let change = self.reconciler.apply(&*self.guild, &member, Some(role)).await?;
        if change.changed() {
            self.record(Event::for_member(
                change.event_type(),
                member_id,
                json!({ "subscriber_id": subscriber, "change": change }),
                actor,
            ))?;
        }

        Ok(AccessOutcome::Granted { role })
    }

    // ------------------------------------------------------------------------
    // Administrative operations
    // ------------------------------------------------------------------------

    /// Grant on the admin's behalf: no throttle, no strict check.
    pub async fn add_user(&self, subscriber: &SubscriberId, member_id: MemberId) -> Result<AccessOutcome> {
        let outcome = self.grant(member_id, subscriber, "admin").await?;
        info!(member = %member_id, subscriber = %subscriber, outcome = outcome.condition(), "add user");
        Ok(outcome)
    }

    /// Drop the binding and every managed role. Returns the subscriber the
    /// member was bound to.
    pub async fn unbind_member(&self, member_id: MemberId) -> Result<Option<SubscriberId>> {
        let lock = self.member_locks.lock_for(member_id);
        let _guard = lock.lock().await;

        let subscriber = self.db.with_conn(|conn| {
            let subscriber = db::get_binding(conn, member_id)?;
            db::unbind_member(conn, member_id)?;
            Ok(subscriber)
        })?;

        if let Some(member) = self.guild.member(member_id).await? {
            self.reconciler.apply(&*self.guild, &member, None).await?;
        }

        self.record(Event::for_member(
            "member_unbound",
            member_id,
            json!({ "subscriber_id": subscriber }),
            "admin",
        ))?;
        info!(member = %member_id, subscriber = ?subscriber, "member unbound");

        Ok(subscriber)
    }

    pub async fn unbind_subscriber(&self, subscriber: &SubscriberId) -> Result<Vec<MemberId>> {
        let members = self
            .db
            .with_conn(|conn| db::members_for_subscriber(conn, subscriber))?;
        for member_id in &members {
            self.unbind_member(*member_id).await?;
        }
        Ok(members)
    }

    pub async fn lookup_member(&self, member_id: MemberId) -> Result<MemberLookup> {
        let name = self.guild.member(member_id).await?.map(|m| m.name);
        let subscriber_id = self.db.with_conn(|conn| db::get_binding(conn, member_id))?;
        Ok(MemberLookup {
            member_id,
            name,
            subscriber_id,
        })
    }

    pub async fn lookup_subscriber(&self, subscriber: &SubscriberId) -> Result<Vec<MemberLookup>> {
        let members = self
            .db
            .with_conn(|conn| db::members_for_subscriber(conn, subscriber))?;
        let mut found = Vec::with_capacity(members.len());
        for member_id in members {
            found.push(self.lookup_member(member_id).await?);
        }
        Ok(found)
    }

    /// Remove managed roles from everyone and forget every binding. Returns
    /// the number of members that lost a role.
    pub async fn reset(&self) -> Result<usize> {
        let _bulk = self.bulk_lock.lock().await;
        let mut count = 0;

        for member in self.guild.members().await? {
            let lock = self.member_locks.lock_for(member.id);
            let _guard = lock.lock().await;

            if self.reconciler.apply(&*self.guild, &member, None).await?.changed() {
                count += 1;
            }
        }

        let bindings = self.db.with_conn(db::reset_bindings)?;
        self.record(Event::new(
            "bindings_reset",
            "guild",
            "all",
            json!({ "members_cleared": count, "bindings": bindings }),
            "admin",
        ))?;
        warn!(members = count, bindings = bindings, "all bindings reset");

        Ok(count)
    }

    /// Kick members holding no role at all once they are older than the
    /// configured age. Returns the kicked names.
    pub async fn purge(&self) -> Result<Vec<String>> {
        let _bulk = self.bulk_lock.lock().await;
        let cutoff = self.now() - self.member_age;
        let mut names = Vec::new();

        for member in self.guild.members().await? {
            if !member.roles.is_empty() || member.joined_at > cutoff {
                continue;
            }

            self.guild.kick(member.id, "Purge: no role assigned").await?;
            self.record(Event::for_member(
                "member_purged",
                member.id,
                json!({ "name": member.name, "joined_at": member.joined_at }),
                "cleanup",
            ))?;
            names.push(member.name);
        }

        if names.is_empty() {
            debug!("purge found nobody");
        } else {
            info!(count = names.len(), names = ?names, "purged members without roles");
        }

        Ok(names)
    }

    /// Forced fetch and full verdict for one subscriber. Changes no roles.
    pub async fn test_subscriber(&self, subscriber: &SubscriberId) -> Result<Entitlement> {
        let fees = self.fees.cached_or_resolve(&*self.billing).await?;
        let ledger = self.users.refresh(&*self.billing, subscriber).await?;
        Ok(self.policy.evaluate(ledger.as_ref(), &fees, self.now()))
    }

    /// Best effort: a failed delivery is only logged.
    pub async fn notify_admin(&self, text: &str) {
        let Some(admin) = self.admin_id else {
            return;
        };
        if let Err(e) = self.guild.send_direct_message(admin, text).await {
            warn!(admin = %admin, error = %e, "admin notification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_member_locks_drop_idle_entries() {
        let locks = MemberLocks::default();

        let held = locks.lock_for(MemberId(1));
        let _guard = held.lock().await;
        drop(locks.lock_for(MemberId(2)));
        assert_eq!(locks.tracked(), 2);

        // Member 2 is idle and goes; member 1 is still locked and stays
        drop(locks.lock_for(MemberId(3)));
        assert_eq!(locks.tracked(), 2);
        assert!(Arc::ptr_eq(&held, &locks.lock_for(MemberId(1))));
        assert!(held.try_lock().is_err());
    }
}
