// Patron Gate - Core Library
// Billing ledger → subscription verdict → community role. Exposes all modules
// for the CLI, the admin API server, and tests.

pub mod error;
pub mod config;
pub mod logging;
pub mod db;
pub mod ledger;         // Raw charges + same-period compression
pub mod coverage;       // Latest unbroken subscription run
pub mod plan;           // Run → plan id (fee map, timeline tie-break)
pub mod entitlement;    // Plan → desired role (fallback, resolution modes)
pub mod rate_limiter;
pub mod retry;
pub mod billing;        // Billing provider boundary + HTTP client
pub mod fee_lookup;
pub mod user_cache;
pub mod guild;          // Chat platform boundary + in-memory guild
pub mod reconciliation; // Minimal idempotent role correction
pub mod access;
pub mod sync;
pub mod scheduler;

// Re-export commonly used types
pub use error::{Result, SyncError};
pub use config::Config;
pub use logging::{init_logging, LogFormat};
pub use db::{
    Database, Event, MembershipBinding, UserRecord,
    setup_database, insert_event, get_events_for_entity,
};
pub use ledger::{BillingPeriod, RawCharge, SupporterRecord, Transaction, compress};
pub use coverage::{CoverageRun, analyze};
pub use plan::{PlanFeeMap, PlanId, PlanResolver, ResolutionMode, compute_highest_plan_id};
pub use entitlement::{Entitlement, EntitlementPolicy};
pub use rate_limiter::RateLimiter;
pub use retry::{RetryPolicy, retry_with_backoff};
pub use billing::{BillingClient, CatalogPlan, FanboxClient, SubscriberId};
pub use fee_lookup::FeeLookupCache;
pub use user_cache::{CacheContext, UserDataCache};
pub use guild::{Guild, Member, MemberId, MemoryGuild, RoleId};
pub use reconciliation::{RoleChange, RoleReconciler};
pub use access::{AccessOutcome, AccessThrottle, extract_subscriber_id};
pub use sync::{Clock, MemberLookup, SweepReport, SyncService};
pub use scheduler::{ActivitySchedule, ReconciliationScheduler, run_periodic};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
