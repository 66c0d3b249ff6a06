use anyhow::{bail, Context, Result};
use std::env;
use std::sync::Arc;

use patron_gate::db;
use patron_gate::{
    init_logging, Config, Database, FanboxClient, FeeLookupCache, MemberId, MemoryGuild,
    RateLimiter, SubscriberId, SyncService,
};

const USAGE: &str = "usage: patron-gate <check SUBSCRIBER_ID | catalog | binding MEMBER_ID | events MEMBER_ID>";

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    let config = Config::load_default().context("loading configuration")?;
    init_logging(config.log.format, config.log.file.as_deref())?;

    match args.get(1).map(String::as_str) {
        Some("check") => run_check(&config, arg(&args, 2)?).await?,
        Some("catalog") => run_catalog(&config).await?,
        Some("binding") => run_binding(&config, member_arg(&args)?)?,
        Some("events") => run_events(&config, member_arg(&args)?)?,
        _ => bail!(USAGE),
    }

    Ok(())
}

fn arg<'a>(args: &'a [String], index: usize) -> Result<&'a str> {
    args.get(index)
        .map(String::as_str)
        .with_context(|| USAGE.to_string())
}

fn member_arg(args: &[String]) -> Result<MemberId> {
    let raw = arg(args, 2)?;
    let id = raw
        .parse::<u64>()
        .with_context(|| format!("member id must be numeric, got {:?}", raw))?;
    Ok(MemberId(id))
}

fn open_database(config: &Config) -> Result<Arc<Database>> {
    let db = Database::open(&config.database_path)
        .with_context(|| format!("opening {:?}", config.database_path))?;
    Ok(Arc::new(db))
}

fn billing_client(config: &Config) -> Result<Arc<FanboxClient>> {
    let limiter = Arc::new(RateLimiter::from_secs(config.billing.rate_limit_seconds));
    Ok(Arc::new(FanboxClient::new(&config.billing, limiter)?))
}

/// Forced fetch + verdict for one subscriber. Touches no roles.
async fn run_check(config: &Config, subscriber: &str) -> Result<()> {
    let subscriber = SubscriberId::new(subscriber);
    println!("🔍 Checking subscriber {}", subscriber);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let service = SyncService::new(
        config,
        Arc::new(MemoryGuild::new()),
        billing_client(config)?,
        open_database(config)?,
    );
    let verdict = service.test_subscriber(&subscriber).await?;

    println!("✓ Coverage active: {}", verdict.coverage_active);
    match (&verdict.plan, verdict.role) {
        (Some(plan), Some(role)) => println!("✅ Plan {} → role {}", plan, role),
        (None, Some(role)) => println!("✅ No plan resolved → fallback role {}", role),
        (Some(plan), None) => println!("⚠️  Plan {} has no configured role", plan),
        (None, None) => println!("❌ No active plan"),
    }

    Ok(())
}

async fn run_catalog(config: &Config) -> Result<()> {
    println!("💴 Refreshing fee lookup");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let cache = FeeLookupCache::new(open_database(config)?);
    let fees = cache.resolve(billing_client(config)?.as_ref()).await?;

    for (fee, plan) in fees.iter() {
        let role = config
            .plan_roles
            .get(plan)
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("  {:>8}  plan {:<12} role {}", fee, plan.as_str(), role);
    }
    println!("✓ {} fees known", fees.len());

    Ok(())
}

fn run_binding(config: &Config, member: MemberId) -> Result<()> {
    let store = open_database(config)?;
    match store.with_conn(|conn| db::get_binding(conn, member))? {
        Some(subscriber) => println!("✓ Member {} is bound to subscriber {}", member, subscriber),
        None => println!("❌ Member {} is not bound", member),
    }
    Ok(())
}

fn run_events(config: &Config, member: MemberId) -> Result<()> {
    let store = open_database(config)?;
    let events = store.with_conn(|conn| db::get_events_for_entity(conn, "member", &member.to_string()))?;

    println!("📜 {} events for member {}", events.len(), member);
    for event in events {
        println!(
            "  {}  {:<16} by {:<8} {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.event_type,
            event.actor,
            event.data
        );
    }
    Ok(())
}
