// 🗄️ Registry Database - SQLite (WAL) for caches, bindings, and audit events
//
// Key-value usage only:
//   user_data       subscriber → last fetched ledger (NULL = provider said not-found)
//   member_binding  member → subscriber
//   fee_lookup      fee → plan (additive; discontinued plans are never deleted)
//   events          audit trail of every grant / revoke / bind / unbind

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

use crate::billing::SubscriberId;
use crate::error::{Result, SyncError};
use crate::guild::MemberId;
use crate::ledger::SupporterRecord;
use crate::plan::{PlanFeeMap, PlanId};

// ============================================================================
// RECORDS
// ============================================================================

/// Cached ledger for one subscriber. Owned by the user data cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub subscriber_id: SubscriberId,

    /// None = the last refresh came back not-found
    pub ledger: Option<SupporterRecord>,

    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipBinding {
    pub member_id: MemberId,
    pub subscriber_id: SubscriberId,
}

/// Event for audit trail ("every change is an event")
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }

    pub fn for_member(event_type: &str, member: MemberId, data: serde_json::Value, actor: &str) -> Self {
        Self::new(event_type, "member", &member.to_string(), data, actor)
    }
}

// ============================================================================
// SHARED HANDLE
// ============================================================================

/// One connection shared by every component. Locks are held only for the
/// duration of a single query, never across an await point.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Database> {
        let conn = Connection::open(path)?;
        setup_database(&conn)?;
        Ok(Database { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Database> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;
        Ok(Database { conn: Mutex::new(conn) })
    }

    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().map_err(|_| SyncError::LockPoisoned)?;
        f(&conn)
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery (no-op for in-memory databases)
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS user_data (
            subscriber_id TEXT PRIMARY KEY NOT NULL,
            data TEXT,
            fetched_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS member_binding (
            member_id INTEGER PRIMARY KEY NOT NULL,
            subscriber_id TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_lookup (
            fee INTEGER PRIMARY KEY NOT NULL,
            plan_id TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_binding_subscriber ON member_binding(subscriber_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

fn member_to_sql(member: MemberId) -> i64 {
    member.0 as i64
}

fn member_from_sql(value: i64) -> MemberId {
    MemberId(value as u64)
}

fn parse_timestamp(text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

// ============================================================================
// USER DATA
// ============================================================================

pub fn get_user_record(conn: &Connection, subscriber: &SubscriberId) -> Result<Option<UserRecord>> {
    let row: Option<(Option<String>, String)> = conn
        .query_row(
            "SELECT data, fetched_at FROM user_data WHERE subscriber_id = ?1",
            params![subscriber.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some((data, fetched_at)) = row else {
        return Ok(None);
    };

    let ledger = match data {
        Some(json) => Some(serde_json::from_str(&json)?),
        None => None,
    };

    Ok(Some(UserRecord {
        subscriber_id: subscriber.clone(),
        ledger,
        fetched_at: parse_timestamp(&fetched_at)?,
    }))
}

/// Overwrite the cached record (including explicit not-found markers).
pub fn put_user_record(conn: &Connection, record: &UserRecord) -> Result<()> {
    let data = match &record.ledger {
        Some(ledger) => Some(serde_json::to_string(ledger)?),
        None => None,
    };

    conn.execute(
        "REPLACE INTO user_data (subscriber_id, data, fetched_at) VALUES (?1, ?2, ?3)",
        params![record.subscriber_id.as_str(), data, record.fetched_at.to_rfc3339()],
    )?;

    Ok(())
}

// ============================================================================
// MEMBERSHIP BINDINGS
// ============================================================================

pub fn get_binding(conn: &Connection, member: MemberId) -> Result<Option<SubscriberId>> {
    let subscriber: Option<String> = conn
        .query_row(
            "SELECT subscriber_id FROM member_binding WHERE member_id = ?1",
            params![member_to_sql(member)],
            |row| row.get(0),
        )
        .optional()?;

    Ok(subscriber.map(SubscriberId::new))
}

/// Bind (or rebind) a member. A member has at most one subscriber.
pub fn bind_member(conn: &Connection, member: MemberId, subscriber: &SubscriberId) -> Result<()> {
    conn.execute(
        "REPLACE INTO member_binding (member_id, subscriber_id) VALUES (?1, ?2)",
        params![member_to_sql(member), subscriber.as_str()],
    )?;
    Ok(())
}

pub fn members_for_subscriber(conn: &Connection, subscriber: &SubscriberId) -> Result<Vec<MemberId>> {
    let mut stmt = conn.prepare(
        "SELECT member_id FROM member_binding WHERE subscriber_id = ?1 ORDER BY member_id",
    )?;

    let members = stmt
        .query_map(params![subscriber.as_str()], |row| row.get::<_, i64>(0))?
        .map(|r| r.map(member_from_sql))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(members)
}

/// Returns true when a binding existed.
pub fn unbind_member(conn: &Connection, member: MemberId) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM member_binding WHERE member_id = ?1",
        params![member_to_sql(member)],
    )?;
    Ok(deleted > 0)
}

pub fn reset_bindings(conn: &Connection) -> Result<usize> {
    let deleted = conn.execute("DELETE FROM member_binding", [])?;
    Ok(deleted)
}

pub fn all_bindings(conn: &Connection) -> Result<Vec<MembershipBinding>> {
    let mut stmt = conn.prepare("SELECT member_id, subscriber_id FROM member_binding ORDER BY member_id")?;

    let bindings = stmt
        .query_map([], |row| {
            Ok(MembershipBinding {
                member_id: member_from_sql(row.get(0)?),
                subscriber_id: SubscriberId::new(row.get::<_, String>(1)?),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(bindings)
}

// ============================================================================
// FEE LOOKUP
// ============================================================================

pub fn load_fee_lookup(conn: &Connection) -> Result<PlanFeeMap> {
    let mut stmt = conn.prepare("SELECT fee, plan_id FROM fee_lookup")?;

    let fees = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, PlanId(row.get(1)?))))?
        .collect::<std::result::Result<PlanFeeMap, _>>()?;

    Ok(fees)
}

/// Upsert every entry. Never deletes, so stale-only keys survive.
pub fn store_fee_lookup(conn: &Connection, fees: &PlanFeeMap) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let tx = conn.unchecked_transaction()?;
    for (fee, plan) in fees.iter() {
        tx.execute(
            "REPLACE INTO fee_lookup (fee, plan_id, updated_at) VALUES (?1, ?2, ?3)",
            params![fee, plan.as_str(), now],
        )?;
    }
    tx.commit()?;
    Ok(())
}

// ============================================================================
// AUDIT EVENTS
// ============================================================================

pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Newest first.
pub fn get_events_for_entity(conn: &Connection, entity_type: &str, entity_id: &str) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY id DESC",
    )?;

    let rows = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp: String = row.get(1)?;
            let data: String = row.get(5)?;
            Ok((
                row.get::<_, String>(0)?,
                parse_timestamp(&timestamp)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                data,
                row.get::<_, String>(6)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(event_id, timestamp, event_type, entity_type, entity_id, data, actor)| {
            Ok(Event {
                event_id,
                timestamp,
                event_type,
                entity_type,
                entity_id,
                data: serde_json::from_str(&data)?,
                actor,
            })
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::RawCharge;

    fn sample_ledger() -> SupporterRecord {
        SupporterRecord::new(vec![RawCharge {
            amount: 500,
            billing_period: "2024-05".parse().unwrap(),
            date: DateTime::parse_from_rfc3339("2024-05-14T00:00:00+09:00").unwrap(),
        }])
    }

    #[test]
    fn test_user_record_roundtrip_and_not_found_marker() {
        let db = Database::open_in_memory().unwrap();
        let id = SubscriberId::new("12345");

        db.with_conn(|c| {
            assert!(get_user_record(c, &id)?.is_none());

            put_user_record(c, &UserRecord {
                subscriber_id: id.clone(),
                ledger: Some(sample_ledger()),
                fetched_at: Utc::now(),
            })?;
            let stored = get_user_record(c, &id)?.unwrap();
            assert_eq!(stored.ledger, Some(sample_ledger()));

            put_user_record(c, &UserRecord {
                subscriber_id: id.clone(),
                ledger: None,
                fetched_at: Utc::now(),
            })?;
            let marker = get_user_record(c, &id)?.unwrap();
            assert!(marker.ledger.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_bindings() {
        let db = Database::open_in_memory().unwrap();
        let sub = SubscriberId::new("777");

        db.with_conn(|c| {
            bind_member(c, MemberId(1), &sub)?;
            bind_member(c, MemberId(2), &sub)?;
            assert_eq!(get_binding(c, MemberId(1))?, Some(sub.clone()));
            assert_eq!(members_for_subscriber(c, &sub)?, vec![MemberId(1), MemberId(2)]);

            // Rebinding replaces, never duplicates
            bind_member(c, MemberId(1), &SubscriberId::new("888"))?;
            assert_eq!(members_for_subscriber(c, &sub)?, vec![MemberId(2)]);

            assert!(unbind_member(c, MemberId(2))?);
            assert!(!unbind_member(c, MemberId(2))?);
            assert_eq!(all_bindings(c)?.len(), 1);

            assert_eq!(reset_bindings(c)?, 1);
            assert!(all_bindings(c)?.is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_large_member_ids_survive() {
        let db = Database::open_in_memory().unwrap();
        let big = MemberId(1_234_567_890_123_456_789);
        db.with_conn(|c| {
            bind_member(c, big, &SubscriberId::new("1"))?;
            assert_eq!(all_bindings(c)?[0].member_id, big);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_fee_lookup_never_deletes() {
        let db = Database::open_in_memory().unwrap();

        db.with_conn(|c| {
            let first: PlanFeeMap = [(300, PlanId::new("legacy")), (500, PlanId::new("1"))]
                .into_iter()
                .collect();
            store_fee_lookup(c, &first)?;

            let second: PlanFeeMap = [(500, PlanId::new("1b"))].into_iter().collect();
            store_fee_lookup(c, &second)?;

            let loaded = load_fee_lookup(c)?;
            assert_eq!(loaded.len(), 2);
            assert_eq!(loaded.get(300), Some(&PlanId::new("legacy")));
            assert_eq!(loaded.get(500), Some(&PlanId::new("1b")));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_event_log() {
        let db = Database::open_in_memory().unwrap();

        db.with_conn(|c| {
            insert_event(c, &Event::for_member("role_granted", MemberId(9), serde_json::json!({"role": 1001}), "sweep"))?;
            insert_event(c, &Event::for_member("role_revoked", MemberId(9), serde_json::json!({}), "sweep"))?;

            let events = get_events_for_entity(c, "member", "9")?;
            assert_eq!(events.len(), 2);
            assert_eq!(events[0].event_type, "role_revoked");
            assert_eq!(events[1].data["role"], 1001);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_on_disk_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");

        {
            let db = Database::open(&path).unwrap();
            db.with_conn(|c| bind_member(c, MemberId(5), &SubscriberId::new("55"))).unwrap();
        }

        let reopened = Database::open(&path).unwrap();
        let binding = reopened.with_conn(|c| get_binding(c, MemberId(5))).unwrap();
        assert_eq!(binding, Some(SubscriberId::new("55")));
    }
}
