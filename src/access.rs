// 🔑 Access - Interactive check building blocks
//
// A member DMs something containing their subscriber id. We pull out the first
// run of digits, throttle repeat askers, and answer with one AccessOutcome.

use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
use tokio::time::Instant;

use crate::billing::SubscriberId;
use crate::guild::{MemberId, RoleId};

// ============================================================================
// OUTCOME
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AccessOutcome {
    /// Sender is not a member of the community; nothing is sent back
    Ignored,
    RateLimited { retry_after_seconds: u64 },
    NoIdFound,
    /// Strict mode: the id already belongs to another member
    IdBound { subscriber_id: SubscriberId },
    Denied { subscriber_id: SubscriberId },
    Granted { role: RoleId },
    SystemError,
}

impl AccessOutcome {
    pub fn condition(&self) -> &'static str {
        match self {
            AccessOutcome::Ignored => "ignored",
            AccessOutcome::RateLimited { .. } => "rate_limited",
            AccessOutcome::NoIdFound => "no_id_found",
            AccessOutcome::IdBound { .. } => "id_bound",
            AccessOutcome::Denied { .. } => "access_denied",
            AccessOutcome::Granted { .. } => "access_granted",
            AccessOutcome::SystemError => "system_error",
        }
    }

    /// Reply sent to the member, None for `Ignored`.
    pub fn reply(&self) -> Option<String> {
        let text = match self {
            AccessOutcome::Ignored => return None,
            AccessOutcome::RateLimited { retry_after_seconds } => format!(
                "You are sending requests too quickly. Please wait {} seconds and try again.",
                retry_after_seconds
            ),
            AccessOutcome::NoIdFound => {
                "No subscriber id found in your message. Please send your numeric id.".to_string()
            }
            AccessOutcome::IdBound { subscriber_id } => {
                format!("Id {} is already bound to another member.", subscriber_id)
            }
            AccessOutcome::Denied { subscriber_id } => {
                format!("Id {} has no active subscription.", subscriber_id)
            }
            AccessOutcome::Granted { .. } => "Access granted. Welcome!".to_string(),
            AccessOutcome::SystemError => {
                "Something went wrong on our side. Please try again later.".to_string()
            }
        };
        Some(text)
    }
}

// ============================================================================
// ID EXTRACTION
// ============================================================================

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\d+)").expect("ID_PATTERN is a valid regex pattern"))
}

/// First run of ASCII digits in the message.
pub fn extract_subscriber_id(message: &str) -> Option<SubscriberId> {
    id_pattern()
        .captures(message)
        .and_then(|caps| caps.get(1))
        .map(|m| SubscriberId::new(m.as_str()))
}

// ============================================================================
// THROTTLE
// ============================================================================

/// Per-member gate: one check per `interval`. A throttled attempt does not
/// push the gate further out.
#[derive(Debug)]
pub struct AccessThrottle {
    interval: Duration,
    gates: Mutex<HashMap<MemberId, Instant>>,
}

impl AccessThrottle {
    pub fn new(interval: Duration) -> Self {
        AccessThrottle {
            interval,
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Ok(()) when the member may proceed (and stamps the gate), otherwise the
    /// time left until the gate opens.
    pub fn check(&self, member: MemberId) -> Result<(), Duration> {
        let now = Instant::now();
        let mut gates = self.gates.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        gates.retain(|_, gate| *gate > now);

        match gates.get(&member) {
            Some(gate) if now < *gate => Err(*gate - now),
            _ => {
                gates.insert(member, now + self.interval);
                Ok(())
            }
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.gates.lock().map(|gates| gates.len()).unwrap_or(0)
    }
}
