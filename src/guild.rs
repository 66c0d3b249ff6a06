// 🏛️ Guild - The chat platform boundary
//
// The community lives on a chat platform we don't model. Everything the
// reconciler needs from it fits in the `Guild` trait: look members up, list
// them, change roles, kick, send a direct message. `MemoryGuild` is a complete
// in-process implementation for dry runs and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use crate::error::{Result, SyncError};

// ============================================================================
// IDENTIFIERS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleId(pub u64);

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// MEMBER SNAPSHOT
// ============================================================================

/// Point-in-time view of one guild member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub name: String,
    /// Every role held, managed or not (the implicit everyone-role excluded)
    pub roles: Vec<RoleId>,
    pub joined_at: DateTime<Utc>,
}

impl Member {
    pub fn has_role(&self, role: RoleId) -> bool {
        self.roles.contains(&role)
    }

    pub fn has_any_role(&self, roles: &[RoleId]) -> bool {
        roles.iter().any(|role| self.has_role(*role))
    }
}

// ============================================================================
// PLATFORM TRAIT
// ============================================================================

#[async_trait]
pub trait Guild: Send + Sync {
    /// None when the user is not (or no longer) a member.
    async fn member(&self, id: MemberId) -> Result<Option<Member>>;

    async fn members(&self) -> Result<Vec<Member>>;

    async fn add_role(&self, member: MemberId, role: RoleId) -> Result<()>;

    async fn remove_roles(&self, member: MemberId, roles: &[RoleId]) -> Result<()>;

    async fn kick(&self, member: MemberId, reason: &str) -> Result<()>;

    async fn send_direct_message(&self, member: MemberId, content: &str) -> Result<()>;
}

// ============================================================================
// IN-MEMORY GUILD
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    members: BTreeMap<MemberId, Member>,
    messages: Vec<(MemberId, String)>,
    kicked: Vec<MemberId>,
    role_mutations: usize,
}

/// Guild held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryGuild {
    state: Mutex<MemoryState>,
}

impl MemoryGuild {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_members(members: impl IntoIterator<Item = Member>) -> Self {
        let guild = Self::new();
        for member in members {
            guild.insert(member);
        }
        guild
    }

    pub fn insert(&self, member: Member) {
        if let Ok(mut state) = self.state.lock() {
            state.members.insert(member.id, member);
        }
    }

    pub fn roles_of(&self, id: MemberId) -> Vec<RoleId> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.members.get(&id).map(|m| m.roles.clone()))
            .unwrap_or_default()
    }

    pub fn messages(&self) -> Vec<(MemberId, String)> {
        self.state.lock().map(|s| s.messages.clone()).unwrap_or_default()
    }

    pub fn kicked(&self) -> Vec<MemberId> {
        self.state.lock().map(|s| s.kicked.clone()).unwrap_or_default()
    }

    /// Count of add/remove calls that actually reached the platform.
    pub fn role_mutations(&self) -> usize {
        self.state.lock().map(|s| s.role_mutations).unwrap_or_default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> Result<T>) -> Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| SyncError::Platform("memory guild poisoned".to_string()))?;
        f(&mut state)
    }
}

fn unknown_member(id: MemberId) -> SyncError {
    SyncError::Platform(format!("unknown member {}", id))
}

#[async_trait]
impl Guild for MemoryGuild {
    async fn member(&self, id: MemberId) -> Result<Option<Member>> {
        self.with_state(|state| Ok(state.members.get(&id).cloned()))
    }

    async fn members(&self) -> Result<Vec<Member>> {
        self.with_state(|state| Ok(state.members.values().cloned().collect()))
    }

    async fn add_role(&self, member: MemberId, role: RoleId) -> Result<()> {
        self.with_state(|state| {
            let entry = state.members.get_mut(&member).ok_or_else(|| unknown_member(member))?;
            if !entry.roles.contains(&role) {
                entry.roles.push(role);
            }
            state.role_mutations += 1;
            Ok(())
        })
    }

    async fn remove_roles(&self, member: MemberId, roles: &[RoleId]) -> Result<()> {
        self.with_state(|state| {
            let entry = state.members.get_mut(&member).ok_or_else(|| unknown_member(member))?;
            entry.roles.retain(|role| !roles.contains(role));
            state.role_mutations += 1;
            Ok(())
        })
    }

    async fn kick(&self, member: MemberId, _reason: &str) -> Result<()> {
        self.with_state(|state| {
            state.members.remove(&member).ok_or_else(|| unknown_member(member))?;
            state.kicked.push(member);
            Ok(())
        })
    }

    async fn send_direct_message(&self, member: MemberId, content: &str) -> Result<()> {
        self.with_state(|state| {
            state.messages.push((member, content.to_string()));
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: u64, roles: &[u64]) -> Member {
        Member {
            id: MemberId(id),
            name: format!("user{}", id),
            roles: roles.iter().map(|r| RoleId(*r)).collect(),
            joined_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_guild_role_mutation() {
        let guild = MemoryGuild::with_members([member(1, &[10])]);

        guild.add_role(MemberId(1), RoleId(20)).await.unwrap();
        assert_eq!(guild.roles_of(MemberId(1)), vec![RoleId(10), RoleId(20)]);

        guild.remove_roles(MemberId(1), &[RoleId(10), RoleId(99)]).await.unwrap();
        assert_eq!(guild.roles_of(MemberId(1)), vec![RoleId(20)]);
        assert_eq!(guild.role_mutations(), 2);
    }

    #[tokio::test]
    async fn test_memory_guild_unknown_member() {
        let guild = MemoryGuild::new();
        assert!(guild.member(MemberId(7)).await.unwrap().is_none());
        assert!(guild.add_role(MemberId(7), RoleId(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_kick_removes_member() {
        let guild = MemoryGuild::with_members([member(1, &[]), member(2, &[])]);
        guild.kick(MemberId(1), "purge").await.unwrap();
        assert_eq!(guild.members().await.unwrap().len(), 1);
        assert_eq!(guild.kicked(), vec![MemberId(1)]);
    }

    #[test]
    fn test_member_role_queries() {
        let m = member(1, &[10, 11]);
        assert!(m.has_role(RoleId(10)));
        assert!(m.has_any_role(&[RoleId(99), RoleId(11)]));
        assert!(!m.has_any_role(&[RoleId(99)]));
    }
}
