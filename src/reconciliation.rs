// ⚖️ Role Reconciler - Make held roles match the desired role
//
// The managed roles form a mutually exclusive set. After `apply` a member holds
// exactly the desired role from that set (or none of them), and roles outside
// the set are never touched.
//
//   desired none, set roles held         → remove them all
//   desired held, nothing else from set  → no-op
//   desired held alongside strays        → remove strays
//   desired not held                     → remove set roles, add desired
//
// If the add fails after the removal went through, the removed roles are put
// back so the member is not left holding nothing until their next check.

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::Result;
use crate::guild::{Guild, Member, RoleId};

// ============================================================================
// ROLE CHANGE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleChange {
    /// Member already in the desired state
    Unchanged,

    /// Entitlement gone: every managed role removed
    Revoked { removed: Vec<RoleId> },

    /// Desired role added (and any other managed roles removed)
    Granted { role: RoleId, removed: Vec<RoleId> },

    /// Desired role was held together with other managed roles
    Corrected { removed: Vec<RoleId> },
}

impl RoleChange {
    pub fn changed(&self) -> bool {
        !matches!(self, RoleChange::Unchanged)
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            RoleChange::Unchanged => "role_unchanged",
            RoleChange::Revoked { .. } => "role_revoked",
            RoleChange::Granted { .. } => "role_granted",
            RoleChange::Corrected { .. } => "role_corrected",
        }
    }

    pub fn summary(&self) -> String {
        match self {
            RoleChange::Unchanged => "unchanged".to_string(),
            RoleChange::Revoked { removed } => format!("revoked {:?}", removed),
            RoleChange::Granted { role, removed } if removed.is_empty() => format!("granted {}", role),
            RoleChange::Granted { role, removed } => format!("granted {} (replaced {:?})", role, removed),
            RoleChange::Corrected { removed } => format!("removed strays {:?}", removed),
        }
    }
}

// ============================================================================
// RECONCILER
// ============================================================================

#[derive(Debug, Clone)]
pub struct RoleReconciler {
    role_set: Vec<RoleId>,
}

impl RoleReconciler {
    pub fn new(role_set: Vec<RoleId>) -> Self {
        RoleReconciler { role_set }
    }

    pub fn role_set(&self) -> &[RoleId] {
        &self.role_set
    }

    /// Managed roles the member currently holds.
    pub fn held(&self, member: &Member) -> Vec<RoleId> {
        self.role_set
            .iter()
            .copied()
            .filter(|role| member.has_role(*role))
            .collect()
    }

    /// Decide the minimal correction without touching the platform.
    pub fn plan(&self, member: &Member, desired: Option<RoleId>) -> RoleChange {
        let held = self.held(member);

        match desired {
            None if held.is_empty() => RoleChange::Unchanged,
            None => RoleChange::Revoked { removed: held },
            Some(role) if held.contains(&role) => {
                let strays: Vec<RoleId> = held.into_iter().filter(|r| *r != role).collect();
                if strays.is_empty() {
                    RoleChange::Unchanged
                } else {
                    RoleChange::Corrected { removed: strays }
                }
            }
            Some(role) => RoleChange::Granted { role, removed: held },
        }
    }

    /// Apply the correction. Removals go first so the member never holds two
    /// managed roles at once.
    pub async fn apply<G: Guild + ?Sized>(
        &self,
        guild: &G,
        member: &Member,
        desired: Option<RoleId>,
    ) -> Result<RoleChange> {
        let change = self.plan(member, desired);

        match &change {
            RoleChange::Unchanged => {}
            RoleChange::Revoked { removed } | RoleChange::Corrected { removed } => {
                guild.remove_roles(member.id, removed).await?;
            }
            RoleChange::Granted { role, removed } => {
                if !removed.is_empty() {
                    guild.remove_roles(member.id, removed).await?;
                }
                if let Err(e) = guild.add_role(member.id, *role).await {
                    warn!(member = %member.id, role = %role, error = %e, "grant failed after removal, restoring previous roles");
                    for previous in removed {
                        if let Err(restore) = guild.add_role(member.id, *previous).await {
                            error!(member = %member.id, role = %previous, error = %restore, "restore failed, member holds no managed role");
                        }
                    }
                    return Err(e);
                }
            }
        }

        Ok(change)
    }
}

// ============================================================================
// TESTS
// ============================================================================
