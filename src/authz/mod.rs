//! Authorization against the caller's current organization.
//!
//! Every privileged request builds an [`OrgContext`] once (from the session
//! token, or from the context store for mutations) and passes it explicitly to
//! [`OrgContext::authorize`]. Membership mutations additionally go through the
//! guards at the bottom of this module, which encode the manager and
//! administrator overlays on top of the plain role ladder.

pub mod permissions;
pub mod role;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use permissions::Action;
pub use role::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentOrganization {
    pub organization_id: Uuid,
    pub role: Role,
}

/// Who is acting and as which organization, for the lifetime of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgContext {
    pub user_id: Uuid,
    pub current: Option<CurrentOrganization>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthzError {
    #[error("no organization selected")]
    NoOrganization,
    #[error("switch to this organization first")]
    OtherOrganization,
    #[error("{action} requires {required} or higher")]
    InsufficientRole { action: Action, required: Role },
    #[error("{0}")]
    Denied(&'static str),
}

impl OrgContext {
    pub fn new(user_id: Uuid, current: Option<CurrentOrganization>) -> Self {
        Self { user_id, current }
    }

    /// Allow or deny `action` in the current organization.
    pub fn authorize(&self, action: Action) -> Result<CurrentOrganization, AuthzError> {
        let current = self.current.ok_or(AuthzError::NoOrganization)?;
        let required = action.minimum_role();
        if !current.role.satisfies(required) {
            return Err(AuthzError::InsufficientRole { action, required });
        }
        Ok(current)
    }

    /// Like [`authorize`](Self::authorize), but also requires `organization_id`
    /// to be the organization the caller is currently acting as.
    pub fn authorize_in(
        &self,
        organization_id: Uuid,
        action: Action,
    ) -> Result<CurrentOrganization, AuthzError> {
        let current = self.current.ok_or(AuthzError::NoOrganization)?;
        if current.organization_id != organization_id {
            return Err(AuthzError::OtherOrganization);
        }
        self.authorize(action)
    }
}

/// What a role assignment is being applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleTarget {
    /// A membership that does not exist yet (invitation creation).
    NewGrant,
    /// A pending invitation whose proposed role is being changed.
    PendingInvitation { proposed: Role },
    /// An existing member whose role is being changed.
    Member { user_id: Uuid, role: Role },
}

/// Checks whether `actor` (acting with `actor_role`) may give `new_role` to
/// `target`.
///
/// Managers are capped at MANAGER and may never touch an administrator.
/// Administrators may change their own entry but not another administrator's.
/// Nobody may grant a role above their own or modify a member who outranks
/// them.
pub fn ensure_can_assign_role(
    actor: Uuid,
    actor_role: Role,
    target: RoleTarget,
    new_role: Role,
) -> Result<(), AuthzError> {
    if !actor_role.satisfies(Role::Manager) {
        return Err(AuthzError::Denied("managing roles requires MANAGER or higher"));
    }

    if actor_role == Role::Manager {
        if new_role == Role::Administrator {
            return Err(AuthzError::Denied("managers cannot grant the ADMINISTRATOR role"));
        }
        let touches_admin = match target {
            RoleTarget::NewGrant => false,
            RoleTarget::PendingInvitation { proposed } => proposed == Role::Administrator,
            RoleTarget::Member { role, .. } => role == Role::Administrator,
        };
        if touches_admin {
            return Err(AuthzError::Denied("managers cannot modify an administrator"));
        }
    }

    if !actor_role.satisfies(new_role) {
        return Err(AuthzError::Denied("cannot grant a role above your own"));
    }

    match target {
        RoleTarget::NewGrant => Ok(()),
        RoleTarget::PendingInvitation { proposed } => {
            if actor_role.satisfies(proposed) {
                Ok(())
            } else {
                Err(AuthzError::Denied(
                    "cannot modify an invitation above your own role",
                ))
            }
        }
        RoleTarget::Member { user_id, role } => {
            ensure_can_modify_member(actor, actor_role, user_id, role)
        }
    }
}

/// Checks whether `actor` may modify or remove the membership of `target_user`
/// who currently holds `target_role`.
pub fn ensure_can_modify_member(
    actor: Uuid,
    actor_role: Role,
    target_user: Uuid,
    target_role: Role,
) -> Result<(), AuthzError> {
    if actor == target_user {
        return Ok(());
    }
    if actor_role == Role::Manager && target_role == Role::Administrator {
        return Err(AuthzError::Denied("managers cannot modify an administrator"));
    }
    if actor_role == Role::Administrator && target_role == Role::Administrator {
        return Err(AuthzError::Denied("administrators cannot change another administrator"));
    }
    if !actor_role.satisfies(target_role) {
        return Err(AuthzError::Denied("cannot modify a member who outranks you"));
    }
    Ok(())
}
