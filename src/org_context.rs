//! Persistent "current organization" pointer per user, and membership lookup.
//!
//! The pointer is a single row per user with last-write-wins semantics. It is
//! only trusted while it still names a live membership: a pointer whose
//! membership was removed reads back as "no context" and is never moved to
//! another organization on the user's behalf.

use chrono::Utc;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::authz::role::UnknownRole;
use crate::authz::{CurrentOrganization, OrgContext, Role};
use crate::error::AppError;
use crate::models::{NewOrganizationContextRow, OrganizationContextRow};
use crate::schema::{organization_memberships, organizations, user_organization_contexts};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MembershipSummary {
    pub organization_id: Uuid,
    pub organization_name: String,
    pub organization_type: String,
    pub role: Role,
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("no active membership in this organization")]
    NoMembership,
    #[error("stored membership is invalid: {0}")]
    InvalidRole(#[from] UnknownRole),
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
}

pub type ContextResult<T> = Result<T, ContextError>;

impl From<ContextError> for AppError {
    fn from(value: ContextError) -> Self {
        match value {
            ContextError::NoMembership => {
                AppError::not_found_with("organization not found or not accessible")
            }
            ContextError::InvalidRole(err) => AppError::internal(err),
            ContextError::Database(err) => AppError::from(err),
        }
    }
}

/// Role the user holds in `organization_id`, if the membership is live and the
/// organization is active.
pub fn live_role(
    conn: &mut PgConnection,
    user_id: Uuid,
    organization_id: Uuid,
) -> ContextResult<Option<Role>> {
    let role: Option<String> = organization_memberships::table
        .inner_join(organizations::table)
        .filter(organization_memberships::user_id.eq(user_id))
        .filter(organization_memberships::organization_id.eq(organization_id))
        .filter(organization_memberships::is_active.eq(true))
        .filter(organization_memberships::is_deleted.eq(false))
        .filter(organizations::is_active.eq(true))
        .select(organization_memberships::role)
        .first(conn)
        .optional()?;

    Ok(role.map(|raw| raw.parse::<Role>()).transpose()?)
}

/// Points the user at `organization_id`. Leaves the existing pointer untouched
/// when the user has no live membership there.
pub fn set_current(
    conn: &mut PgConnection,
    user_id: Uuid,
    organization_id: Uuid,
) -> ContextResult<CurrentOrganization> {
    let role = live_role(conn, user_id, organization_id)?.ok_or(ContextError::NoMembership)?;

    let now = Utc::now().naive_utc();
    let row = NewOrganizationContextRow {
        user_id,
        organization_id,
        updated_at: now,
    };
    diesel::insert_into(user_organization_contexts::table)
        .values(&row)
        .on_conflict(user_organization_contexts::user_id)
        .do_update()
        .set((
            user_organization_contexts::organization_id.eq(organization_id),
            user_organization_contexts::updated_at.eq(now),
        ))
        .execute(conn)?;

    tracing::info!(
        user_id = %user_id,
        organization_id = %organization_id,
        role = %role,
        "switched current organization"
    );

    Ok(CurrentOrganization {
        organization_id,
        role,
    })
}

/// The organization the user currently acts as, or `None` when no pointer is
/// set or the pointer no longer names a live membership.
pub fn get_current(
    conn: &mut PgConnection,
    user_id: Uuid,
) -> ContextResult<Option<CurrentOrganization>> {
    let pointer: Option<OrganizationContextRow> = user_organization_contexts::table
        .find(user_id)
        .first(conn)
        .optional()?;

    let Some(pointer) = pointer else {
        return Ok(None);
    };

    match live_role(conn, user_id, pointer.organization_id)? {
        Some(role) => Ok(Some(CurrentOrganization {
            organization_id: pointer.organization_id,
            role,
        })),
        None => {
            tracing::debug!(
                user_id = %user_id,
                organization_id = %pointer.organization_id,
                "current organization pointer is dangling"
            );
            Ok(None)
        }
    }
}

/// Authorization context read from the store instead of the session token.
pub fn resolve_context(conn: &mut PgConnection, user_id: Uuid) -> ContextResult<OrgContext> {
    Ok(OrgContext::new(user_id, get_current(conn, user_id)?))
}

/// All live memberships of the user, ordered by organization name.
pub fn list_memberships(
    conn: &mut PgConnection,
    user_id: Uuid,
) -> ContextResult<Vec<MembershipSummary>> {
    let rows: Vec<(Uuid, String, String, String)> = organization_memberships::table
        .inner_join(organizations::table)
        .filter(organization_memberships::user_id.eq(user_id))
        .filter(organization_memberships::is_active.eq(true))
        .filter(organization_memberships::is_deleted.eq(false))
        .filter(organizations::is_active.eq(true))
        .order(organizations::name.asc())
        .select((
            organizations::id,
            organizations::name,
            organizations::organization_type,
            organization_memberships::role,
        ))
        .load(conn)?;

    let mut memberships = Vec::with_capacity(rows.len());
    for (organization_id, organization_name, organization_type, role) in rows {
        memberships.push(MembershipSummary {
            organization_id,
            organization_name,
            organization_type,
            role: role.parse()?,
        });
    }
    Ok(memberships)
}
