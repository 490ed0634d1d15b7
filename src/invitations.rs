//! Invitation lifecycle: `PENDING -> ACCEPTED | DECLINED | EXPIRED`.
//!
//! Expiry is lazy. Any operation that reads a pending invitation past its
//! expiry flips it to `EXPIRED` with a single conditional update and then
//! fails; there is no background sweep. Acceptance claims the invitation and
//! creates or reactivates the membership in one transaction.

use chrono::{Duration, NaiveDateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use uuid::Uuid;

use crate::authz::role::UnknownRole;
use crate::authz::Role;
use crate::error::AppError;
use crate::models::{Invitation, NewInvitation, NewMembership, Organization, User};
use crate::schema::{organization_invitations, organization_memberships, organizations, users};

pub const STATUS_PENDING: &str = "PENDING";
pub const STATUS_ACCEPTED: &str = "ACCEPTED";
pub const STATUS_EXPIRED: &str = "EXPIRED";
pub const STATUS_DECLINED: &str = "DECLINED";

const TOKEN_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum InvitationError {
    #[error("invitation not found")]
    NotFound,
    #[error("invitation has expired")]
    Expired,
    #[error("invitation has already been processed")]
    AlreadyProcessed { status: String },
    #[error("email address must be verified before accepting an invitation")]
    EmailNotVerified,
    #[error("invitation was issued to a different email address")]
    EmailMismatch,
    #[error("a pending invitation already exists for this email")]
    DuplicatePending,
    #[error("this email already belongs to a member of the organization")]
    AlreadyMember,
    #[error("invitation carries an invalid role: {0}")]
    InvalidRole(#[from] UnknownRole),
    #[error("database error: {0}")]
    Database(#[from] DieselError),
}

pub type InvitationResult<T> = Result<T, InvitationError>;

impl From<InvitationError> for AppError {
    fn from(value: InvitationError) -> Self {
        match value {
            InvitationError::NotFound => AppError::not_found_with("invitation not found"),
            InvitationError::Expired => AppError::gone("invitation has expired"),
            InvitationError::AlreadyProcessed { status } if status == STATUS_EXPIRED => {
                AppError::gone("invitation has already been processed")
            }
            InvitationError::AlreadyProcessed { .. } => {
                AppError::not_found_with("invitation not found or already used")
            }
            err @ (InvitationError::EmailNotVerified | InvitationError::EmailMismatch) => {
                AppError::forbidden(err.to_string())
            }
            err @ (InvitationError::DuplicatePending | InvitationError::AlreadyMember) => {
                AppError::bad_request(err.to_string())
            }
            InvitationError::InvalidRole(err) => AppError::internal(err),
            InvitationError::Database(err) => AppError::from(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InvitationRequest {
    pub organization_id: Uuid,
    pub email: String,
    pub role: Role,
    pub invited_by: Uuid,
    pub ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct AcceptOutcome {
    pub invitation: Invitation,
    pub organization: Organization,
    /// Role the user holds in the organization after acceptance.
    pub role: Role,
    pub already_member: bool,
}

/// Opaque single-use invitation token, hex encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn create(
    conn: &mut PgConnection,
    request: &InvitationRequest,
) -> InvitationResult<Invitation> {
    let now = Utc::now().naive_utc();

    let expired = diesel::update(
        organization_invitations::table
            .filter(organization_invitations::organization_id.eq(request.organization_id))
            .filter(organization_invitations::email.eq(&request.email))
            .filter(organization_invitations::status.eq(STATUS_PENDING))
            .filter(organization_invitations::expires_at.le(now)),
    )
    .set((
        organization_invitations::status.eq(STATUS_EXPIRED),
        organization_invitations::updated_at.eq(now),
    ))
    .execute(conn)?;
    if expired > 0 {
        tracing::info!(
            organization_id = %request.organization_id,
            "expired stale invitation before reissuing"
        );
    }

    let member_exists = organization_memberships::table
        .inner_join(users::table)
        .filter(organization_memberships::organization_id.eq(request.organization_id))
        .filter(users::email.eq(&request.email))
        .filter(organization_memberships::is_active.eq(true))
        .filter(organization_memberships::is_deleted.eq(false))
        .select(organization_memberships::id)
        .first::<Uuid>(conn)
        .optional()?
        .is_some();
    if member_exists {
        return Err(InvitationError::AlreadyMember);
    }

    let pending_exists = organization_invitations::table
        .filter(organization_invitations::organization_id.eq(request.organization_id))
        .filter(organization_invitations::email.eq(&request.email))
        .filter(organization_invitations::status.eq(STATUS_PENDING))
        .select(organization_invitations::id)
        .first::<Uuid>(conn)
        .optional()?
        .is_some();
    if pending_exists {
        return Err(InvitationError::DuplicatePending);
    }

    let new_invitation = NewInvitation {
        id: Uuid::new_v4(),
        organization_id: request.organization_id,
        email: request.email.clone(),
        role: request.role.as_str().to_string(),
        token: generate_token(),
        status: STATUS_PENDING.to_string(),
        expires_at: now + request.ttl,
        invited_by: request.invited_by,
    };

    match diesel::insert_into(organization_invitations::table)
        .values(&new_invitation)
        .get_result::<Invitation>(conn)
    {
        Ok(invitation) => {
            tracing::info!(
                invitation_id = %invitation.id,
                organization_id = %invitation.organization_id,
                role = %invitation.role,
                "invitation created"
            );
            Ok(invitation)
        }
        Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
            Err(InvitationError::DuplicatePending)
        }
        Err(err) => Err(err.into()),
    }
}

pub fn find_by_token(conn: &mut PgConnection, token: &str) -> InvitationResult<Invitation> {
    organization_invitations::table
        .filter(organization_invitations::token.eq(token))
        .first(conn)
        .optional()?
        .ok_or(InvitationError::NotFound)
}

pub fn find_in_organization(
    conn: &mut PgConnection,
    organization_id: Uuid,
    invitation_id: Uuid,
) -> InvitationResult<Invitation> {
    organization_invitations::table
        .filter(organization_invitations::id.eq(invitation_id))
        .filter(organization_invitations::organization_id.eq(organization_id))
        .first(conn)
        .optional()?
        .ok_or(InvitationError::NotFound)
}

/// Returns the invitation if it is still pending and unexpired.
///
/// A pending invitation past its expiry is flipped to `EXPIRED` here. The flip
/// is conditional on the row still being pending, so of two concurrent readers
/// only one observes [`InvitationError::Expired`]; the other sees it as already
/// processed.
pub fn ensure_pending(
    conn: &mut PgConnection,
    invitation: Invitation,
) -> InvitationResult<Invitation> {
    if invitation.status != STATUS_PENDING {
        return Err(InvitationError::AlreadyProcessed {
            status: invitation.status,
        });
    }

    let now = Utc::now().naive_utc();
    if invitation.expires_at > now {
        return Ok(invitation);
    }

    let flipped = diesel::update(
        organization_invitations::table
            .filter(organization_invitations::id.eq(invitation.id))
            .filter(organization_invitations::status.eq(STATUS_PENDING))
            .filter(organization_invitations::expires_at.le(now)),
    )
    .set((
        organization_invitations::status.eq(STATUS_EXPIRED),
        organization_invitations::updated_at.eq(now),
    ))
    .execute(conn)?;

    if flipped == 1 {
        tracing::info!(invitation_id = %invitation.id, "invitation expired");
        return Err(InvitationError::Expired);
    }

    Err(processed(conn, invitation.id)?)
}

pub fn pending_by_token(conn: &mut PgConnection, token: &str) -> InvitationResult<Invitation> {
    let invitation = find_by_token(conn, token)?;
    ensure_pending(conn, invitation)
}

/// Pending and historical invitations of an organization, newest first. Stale
/// pending rows are expired before listing.
pub fn list_for_organization(
    conn: &mut PgConnection,
    organization_id: Uuid,
) -> InvitationResult<Vec<Invitation>> {
    let now = Utc::now().naive_utc();
    diesel::update(
        organization_invitations::table
            .filter(organization_invitations::organization_id.eq(organization_id))
            .filter(organization_invitations::status.eq(STATUS_PENDING))
            .filter(organization_invitations::expires_at.le(now)),
    )
    .set((
        organization_invitations::status.eq(STATUS_EXPIRED),
        organization_invitations::updated_at.eq(now),
    ))
    .execute(conn)?;

    Ok(organization_invitations::table
        .filter(organization_invitations::organization_id.eq(organization_id))
        .order(organization_invitations::created_at.desc())
        .load(conn)?)
}

/// Pushes the expiry of a pending invitation out to `now + ttl`.
pub fn resend(
    conn: &mut PgConnection,
    organization_id: Uuid,
    invitation_id: Uuid,
    ttl: Duration,
) -> InvitationResult<Invitation> {
    let invitation = find_in_organization(conn, organization_id, invitation_id)?;
    let invitation = ensure_pending(conn, invitation)?;
    let now = Utc::now().naive_utc();
    let updated = diesel::update(
        organization_invitations::table
            .filter(organization_invitations::id.eq(invitation.id))
            .filter(organization_invitations::status.eq(STATUS_PENDING)),
    )
    .set((
        organization_invitations::expires_at.eq(now + ttl),
        organization_invitations::updated_at.eq(now),
    ))
    .get_result::<Invitation>(conn)
    .optional()?;

    match updated {
        Some(invitation) => Ok(invitation),
        None => Err(processed(conn, invitation.id)?),
    }
}

/// Changes the role proposed by a pending invitation.
pub fn update_role(
    conn: &mut PgConnection,
    invitation: Invitation,
    role: Role,
) -> InvitationResult<Invitation> {
    let invitation = ensure_pending(conn, invitation)?;
    let updated = diesel::update(
        organization_invitations::table
            .filter(organization_invitations::id.eq(invitation.id))
            .filter(organization_invitations::status.eq(STATUS_PENDING)),
    )
    .set((
        organization_invitations::role.eq(role.as_str()),
        organization_invitations::updated_at.eq(Utc::now().naive_utc()),
    ))
    .get_result::<Invitation>(conn)
    .optional()?;

    match updated {
        Some(invitation) => Ok(invitation),
        None => Err(processed(conn, invitation.id)?),
    }
}

/// Error for an invitation that left `PENDING` underneath the caller.
fn processed(conn: &mut PgConnection, invitation_id: Uuid) -> InvitationResult<InvitationError> {
    let status: String = organization_invitations::table
        .find(invitation_id)
        .select(organization_invitations::status)
        .first(conn)?;
    Ok(InvitationError::AlreadyProcessed { status })
}

fn ensure_invitee(user: &User, invitation: &Invitation) -> InvitationResult<()> {
    // Exact, case-sensitive comparison.
    if user.email != invitation.email {
        return Err(InvitationError::EmailMismatch);
    }
    Ok(())
}

/// Accepts the invitation behind `token` on behalf of `user`.
///
/// The user's email must be verified and equal the invitee email exactly. An
/// existing live membership is left untouched, a removed or inactive one is
/// reactivated with the invited role, otherwise a membership is created.
pub fn accept(
    conn: &mut PgConnection,
    token: &str,
    user: &User,
) -> InvitationResult<AcceptOutcome> {
    let invitation = pending_by_token(conn, token)?;

    if !user.is_verified() {
        return Err(InvitationError::EmailNotVerified);
    }
    ensure_invitee(user, &invitation)?;
    let invited_role: Role = invitation.role.parse()?;

    let invitation_id = invitation.id;
    let granted = conn.transaction::<_, InvitationError, _>(|conn| {
        let now = Utc::now().naive_utc();
        let invitation = claim(conn, invitation_id, STATUS_ACCEPTED, now)?;
        let (role, already_member) =
            grant_membership(conn, user.id, invitation.organization_id, invited_role, now)?;
        Ok((invitation, role, already_member))
    });
    let (invitation, role, already_member) = match granted {
        Ok(granted) => granted,
        // The rollback undid the expiry flip made inside the transaction.
        Err(InvitationError::Expired) => return Err(lapsed(conn, invitation_id)?),
        Err(err) => return Err(err),
    };

    let organization: Organization = organizations::table
        .find(invitation.organization_id)
        .first(conn)?;

    tracing::info!(
        invitation_id = %invitation.id,
        user_id = %user.id,
        organization_id = %organization.id,
        role = %role,
        already_member,
        "invitation accepted"
    );

    Ok(AcceptOutcome {
        invitation,
        organization,
        role,
        already_member,
    })
}

pub fn decline(conn: &mut PgConnection, token: &str, user: &User) -> InvitationResult<Invitation> {
    let invitation = pending_by_token(conn, token)?;
    ensure_invitee(user, &invitation)?;
    let invitation = claim(conn, invitation.id, STATUS_DECLINED, Utc::now().naive_utc())?;
    tracing::info!(invitation_id = %invitation.id, user_id = %user.id, "invitation declined");
    Ok(invitation)
}

/// Moves a pending, unexpired invitation to a terminal status.
///
/// An invitation that lapsed after it was last read is flipped to `EXPIRED`
/// and reported as [`InvitationError::Expired`].
pub fn claim(
    conn: &mut PgConnection,
    invitation_id: Uuid,
    status: &str,
    now: NaiveDateTime,
) -> InvitationResult<Invitation> {
    let claimed = diesel::update(
        organization_invitations::table
            .filter(organization_invitations::id.eq(invitation_id))
            .filter(organization_invitations::status.eq(STATUS_PENDING))
            .filter(organization_invitations::expires_at.gt(now)),
    )
    .set((
        organization_invitations::status.eq(status),
        organization_invitations::responded_at.eq(Some(now)),
        organization_invitations::updated_at.eq(now),
    ))
    .get_result::<Invitation>(conn)
    .optional()?;

    match claimed {
        Some(invitation) => Ok(invitation),
        None => Err(lapsed(conn, invitation_id)?),
    }
}

/// Error for an invitation that could not be claimed, expiring it on the way
/// if it is still pending.
fn lapsed(conn: &mut PgConnection, invitation_id: Uuid) -> InvitationResult<InvitationError> {
    let invitation: Invitation = organization_invitations::table
        .find(invitation_id)
        .first(conn)?;
    match ensure_pending(conn, invitation) {
        Err(err) => Ok(err),
        Ok(invitation) => Ok(InvitationError::AlreadyProcessed {
            status: invitation.status,
        }),
    }
}

/// Returns the role the user ends up with and whether they were already a
/// live member.
fn grant_membership(
    conn: &mut PgConnection,
    user_id: Uuid,
    organization_id: Uuid,
    role: Role,
    now: NaiveDateTime,
) -> InvitationResult<(Role, bool)> {
    let existing: Option<(Uuid, String, bool, bool)> = organization_memberships::table
        .filter(organization_memberships::user_id.eq(user_id))
        .filter(organization_memberships::organization_id.eq(organization_id))
        .select((
            organization_memberships::id,
            organization_memberships::role,
            organization_memberships::is_active,
            organization_memberships::is_deleted,
        ))
        .for_update()
        .first(conn)
        .optional()?;

    match existing {
        Some((_, current_role, true, false)) => Ok((current_role.parse()?, true)),
        Some((membership_id, _, _, _)) => {
            diesel::update(organization_memberships::table.find(membership_id))
                .set((
                    organization_memberships::role.eq(role.as_str()),
                    organization_memberships::is_active.eq(true),
                    organization_memberships::is_deleted.eq(false),
                    organization_memberships::is_verified.eq(true),
                    organization_memberships::updated_at.eq(now),
                ))
                .execute(conn)?;
            Ok((role, false))
        }
        None => {
            let membership = NewMembership {
                id: Uuid::new_v4(),
                user_id,
                organization_id,
                role: role.as_str().to_string(),
                is_active: true,
                is_verified: true,
            };
            diesel::insert_into(organization_memberships::table)
                .values(&membership)
                .execute(conn)?;
            Ok((role, false))
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::*;

    #[test]
    fn tokens_are_long_random_hex() {
        let first = generate_token();
        let second = generate_token();
        assert_eq!(first.len(), TOKEN_BYTES * 2);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(first, second);
    }

    #[test]
    fn expired_and_processed_map_to_distinct_responses() {
        let expired = AppError::from(InvitationError::Expired);
        assert_eq!(expired.status(), StatusCode::GONE);
        assert_eq!(expired.message(), "invitation has expired");

        let reexpired = AppError::from(InvitationError::AlreadyProcessed {
            status: STATUS_EXPIRED.to_string(),
        });
        assert_eq!(reexpired.status(), StatusCode::GONE);
        assert_eq!(reexpired.message(), "invitation has already been processed");

        let used = AppError::from(InvitationError::AlreadyProcessed {
            status: STATUS_ACCEPTED.to_string(),
        });
        assert_eq!(used.status(), StatusCode::NOT_FOUND);

        let missing = AppError::from(InvitationError::NotFound);
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_ne!(missing.message(), used.message());
    }

    #[test]
    fn invitee_mismatch_is_forbidden() {
        assert_eq!(
            AppError::from(InvitationError::EmailMismatch).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::from(InvitationError::DuplicatePending).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn email_comparison_is_case_sensitive() {
        let now = Utc::now().naive_utc();
        let user = User {
            id: Uuid::new_v4(),
            email: "B@example.com".to_string(),
            name: None,
            password_hash: None,
            email_verified_at: Some(now),
            archived: false,
            created_at: now,
            updated_at: now,
        };
        let invitation = Invitation {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            email: "b@example.com".to_string(),
            role: "MANAGER".to_string(),
            token: generate_token(),
            status: STATUS_PENDING.to_string(),
            expires_at: now + Duration::days(7),
            invited_by: Uuid::new_v4(),
            responded_at: None,
            created_at: now,
            updated_at: now,
        };
        assert!(matches!(
            ensure_invitee(&user, &invitation),
            Err(InvitationError::EmailMismatch)
        ));
    }
}
