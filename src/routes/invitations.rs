use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::AuthenticatedUser,
    authz::{ensure_can_assign_role, Action, Role, RoleTarget},
    error::{AppError, AppResult},
    invitations::{self, InvitationRequest},
    mailer::{self, OutgoingEmail},
    models::{Invitation, Organization},
    org_context::{self, MembershipSummary},
    schema::{organizations, users},
    state::AppState,
    utils::json::ValidatedJson,
};

use super::organizations::active_organization;
use super::session::load_active_user;

const DELIVERY_WARNING: &str =
    "invitation saved but the email could not be sent; share the link with the invitee directly";

#[derive(Debug, Deserialize, Validate)]
pub struct CreateInvitationRequest {
    #[validate(email(message = "must be a valid email address"))]
    pub email: String,
    pub role: Role,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateInvitationRoleRequest {
    pub role: Role,
}

#[derive(Debug, Serialize)]
pub struct InvitationResponse {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub email: String,
    pub role: String,
    pub status: String,
    pub invited_by: Uuid,
    pub expires_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<Invitation> for InvitationResponse {
    fn from(invitation: Invitation) -> Self {
        Self {
            id: invitation.id,
            organization_id: invitation.organization_id,
            email: invitation.email,
            role: invitation.role,
            status: invitation.status,
            invited_by: invitation.invited_by,
            expires_at: invitation.expires_at.and_utc(),
            responded_at: invitation.responded_at.map(|at| at.and_utc()),
            created_at: invitation.created_at.and_utc(),
        }
    }
}

/// An invitation together with the outcome of emailing it.
#[derive(Debug, Serialize)]
pub struct DeliveredInvitationResponse {
    #[serde(flatten)]
    pub invitation: InvitationResponse,
    pub link: String,
    pub email_sent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// What an invitee sees before accepting.
#[derive(Debug, Serialize)]
pub struct InvitationPreview {
    pub organization_id: Uuid,
    pub organization_name: String,
    pub organization_type: String,
    pub email: String,
    pub role: String,
    pub invited_by: String,
    pub expires_at: DateTime<Utc>,
    pub account_exists: bool,
}

#[derive(Debug, Serialize)]
pub struct AcceptInvitationResponse {
    pub organization: MembershipSummary,
    pub already_member: bool,
}

pub async fn list_invitations(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(organization_id): Path<Uuid>,
) -> AppResult<Json<Vec<InvitationResponse>>> {
    user.context().authorize_in(organization_id, Action::ViewInvitations)?;

    let mut conn = state.db()?;
    let rows = invitations::list_for_organization(&mut conn, organization_id)?;
    Ok(Json(rows.into_iter().map(InvitationResponse::from).collect()))
}

/// Creates a pending invitation and emails its link. A failed email does not
/// undo the invitation; the response carries a warning and the link instead.
pub async fn create_invitation(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(organization_id): Path<Uuid>,
    ValidatedJson(payload): ValidatedJson<CreateInvitationRequest>,
) -> AppResult<(StatusCode, Json<DeliveredInvitationResponse>)> {
    let (invitation, link, email) = {
        let mut conn = state.db()?;
        let ctx = org_context::resolve_context(&mut conn, user.user_id)?;
        let current = ctx.authorize_in(organization_id, Action::InviteUsers)?;
        ensure_can_assign_role(ctx.user_id, current.role, RoleTarget::NewGrant, payload.role)?;

        let organization = active_organization(&mut conn, organization_id)?;
        let request = InvitationRequest {
            organization_id,
            email: payload.email.trim().to_string(),
            role: payload.role,
            invited_by: ctx.user_id,
            ttl: Duration::days(state.config.invitation_expiry_days),
        };
        let invitation = invitations::create(&mut conn, &request)?;
        let (link, email) = compose_email(&state, &mut conn, &invitation, &organization)?;
        (invitation, link, email)
    };

    let warning = deliver(&state, &invitation, email).await;
    Ok((
        StatusCode::CREATED,
        Json(DeliveredInvitationResponse {
            invitation: invitation.into(),
            link,
            email_sent: warning.is_none(),
            warning,
        }),
    ))
}

/// Extends a pending invitation's expiry and emails the link again.
pub async fn resend_invitation(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((organization_id, invitation_id)): Path<(Uuid, Uuid)>,
) -> AppResult<Json<DeliveredInvitationResponse>> {
    let (invitation, link, email) = {
        let mut conn = state.db()?;
        let ctx = org_context::resolve_context(&mut conn, user.user_id)?;
        let current = ctx.authorize_in(organization_id, Action::InviteUsers)?;

        let existing =
            invitations::find_in_organization(&mut conn, organization_id, invitation_id)?;
        let proposed: Role = existing.role.parse().map_err(AppError::internal)?;
        ensure_can_assign_role(
            ctx.user_id,
            current.role,
            RoleTarget::PendingInvitation { proposed },
            proposed,
        )?;

        let organization = active_organization(&mut conn, organization_id)?;
        let invitation = invitations::resend(
            &mut conn,
            organization_id,
            invitation_id,
            Duration::days(state.config.invitation_expiry_days),
        )?;
        let (link, email) = compose_email(&state, &mut conn, &invitation, &organization)?;
        (invitation, link, email)
    };

    let warning = deliver(&state, &invitation, email).await;
    Ok(Json(DeliveredInvitationResponse {
        invitation: invitation.into(),
        link,
        email_sent: warning.is_none(),
        warning,
    }))
}

pub async fn update_invitation_role(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((organization_id, invitation_id)): Path<(Uuid, Uuid)>,
    ValidatedJson(payload): ValidatedJson<UpdateInvitationRoleRequest>,
) -> AppResult<Json<InvitationResponse>> {
    let mut conn = state.db()?;
    let ctx = org_context::resolve_context(&mut conn, user.user_id)?;
    let current = ctx.authorize_in(organization_id, Action::ManageUsers)?;

    let invitation = invitations::find_in_organization(&mut conn, organization_id, invitation_id)?;
    let proposed: Role = invitation.role.parse().map_err(AppError::internal)?;
    ensure_can_assign_role(
        ctx.user_id,
        current.role,
        RoleTarget::PendingInvitation { proposed },
        payload.role,
    )?;

    let invitation = invitations::update_role(&mut conn, invitation, payload.role)?;
    tracing::info!(
        invitation_id = %invitation.id,
        actor_id = %ctx.user_id,
        from = %proposed,
        to = %payload.role,
        "invitation role changed"
    );
    Ok(Json(invitation.into()))
}

/// Public lookup behind the invitation link.
pub async fn preview_invitation(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> AppResult<Json<InvitationPreview>> {
    let mut conn = state.db()?;
    let invitation = invitations::pending_by_token(&mut conn, &token)?;
    let organization: Organization = organizations::table
        .find(invitation.organization_id)
        .first(&mut conn)?;
    let invited_by = inviter_email(&mut conn, invitation.invited_by)?;
    let account_exists = account_exists(&mut conn, &invitation.email)?;

    Ok(Json(InvitationPreview {
        organization_id: organization.id,
        organization_name: organization.name,
        organization_type: organization.organization_type,
        email: invitation.email,
        role: invitation.role,
        invited_by,
        expires_at: invitation.expires_at.and_utc(),
        account_exists,
    }))
}

/// Accepts on behalf of the caller. The caller's current organization is left
/// alone; clients switch explicitly if they want to act in the new one.
pub async fn accept_invitation(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(token): Path<String>,
) -> AppResult<Json<AcceptInvitationResponse>> {
    let mut conn = state.db()?;
    let account = load_active_user(&mut conn, user.user_id)?;
    let outcome = invitations::accept(&mut conn, &token, &account)?;

    Ok(Json(AcceptInvitationResponse {
        organization: MembershipSummary {
            organization_id: outcome.organization.id,
            organization_name: outcome.organization.name,
            organization_type: outcome.organization.organization_type,
            role: outcome.role,
        },
        already_member: outcome.already_member,
    }))
}

pub async fn decline_invitation(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(token): Path<String>,
) -> AppResult<Json<InvitationResponse>> {
    let mut conn = state.db()?;
    let account = load_active_user(&mut conn, user.user_id)?;
    let invitation = invitations::decline(&mut conn, &token, &account)?;
    Ok(Json(invitation.into()))
}

/// Link and email for an invitation. Invitees without an account are sent to
/// signup with the token attached.
fn compose_email(
    state: &AppState,
    conn: &mut PgConnection,
    invitation: &Invitation,
    organization: &Organization,
) -> AppResult<(String, OutgoingEmail)> {
    let link = if account_exists(conn, &invitation.email)? {
        state.config.invitation_link(&invitation.token)
    } else {
        state.config.signup_link(&invitation.token)
    };
    let inviter = inviter_email(conn, invitation.invited_by)?;
    let email = mailer::invitation_email(
        &invitation.email,
        &organization.name,
        &invitation.role,
        &inviter,
        &link,
        state.config.invitation_expiry_days,
    );
    Ok((link, email))
}

async fn deliver(
    state: &AppState,
    invitation: &Invitation,
    email: OutgoingEmail,
) -> Option<String> {
    match state.mailer.send(email).await {
        Ok(()) => None,
        Err(err) => {
            tracing::warn!(
                invitation_id = %invitation.id,
                error = %err,
                "failed to send invitation email"
            );
            Some(DELIVERY_WARNING.to_string())
        }
    }
}

fn account_exists(conn: &mut PgConnection, email: &str) -> AppResult<bool> {
    Ok(users::table
        .filter(users::email.eq(email))
        .select(users::id)
        .first::<Uuid>(conn)
        .optional()?
        .is_some())
}

fn inviter_email(conn: &mut PgConnection, user_id: Uuid) -> AppResult<String> {
    Ok(users::table
        .find(user_id)
        .select(users::email)
        .first(conn)?)
}
