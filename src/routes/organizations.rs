use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::AuthenticatedUser,
    authz::{ensure_can_assign_role, ensure_can_modify_member, Action, Role, RoleTarget},
    error::{AppError, AppResult},
    models::{Membership, NewMembership, NewOrganization, Organization, User},
    org_context::{self, MembershipSummary},
    schema::{organization_memberships, organizations, users},
    state::AppState,
    utils::json::{nullable, ValidatedJson},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrganizationType {
    Customer,
    Vendor,
}

impl OrganizationType {
    pub fn as_str(self) -> &'static str {
        match self {
            OrganizationType::Customer => "customer",
            OrganizationType::Vendor => "vendor",
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateOrganizationRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub organization_type: OrganizationType,
    #[validate(length(max = 64))]
    pub plan: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateOrganizationRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
    pub organization_type: Option<OrganizationType>,
    #[serde(default, deserialize_with = "nullable")]
    pub plan: Option<Option<String>>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateMemberRoleRequest {
    pub role: Role,
}

#[derive(AsChangeset)]
#[diesel(table_name = organizations)]
struct OrganizationChangeset<'a> {
    name: Option<&'a str>,
    organization_type: Option<&'a str>,
    plan: Option<Option<&'a str>>,
    updated_at: NaiveDateTime,
}

#[derive(Debug, Serialize)]
pub struct OrganizationResponse {
    pub id: Uuid,
    pub name: String,
    pub organization_type: String,
    pub owner_id: Uuid,
    pub plan: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Organization> for OrganizationResponse {
    fn from(organization: Organization) -> Self {
        Self {
            id: organization.id,
            name: organization.name,
            organization_type: organization.organization_type,
            owner_id: organization.owner_id,
            plan: organization.plan,
            is_active: organization.is_active,
            created_at: organization.created_at.and_utc(),
            updated_at: organization.updated_at.and_utc(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CreatedOrganizationResponse {
    pub organization: OrganizationResponse,
    pub role: Role,
}

#[derive(Debug, Serialize)]
pub struct OrganizationListResponse {
    pub memberships: Vec<MembershipSummary>,
    pub current_organization_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct MemberResponse {
    pub user_id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub role: String,
    pub is_active: bool,
    pub is_verified: bool,
    pub joined_at: DateTime<Utc>,
}

impl MemberResponse {
    fn new(membership: Membership, user: User) -> Self {
        Self {
            user_id: user.id,
            email: user.email,
            name: user.name,
            role: membership.role,
            is_active: membership.is_active,
            is_verified: membership.is_verified,
            joined_at: membership.created_at.and_utc(),
        }
    }
}

/// Every organization the caller belongs to, read from the store.
pub async fn list_organizations(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<OrganizationListResponse>> {
    let mut conn = state.db()?;
    let memberships = org_context::list_memberships(&mut conn, user.user_id)?;
    let current = org_context::get_current(&mut conn, user.user_id)?;
    Ok(Json(OrganizationListResponse {
        memberships,
        current_organization_id: current.map(|c| c.organization_id),
    }))
}

/// Creates an organization with the caller as its administrator. The caller's
/// current organization is not changed.
pub async fn create_organization(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    ValidatedJson(payload): ValidatedJson<CreateOrganizationRequest>,
) -> AppResult<(StatusCode, Json<CreatedOrganizationResponse>)> {
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(AppError::bad_request("name must not be empty"));
    }

    let mut conn = state.db()?;
    let new_organization = NewOrganization {
        id: Uuid::new_v4(),
        name: name.to_string(),
        organization_type: payload.organization_type.as_str().to_string(),
        owner_id: user.user_id,
        plan: payload.plan,
    };
    let new_membership = NewMembership {
        id: Uuid::new_v4(),
        user_id: user.user_id,
        organization_id: new_organization.id,
        role: Role::Administrator.as_str().to_string(),
        is_active: true,
        is_verified: true,
    };

    let organization = conn.transaction::<_, AppError, _>(|conn| {
        let organization: Organization = diesel::insert_into(organizations::table)
            .values(&new_organization)
            .get_result(conn)?;
        diesel::insert_into(organization_memberships::table)
            .values(&new_membership)
            .execute(conn)?;
        Ok(organization)
    })?;

    tracing::info!(
        organization_id = %organization.id,
        owner_id = %user.user_id,
        "organization created"
    );

    Ok((
        StatusCode::CREATED,
        Json(CreatedOrganizationResponse {
            organization: organization.into(),
            role: Role::Administrator,
        }),
    ))
}

pub async fn get_organization(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(organization_id): Path<Uuid>,
) -> AppResult<Json<OrganizationResponse>> {
    user.context().authorize_in(organization_id, Action::ViewOrganization)?;

    let mut conn = state.db()?;
    let organization = active_organization(&mut conn, organization_id)?;
    Ok(Json(organization.into()))
}

pub async fn update_organization(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(organization_id): Path<Uuid>,
    ValidatedJson(payload): ValidatedJson<UpdateOrganizationRequest>,
) -> AppResult<Json<OrganizationResponse>> {
    let mut conn = state.db()?;
    org_context::resolve_context(&mut conn, user.user_id)?
        .authorize_in(organization_id, Action::EditOrganization)?;

    let name = payload.name.as_deref().map(str::trim);
    if name.is_some_and(str::is_empty) {
        return Err(AppError::bad_request("name must not be empty"));
    }
    let plan = payload
        .plan
        .as_ref()
        .map(|plan| plan.as_deref().map(str::trim));
    if plan.flatten().is_some_and(|plan| plan.chars().count() > 64) {
        return Err(AppError::bad_request("plan must be at most 64 characters"));
    }

    active_organization(&mut conn, organization_id)?;
    let changes = OrganizationChangeset {
        name,
        organization_type: payload.organization_type.map(OrganizationType::as_str),
        plan,
        updated_at: Utc::now().naive_utc(),
    };
    let organization: Organization = diesel::update(organizations::table.find(organization_id))
        .set(&changes)
        .get_result(&mut conn)?;

    tracing::info!(organization_id = %organization_id, "organization updated");
    Ok(Json(organization.into()))
}

/// Soft-deactivates the organization. Its memberships stop granting access.
pub async fn deactivate_organization(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(organization_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let mut conn = state.db()?;
    org_context::resolve_context(&mut conn, user.user_id)?
        .authorize_in(organization_id, Action::DeactivateOrganization)?;

    let now = Utc::now().naive_utc();
    diesel::update(organizations::table.find(organization_id))
        .set((
            organizations::is_active.eq(false),
            organizations::updated_at.eq(now),
        ))
        .execute(&mut conn)?;

    tracing::info!(
        organization_id = %organization_id,
        actor_id = %user.user_id,
        "organization deactivated"
    );
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_members(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(organization_id): Path<Uuid>,
) -> AppResult<Json<Vec<MemberResponse>>> {
    user.context().authorize_in(organization_id, Action::ViewUsers)?;

    let mut conn = state.db()?;
    let rows: Vec<(Membership, User)> = organization_memberships::table
        .inner_join(users::table)
        .filter(organization_memberships::organization_id.eq(organization_id))
        .filter(organization_memberships::is_deleted.eq(false))
        .order(users::email.asc())
        .load(&mut conn)?;

    Ok(Json(
        rows.into_iter()
            .map(|(membership, member)| MemberResponse::new(membership, member))
            .collect(),
    ))
}

/// Changes a member's role. Authorization is evaluated against the store, not
/// the role cached in the caller's session token.
pub async fn update_member_role(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((organization_id, member_id)): Path<(Uuid, Uuid)>,
    ValidatedJson(payload): ValidatedJson<UpdateMemberRoleRequest>,
) -> AppResult<Json<MemberResponse>> {
    let mut conn = state.db()?;
    let ctx = org_context::resolve_context(&mut conn, user.user_id)?;
    let current = ctx.authorize_in(organization_id, Action::ManageUsers)?;

    let (membership, member) = live_member(&mut conn, organization_id, member_id)?;
    let target_role: Role = membership.role.parse().map_err(AppError::internal)?;
    ensure_can_assign_role(
        ctx.user_id,
        current.role,
        RoleTarget::Member {
            user_id: member_id,
            role: target_role,
        },
        payload.role,
    )?;

    let membership: Membership = diesel::update(organization_memberships::table.find(membership.id))
        .set((
            organization_memberships::role.eq(payload.role.as_str()),
            organization_memberships::updated_at.eq(Utc::now().naive_utc()),
        ))
        .get_result(&mut conn)?;

    tracing::info!(
        organization_id = %organization_id,
        actor_id = %ctx.user_id,
        member_id = %member_id,
        from = %target_role,
        to = %payload.role,
        "member role changed"
    );
    Ok(Json(MemberResponse::new(membership, member)))
}

/// Soft-deletes a membership. The row is kept so a later invitation can
/// reactivate it.
pub async fn remove_member(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((organization_id, member_id)): Path<(Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    let mut conn = state.db()?;
    let ctx = org_context::resolve_context(&mut conn, user.user_id)?;
    let current = ctx.authorize_in(organization_id, Action::RemoveUsers)?;

    let (membership, _) = live_member(&mut conn, organization_id, member_id)?;
    let target_role: Role = membership.role.parse().map_err(AppError::internal)?;
    ensure_can_modify_member(ctx.user_id, current.role, member_id, target_role)?;

    let now = Utc::now().naive_utc();
    diesel::update(organization_memberships::table.find(membership.id))
        .set((
            organization_memberships::is_deleted.eq(true),
            organization_memberships::is_active.eq(false),
            organization_memberships::updated_at.eq(now),
        ))
        .execute(&mut conn)?;

    tracing::info!(
        organization_id = %organization_id,
        actor_id = %ctx.user_id,
        member_id = %member_id,
        "member removed"
    );
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) fn active_organization(
    conn: &mut PgConnection,
    organization_id: Uuid,
) -> AppResult<Organization> {
    organizations::table
        .find(organization_id)
        .filter(organizations::is_active.eq(true))
        .first(conn)
        .optional()?
        .ok_or_else(|| AppError::not_found_with("organization not found"))
}

fn live_member(
    conn: &mut PgConnection,
    organization_id: Uuid,
    user_id: Uuid,
) -> AppResult<(Membership, User)> {
    organization_memberships::table
        .inner_join(users::table)
        .filter(organization_memberships::organization_id.eq(organization_id))
        .filter(organization_memberships::user_id.eq(user_id))
        .filter(organization_memberships::is_active.eq(true))
        .filter(organization_memberships::is_deleted.eq(false))
        .first(conn)
        .optional()?
        .ok_or_else(|| AppError::not_found_with("member not found"))
}
