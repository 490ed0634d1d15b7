use axum::{
    extract::State,
    http::{header::SET_COOKIE, HeaderMap, HeaderValue},
    Json,
};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::{jwt::SessionProjection, AuthenticatedUser, SESSION_COOKIE_NAME},
    authz::Role,
    error::{AppError, AppResult},
    models::User,
    org_context::{self, MembershipSummary},
    schema::users,
    state::AppState,
    utils::json::ValidatedJson,
};

#[derive(Debug, Deserialize, Validate)]
pub struct SetOrganizationRequest {
    pub organization_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct SessionUser {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub email_verified: bool,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub user: SessionUser,
    pub memberships: Vec<MembershipSummary>,
    pub current_organization_id: Option<Uuid>,
    pub current_role: Option<Role>,
}

/// Switches the caller's current organization and returns a session token
/// carrying the new context. On failure the stored pointer is left as it was.
pub async fn set_organization(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    ValidatedJson(payload): ValidatedJson<SetOrganizationRequest>,
) -> AppResult<(HeaderMap, Json<SessionResponse>)> {
    let mut conn = state.db()?;
    let account = load_active_user(&mut conn, user.user_id)?;
    org_context::set_current(&mut conn, account.id, payload.organization_id)?;

    let (headers, session) = issue_session(&state, &mut conn, &account)?;
    Ok((headers, Json(session)))
}

/// Re-projects memberships and the current organization from the store.
pub async fn reissue_session(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<(HeaderMap, Json<SessionResponse>)> {
    let mut conn = state.db()?;
    let account = load_active_user(&mut conn, user.user_id)?;
    let (headers, session) = issue_session(&state, &mut conn, &account)?;
    Ok((headers, Json(session)))
}

pub(crate) fn load_active_user(conn: &mut PgConnection, user_id: Uuid) -> AppResult<User> {
    let user: Option<User> = users::table.find(user_id).first(conn).optional()?;
    match user {
        Some(user) if !user.archived => Ok(user),
        _ => Err(AppError::unauthorized()),
    }
}

/// Signs a session token from the user's live memberships and stored current
/// organization, and sets it as the session cookie.
pub(crate) fn issue_session(
    state: &AppState,
    conn: &mut PgConnection,
    user: &User,
) -> AppResult<(HeaderMap, SessionResponse)> {
    let memberships = org_context::list_memberships(conn, user.id)?;
    let current = org_context::get_current(conn, user.id)?;

    let projection = SessionProjection {
        user_id: user.id,
        email: user.email.clone(),
        memberships,
        current,
    };
    let access_token = state.jwt.generate_token(&projection)?;
    let expires_in = state.jwt.expires_in_seconds();

    let mut headers = HeaderMap::new();
    headers.append(
        SET_COOKIE,
        build_cookie(state, SESSION_COOKIE_NAME, &access_token, expires_in, "Lax")?,
    );

    Ok((
        headers,
        SessionResponse {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in,
            user: SessionUser {
                id: user.id,
                email: user.email.clone(),
                name: user.name.clone(),
                email_verified: user.is_verified(),
            },
            memberships: projection.memberships,
            current_organization_id: current.map(|c| c.organization_id),
            current_role: current.map(|c| c.role),
        },
    ))
}

pub(crate) fn build_cookie(
    state: &AppState,
    name: &str,
    value: &str,
    max_age_seconds: i64,
    same_site: &str,
) -> AppResult<HeaderValue> {
    let mut parts = vec![format!("{name}={value}")];
    parts.push("Path=/".into());
    parts.push("HttpOnly".into());
    parts.push(format!("SameSite={same_site}"));
    parts.push(format!("Max-Age={}", max_age_seconds.max(0)));
    if max_age_seconds <= 0 {
        parts.push("Expires=Thu, 01 Jan 1970 00:00:00 GMT".into());
    }
    if state.config.session_cookie_secure {
        parts.push("Secure".into());
    }
    if let Some(domain) = &state.config.session_cookie_domain {
        parts.push(format!("Domain={domain}"));
    }

    HeaderValue::from_str(&parts.join("; "))
        .map_err(|err| AppError::internal(format!("invalid {name} cookie: {err}")))
}
