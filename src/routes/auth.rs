use axum::{
    extract::State,
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    Json,
};
use axum_extra::{headers::Cookie, typed_header::TypedHeader};
use chrono::{Duration as ChronoDuration, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::{password, AuthenticatedUser, SESSION_COOKIE_NAME},
    error::{AppError, AppResult},
    invitations::{self, InvitationError},
    models::{NewRefreshToken, NewUser, RefreshToken, User},
    org_context::MembershipSummary,
    schema::{refresh_tokens, users},
    state::AppState,
    utils::json::ValidatedJson,
};

use super::session::{build_cookie, issue_session, load_active_user, SessionResponse};

const REFRESH_COOKIE_NAME: &str = "refresh_token";

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(email(message = "must be a valid email address"))]
    pub email: String,
    #[validate(length(min = 8, max = 256, message = "must be between 8 and 256 characters"))]
    pub password: String,
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
    /// Invitation token from a signup link.
    pub invitation: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(length(min = 1))]
    pub email: String,
    #[validate(length(min = 1))]
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    #[serde(flatten)]
    pub session: SessionResponse,
    /// Organization joined through the invitation used to sign up.
    pub joined_organization: Option<MembershipSummary>,
}

/// Creates an account. With an invitation token whose invitee email matches,
/// the account starts out verified and the invitation is accepted in the same
/// transaction.
pub async fn register(
    State(state): State<AppState>,
    ValidatedJson(payload): ValidatedJson<RegisterRequest>,
) -> AppResult<(StatusCode, HeaderMap, Json<RegisterResponse>)> {
    let email = payload.email.trim().to_string();
    let mut conn = state.db()?;

    let invitation = match payload.invitation.as_deref() {
        Some(token) => {
            let invitation = invitations::pending_by_token(&mut conn, token)?;
            if invitation.email != email {
                return Err(InvitationError::EmailMismatch.into());
            }
            Some(invitation)
        }
        None => None,
    };

    let password_hash = password::hash_password(&payload.password)?;
    let now = Utc::now().naive_utc();
    let new_user = NewUser {
        id: Uuid::new_v4(),
        email,
        name: payload.name.map(|name| name.trim().to_string()),
        password_hash: Some(password_hash),
        email_verified_at: invitation.as_ref().map(|_| now),
    };

    let (user, joined_organization) = conn.transaction::<_, AppError, _>(|conn| {
        let user = insert_user(conn, &new_user)?;
        let joined = match &invitation {
            Some(invitation) => {
                let outcome = invitations::accept(conn, &invitation.token, &user)?;
                Some(MembershipSummary {
                    organization_id: outcome.organization.id,
                    organization_name: outcome.organization.name,
                    organization_type: outcome.organization.organization_type,
                    role: outcome.role,
                })
            }
            None => None,
        };
        Ok((user, joined))
    })?;

    tracing::info!(
        user_id = %user.id,
        via_invitation = joined_organization.is_some(),
        "user registered"
    );

    let (headers, session) = issue_session(&state, &mut conn, &user)?;
    Ok((
        StatusCode::CREATED,
        headers,
        Json(RegisterResponse {
            session,
            joined_organization,
        }),
    ))
}

fn insert_user(conn: &mut PgConnection, new_user: &NewUser) -> AppResult<User> {
    match diesel::insert_into(users::table)
        .values(new_user)
        .get_result::<User>(conn)
    {
        Ok(user) => Ok(user),
        Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
            Err(AppError::bad_request("email is already registered"))
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn login(
    State(state): State<AppState>,
    ValidatedJson(payload): ValidatedJson<LoginRequest>,
) -> AppResult<(HeaderMap, Json<SessionResponse>)> {
    let mut conn = state.db()?;

    let user: User = users::table
        .filter(users::email.eq(payload.email.trim()))
        .filter(users::archived.eq(false))
        .first(&mut conn)
        .optional()?
        .ok_or_else(AppError::unauthorized)?;

    let password_hash = user
        .password_hash
        .as_deref()
        .ok_or_else(AppError::unauthorized)?;
    let valid = password::verify_password(&payload.password, password_hash)
        .map_err(|_| AppError::unauthorized())?;
    if !valid {
        return Err(AppError::unauthorized());
    }

    let (mut headers, session) = issue_session(&state, &mut conn, &user)?;
    let refresh_value = store_refresh_token(&state, &mut conn, user.id)?;
    headers.append(SET_COOKIE, refresh_cookie(&state, &refresh_value)?);

    tracing::info!(user_id = %user.id, "user logged in");
    Ok((headers, Json(session)))
}

/// Rotates the refresh token and issues a fresh session token.
pub async fn refresh(
    State(state): State<AppState>,
    jar: Option<TypedHeader<Cookie>>,
) -> AppResult<(HeaderMap, Json<SessionResponse>)> {
    let TypedHeader(cookies) = jar.ok_or_else(AppError::unauthorized)?;
    let refresh_value = cookies
        .get(REFRESH_COOKIE_NAME)
        .ok_or_else(AppError::unauthorized)?;

    let hashed = hash_refresh_token(refresh_value);
    let mut conn = state.db()?;
    let now = Utc::now().naive_utc();

    let token: RefreshToken = refresh_tokens::table
        .filter(refresh_tokens::token_hash.eq(&hashed))
        .filter(refresh_tokens::revoked_at.is_null())
        .filter(refresh_tokens::expires_at.gt(now))
        .first(&mut conn)
        .optional()?
        .ok_or_else(AppError::unauthorized)?;

    diesel::update(refresh_tokens::table.find(token.id))
        .set((
            refresh_tokens::revoked_at.eq(now),
            refresh_tokens::updated_at.eq(now),
        ))
        .execute(&mut conn)?;

    let user = load_active_user(&mut conn, token.user_id)?;
    let (mut headers, session) = issue_session(&state, &mut conn, &user)?;
    let new_refresh_value = store_refresh_token(&state, &mut conn, user.id)?;
    headers.append(SET_COOKIE, refresh_cookie(&state, &new_refresh_value)?);

    Ok((headers, Json(session)))
}

pub async fn logout(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    jar: Option<TypedHeader<Cookie>>,
) -> AppResult<(HeaderMap, StatusCode)> {
    let mut conn = state.db()?;
    let now = Utc::now().naive_utc();
    let mut revoked = 0;

    if let Some(TypedHeader(cookies)) = jar {
        if let Some(value) = cookies.get(REFRESH_COOKIE_NAME) {
            revoked = diesel::update(
                refresh_tokens::table
                    .filter(refresh_tokens::token_hash.eq(hash_refresh_token(value)))
                    .filter(refresh_tokens::user_id.eq(user.user_id))
                    .filter(refresh_tokens::revoked_at.is_null()),
            )
            .set((
                refresh_tokens::revoked_at.eq(now),
                refresh_tokens::updated_at.eq(now),
            ))
            .execute(&mut conn)?;
        }
    }

    if revoked == 0 {
        diesel::update(
            refresh_tokens::table
                .filter(refresh_tokens::user_id.eq(user.user_id))
                .filter(refresh_tokens::revoked_at.is_null()),
        )
        .set((
            refresh_tokens::revoked_at.eq(now),
            refresh_tokens::updated_at.eq(now),
        ))
        .execute(&mut conn)?;
    }

    let mut headers = HeaderMap::new();
    headers.append(
        SET_COOKIE,
        build_cookie(&state, REFRESH_COOKIE_NAME, "", 0, "Strict")?,
    );
    headers.append(
        SET_COOKIE,
        build_cookie(&state, SESSION_COOKIE_NAME, "", 0, "Lax")?,
    );
    Ok((headers, StatusCode::NO_CONTENT))
}

pub async fn me(user: AuthenticatedUser) -> Json<AuthenticatedUser> {
    Json(user)
}

fn store_refresh_token(
    state: &AppState,
    conn: &mut PgConnection,
    user_id: Uuid,
) -> AppResult<String> {
    let now = Utc::now();
    let value = generate_refresh_token();
    let new_refresh = NewRefreshToken {
        id: Uuid::new_v4(),
        user_id,
        token_hash: hash_refresh_token(&value),
        issued_at: now.naive_utc(),
        expires_at: (now + ChronoDuration::days(state.config.refresh_token_expiry_days))
            .naive_utc(),
    };

    diesel::insert_into(refresh_tokens::table)
        .values(&new_refresh)
        .execute(conn)?;
    Ok(value)
}

fn refresh_cookie(state: &AppState, value: &str) -> AppResult<axum::http::HeaderValue> {
    let max_age = ChronoDuration::days(state.config.refresh_token_expiry_days).num_seconds();
    build_cookie(state, REFRESH_COOKIE_NAME, value, max_age, "Strict")
}

fn hash_refresh_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn generate_refresh_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use validator::Validate;

    use super::{hash_refresh_token, RegisterRequest};

    #[test]
    fn refresh_token_hashes_are_stable_hex() {
        let hash = hash_refresh_token("abc");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_refresh_token("abc"));
        assert_ne!(hash, hash_refresh_token("abd"));
    }

    #[test]
    fn registration_requires_a_real_email_and_password() {
        let request = RegisterRequest {
            email: "nope".to_string(),
            password: "short".to_string(),
            name: None,
            invitation: None,
        };
        let errors = request.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("email"));
        assert!(fields.contains_key("password"));
    }
}
