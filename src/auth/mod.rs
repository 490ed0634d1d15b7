pub mod jwt;
pub mod password;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use axum_extra::headers::{authorization::Bearer, Authorization, Cookie};
use axum_extra::TypedHeader;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    authz::{CurrentOrganization, OrgContext},
    error::AppError,
    state::AppState,
};

use self::jwt::MembershipClaim;

pub const SESSION_COOKIE_NAME: &str = "session_token";

/// Identity and organization projection read from a verified session token.
#[derive(Debug, Clone, Serialize)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub email: String,
    pub memberships: Vec<MembershipClaim>,
    pub current: Option<CurrentOrganization>,
}

impl AuthenticatedUser {
    /// Request-scoped authorization context, trusting the token's cached role.
    pub fn context(&self) -> OrgContext {
        OrgContext::new(self.user_id, self.current)
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = match TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
            .await
        {
            Ok(TypedHeader(Authorization(bearer))) => bearer.token().to_string(),
            Err(_) => {
                let TypedHeader(cookies) =
                    TypedHeader::<Cookie>::from_request_parts(parts, state)
                        .await
                        .map_err(|_| AppError::unauthorized())?;
                cookies
                    .get(SESSION_COOKIE_NAME)
                    .map(str::to_string)
                    .ok_or_else(AppError::unauthorized)?
            }
        };

        let claims = state
            .jwt
            .verify_token(&token)
            .map_err(|_| AppError::unauthorized())?;
        let current = claims.current();

        Ok(AuthenticatedUser {
            user_id: claims.sub,
            email: claims.email,
            memberships: claims.memberships,
            current,
        })
    }
}
