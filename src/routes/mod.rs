use axum::http::HeaderValue;
use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::{auth::AuthenticatedUser, state::AppState};

pub mod auth;
pub mod health;
pub mod invitations;
pub mod organizations;
pub mod session;

pub fn create_router(state: AppState) -> Router<()> {
    let allow_origin = match state.config.cors_allowed_origin.as_ref() {
        Some(origins) => AllowOrigin::list(parse_origins(origins)),
        None => AllowOrigin::mirror_request(),
    };
    let cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true);

    let auth_routes = Router::new()
        .route("/register", post(auth::register))
        .route("/login", post(auth::login))
        .route("/refresh", post(auth::refresh))
        .route("/logout", post(auth::logout))
        .route("/me", get(auth::me));

    let user_routes = Router::new()
        .route("/set-organization", post(session::set_organization))
        .route("/session", post(session::reissue_session));

    let organization_routes = Router::new()
        .route(
            "/",
            get(organizations::list_organizations).post(organizations::create_organization),
        )
        .route(
            "/:id",
            get(organizations::get_organization)
                .patch(organizations::update_organization)
                .delete(organizations::deactivate_organization),
        )
        .route("/:id/users", get(organizations::list_members))
        .route("/:id/users/:user_id", delete(organizations::remove_member))
        .route(
            "/:id/users/:user_id/role",
            put(organizations::update_member_role),
        )
        .route(
            "/:id/invitations",
            get(invitations::list_invitations).post(invitations::create_invitation),
        )
        .route(
            "/:id/invitations/:invitation_id/resend",
            post(invitations::resend_invitation),
        )
        .route(
            "/:id/invitations/:invitation_id/role",
            put(invitations::update_invitation_role),
        );

    let protected_invitation_routes = Router::new()
        .route("/:token/accept", post(invitations::accept_invitation))
        .route("/:token/decline", post(invitations::decline_invitation));

    let protected_state = state.clone();
    let protected_routes = Router::new()
        .nest("/api/user", user_routes)
        .nest("/api/organizations", organization_routes)
        .nest("/api/invitations", protected_invitation_routes)
        .layer(middleware::from_extractor_with_state::<AuthenticatedUser, _>(protected_state));

    Router::new()
        .merge(protected_routes)
        .nest("/api/auth", auth_routes)
        .route("/api/invitations/:token", get(invitations::preview_invitation))
        .route("/api/health", get(health::health_check))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn parse_origins(raw: &str) -> Vec<HeaderValue> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .filter_map(|value| match value.parse::<HeaderValue>() {
            Ok(header) => Some(header),
            Err(_) => {
                tracing::warn!(origin = value, "ignoring invalid CORS allowed origin");
                None
            }
        })
        .collect()
}
