use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, ensure, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use chrono::{Duration, Utc};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::MigrationHarness;
use fieldops::auth::jwt::JwtService;
use fieldops::auth::password::hash_password;
use fieldops::config::{AppConfig, MailConfig};
use fieldops::db::{self, PgPool};
use fieldops::mailer::{Mailer, OutgoingEmail};
use fieldops::models::{NewMembership, NewUser};
use fieldops::routes;
use fieldops::schema::{organization_invitations, organization_memberships, users};
use fieldops::state::AppState;
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tower::util::ServiceExt;
use uuid::Uuid;

pub const APP_ORIGIN: &str = "https://app.test";

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Records outgoing mail instead of sending it. Can be switched into a failing
/// mode to simulate a delivery outage.
#[derive(Default)]
pub struct FakeMailer {
    sent: Mutex<Vec<OutgoingEmail>>,
    failing: AtomicBool,
}

#[async_trait]
impl Mailer for FakeMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("mail provider unavailable");
        }
        self.sent.lock().await.push(email);
        Ok(())
    }
}

impl FakeMailer {
    #[allow(dead_code)]
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    #[allow(dead_code)]
    pub async fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().await.clone()
    }
}

pub struct TestApp {
    pub state: AppState,
    router: Router,
    mailer: Arc<FakeMailer>,
}

impl TestApp {
    pub async fn new() -> Result<Self> {
        let database_url = env::var("TEST_DATABASE_URL")
            .context("TEST_DATABASE_URL must be set for integration tests")?;

        let config = AppConfig {
            database_url: database_url.clone(),
            database_max_pool_size: db::DEFAULT_MAX_POOL_SIZE,
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            jwt_secret: "test-secret".to_string(),
            jwt_issuer: "test-issuer".to_string(),
            jwt_audience: "test-audience".to_string(),
            jwt_expiry_minutes: 60,
            refresh_token_expiry_days: 30,
            session_cookie_secure: false,
            session_cookie_domain: None,
            cors_allowed_origin: None,
            app_origin: APP_ORIGIN.to_string(),
            invitation_expiry_days: 7,
            mail: MailConfig {
                api_url: None,
                api_key: None,
                sender_email: "noreply@app.test".to_string(),
                sender_name: "Fieldops".to_string(),
            },
        };

        let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
        prepare_database(&pool).await?;

        let mailer = Arc::new(FakeMailer::default());
        let mailer_for_state: Arc<dyn Mailer> = mailer.clone();
        let jwt = JwtService::from_config(&config)?;
        let state = AppState::new(pool.clone(), config, mailer_for_state, jwt);
        let router = routes::create_router(state.clone());

        Ok(Self {
            state,
            router,
            mailer,
        })
    }

    pub async fn cleanup(&self) -> Result<()> {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get cleanup connection: {err}"))?;
            truncate_all(&mut conn)?;
            Ok(())
        })
        .await
        .context("cleanup task panicked")?
    }

    #[allow(dead_code)]
    pub fn mailer(&self) -> Arc<FakeMailer> {
        self.mailer.clone()
    }

    pub async fn insert_user(&self, email: &str, password: &str, verified: bool) -> Result<Uuid> {
        let email = email.to_string();
        let password = password.to_string();
        self.with_conn(move |conn| {
            let user = NewUser {
                id: Uuid::new_v4(),
                email,
                name: None,
                password_hash: Some(hash_password(&password)?),
                email_verified_at: verified.then(|| Utc::now().naive_utc()),
            };
            diesel::insert_into(users::table)
                .values(&user)
                .execute(conn)
                .context("failed to insert user")?;
            Ok(user.id)
        })
        .await
    }

    pub async fn login_token(&self, email: &str, password: &str) -> Result<String> {
        let response = self
            .post_json(
                "/api/auth/login",
                &json!({ "email": email, "password": password }),
                None,
            )
            .await?;

        ensure!(
            response.status() == StatusCode::OK,
            "login failed with status {}",
            response.status()
        );

        let body: Value = read_json(response).await?;
        access_token(&body)
    }

    /// Creates an organization owned by the user behind `token` and switches
    /// that user into it. Returns the organization id and the new token.
    #[allow(dead_code)]
    pub async fn create_organization(&self, token: &str, name: &str) -> Result<(Uuid, String)> {
        let response = self
            .post_json(
                "/api/organizations",
                &json!({ "name": name, "organization_type": "vendor" }),
                Some(token),
            )
            .await?;
        ensure!(
            response.status() == StatusCode::CREATED,
            "organization creation failed with status {}",
            response.status()
        );
        let body: Value = read_json(response).await?;
        let organization_id: Uuid = body["organization"]["id"]
            .as_str()
            .context("organization id missing")?
            .parse()?;

        let token = self.switch_organization(token, organization_id).await?;
        Ok((organization_id, token))
    }

    #[allow(dead_code)]
    pub async fn switch_organization(&self, token: &str, organization_id: Uuid) -> Result<String> {
        let response = self
            .post_json(
                "/api/user/set-organization",
                &json!({ "organization_id": organization_id }),
                Some(token),
            )
            .await?;
        ensure!(
            response.status() == StatusCode::OK,
            "switching organization failed with status {}",
            response.status()
        );
        let body: Value = read_json(response).await?;
        access_token(&body)
    }

    /// Inserts a live membership directly, bypassing the invitation flow.
    #[allow(dead_code)]
    pub async fn insert_membership(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
        role: &str,
    ) -> Result<()> {
        let role = role.to_string();
        self.with_conn(move |conn| {
            diesel::insert_into(organization_memberships::table)
                .values(&NewMembership {
                    id: Uuid::new_v4(),
                    user_id,
                    organization_id,
                    role,
                    is_active: true,
                    is_verified: true,
                })
                .execute(conn)
                .context("failed to insert membership")?;
            Ok(())
        })
        .await
    }

    /// Moves an invitation's expiry into the past.
    #[allow(dead_code)]
    pub async fn backdate_invitation(&self, invitation_id: Uuid) -> Result<()> {
        self.with_conn(move |conn| {
            diesel::update(organization_invitations::table.find(invitation_id))
                .set(
                    organization_invitations::expires_at
                        .eq(Utc::now().naive_utc() - Duration::hours(1)),
                )
                .execute(conn)
                .context("failed to backdate invitation")?;
            Ok(())
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn invitation_status(&self, invitation_id: Uuid) -> Result<String> {
        self.with_conn(move |conn| {
            organization_invitations::table
                .find(invitation_id)
                .select(organization_invitations::status)
                .first(conn)
                .context("failed to load invitation status")
        })
        .await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        self.send_json(Method::POST, path, payload, token).await
    }

    #[allow(dead_code)]
    pub async fn put_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        self.send_json(Method::PUT, path, payload, token).await
    }

    #[allow(dead_code)]
    pub async fn patch_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        self.send_json(Method::PATCH, path, payload, token).await
    }

    #[allow(dead_code)]
    pub async fn get(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        self.send_empty(Method::GET, path, token).await
    }

    #[allow(dead_code)]
    pub async fn delete(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        self.send_empty(Method::DELETE, path, token).await
    }

    async fn send_json<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    async fn send_empty(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

pub async fn read_json<T: DeserializeOwned>(response: hyper::Response<Body>) -> Result<T> {
    let body = body_to_vec(response.into_body()).await?;
    serde_json::from_slice(&body).context("response body is not the expected JSON")
}

pub fn access_token(body: &Value) -> Result<String> {
    body["access_token"]
        .as_str()
        .map(str::to_string)
        .context("access_token missing from response")
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.run_pending_migrations(db::MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        truncate_all(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute(
        "TRUNCATE TABLE organization_invitations, user_organization_contexts, \
         organization_memberships, organizations, refresh_tokens, users CASCADE;",
    )
    .context("failed to truncate tables")?;
    Ok(())
}
