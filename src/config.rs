use std::env;
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use anyhow::{ensure, Context, Result};
use url::Url;

use crate::db::DEFAULT_MAX_POOL_SIZE;

const MAX_POOL_SIZE: u32 = 256;
const MAX_JWT_EXPIRY_MINUTES: i64 = 60 * 24 * 7;
const MAX_EXPIRY_DAYS: i64 = 365;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_pool_size: u32,
    pub server_host: String,
    pub server_port: u16,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub jwt_expiry_minutes: i64,
    pub refresh_token_expiry_days: i64,
    pub session_cookie_secure: bool,
    pub session_cookie_domain: Option<String>,
    pub cors_allowed_origin: Option<String>,
    pub app_origin: String,
    pub invitation_expiry_days: i64,
    pub mail: MailConfig,
}

#[derive(Clone, Debug)]
pub struct MailConfig {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub sender_email: String,
    pub sender_name: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let database_max_pool_size = in_range(
            "DATABASE_MAX_POOL_SIZE",
            parse_var("DATABASE_MAX_POOL_SIZE", DEFAULT_MAX_POOL_SIZE)?,
            1..=MAX_POOL_SIZE,
        )?;
        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let server_port = parse_var("SERVER_PORT", 3000)?;
        let jwt_secret = env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        let jwt_issuer = env::var("JWT_ISSUER").unwrap_or_else(|_| "fieldops".to_string());
        let jwt_audience =
            env::var("JWT_AUDIENCE").unwrap_or_else(|_| "fieldops-clients".to_string());
        let jwt_expiry_minutes = in_range(
            "JWT_EXPIRY_MINUTES",
            parse_var("JWT_EXPIRY_MINUTES", 60)?,
            1..=MAX_JWT_EXPIRY_MINUTES,
        )?;
        let refresh_token_expiry_days = in_range(
            "REFRESH_TOKEN_EXPIRY_DAYS",
            parse_var("REFRESH_TOKEN_EXPIRY_DAYS", 30)?,
            1..=MAX_EXPIRY_DAYS,
        )?;
        let session_cookie_secure = env::var("SESSION_COOKIE_SECURE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let session_cookie_domain = env::var("SESSION_COOKIE_DOMAIN").ok();
        let cors_allowed_origin = env::var("CORS_ALLOWED_ORIGIN").ok();
        let app_origin = normalize_origin(
            &env::var("APP_ORIGIN").unwrap_or_else(|_| "http://localhost:3000".to_string()),
        )?;
        let invitation_expiry_days = in_range(
            "INVITATION_EXPIRY_DAYS",
            parse_var("INVITATION_EXPIRY_DAYS", 7)?,
            1..=MAX_EXPIRY_DAYS,
        )?;

        let mail = MailConfig {
            api_url: env::var("MAIL_API_URL").ok().filter(|v| !v.trim().is_empty()),
            api_key: env::var("MAIL_API_KEY").ok().filter(|v| !v.trim().is_empty()),
            sender_email: env::var("MAIL_SENDER_EMAIL")
                .unwrap_or_else(|_| "noreply@fieldops.local".to_string()),
            sender_name: env::var("MAIL_SENDER_NAME").unwrap_or_else(|_| "FieldOps".to_string()),
        };

        Ok(Self {
            database_url,
            database_max_pool_size,
            server_host,
            server_port,
            jwt_secret,
            jwt_issuer,
            jwt_audience,
            jwt_expiry_minutes,
            refresh_token_expiry_days,
            session_cookie_secure,
            session_cookie_domain,
            cors_allowed_origin,
            app_origin,
            invitation_expiry_days,
            mail,
        })
    }

    pub fn redacted_database_url(&self) -> String {
        redact_database_url(&self.database_url)
    }

    /// Link for an invitee who already has an account.
    pub fn invitation_link(&self, token: &str) -> String {
        format!("{}/invitations/{token}", self.app_origin)
    }

    /// Link for an invitee who still has to sign up.
    pub fn signup_link(&self, token: &str) -> String {
        format!("{}/signup?invitation={token}", self.app_origin)
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    parse_value(name, env::var(name).ok().as_deref(), default)
}

fn parse_value<T: FromStr>(name: &str, raw: Option<&str>, default: T) -> Result<T> {
    match raw {
        Some(raw) => raw
            .trim()
            .parse()
            .ok()
            .with_context(|| format!("{name} must be a valid {}", std::any::type_name::<T>())),
        None => Ok(default),
    }
}

fn in_range<T>(name: &str, value: T, range: RangeInclusive<T>) -> Result<T>
where
    T: PartialOrd + fmt::Display,
{
    ensure!(
        range.contains(&value),
        "{name} must be between {} and {}, got {value}",
        range.start(),
        range.end()
    );
    Ok(value)
}

fn normalize_origin(raw: &str) -> Result<String> {
    let parsed = Url::parse(raw).with_context(|| format!("APP_ORIGIN `{raw}` is not a URL"))?;
    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

fn redact_database_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut parsed) => {
            let _ = parsed.set_password(Some("*****"));
            parsed.to_string()
        }
        Err(_) => "***".to_string(),
    }
}
