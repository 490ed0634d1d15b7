mod common;

use anyhow::Result;
use axum::http::{header::SET_COOKIE, StatusCode};
use common::{access_token, acquire_db_lock, read_json, TestApp};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Deserialize)]
struct AuthenticatedUser {
    email: String,
    memberships: Vec<Value>,
    current: Option<Value>,
}

#[tokio::test]
async fn login_and_me_roundtrip() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let password = "s3cret-password";
    app.insert_user("alice@example.com", password, true).await?;

    let token = app.login_token("alice@example.com", password).await?;

    let response = app.get("/api/auth/me", Some(&token)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let user: AuthenticatedUser = read_json(response).await?;

    assert_eq!(user.email, "alice@example.com");
    assert!(user.memberships.is_empty());
    assert!(user.current.is_none());

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn login_sets_session_and_refresh_cookies() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    app.insert_user("alice@example.com", "s3cret-password", true)
        .await?;
    let response = app
        .post_json(
            "/api/auth/login",
            &json!({ "email": "alice@example.com", "password": "s3cret-password" }),
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let cookies: Vec<String> = response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok().map(str::to_string))
        .collect();
    assert!(cookies.iter().any(|c| c.starts_with("session_token=")));
    assert!(cookies
        .iter()
        .any(|c| c.starts_with("refresh_token=") && c.contains("HttpOnly")));

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn bad_credentials_and_missing_tokens_are_unauthorized() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    app.insert_user("alice@example.com", "s3cret-password", true)
        .await?;

    let wrong_password = app
        .post_json(
            "/api/auth/login",
            &json!({ "email": "alice@example.com", "password": "nope-nope" }),
            None,
        )
        .await?;
    assert_eq!(wrong_password.status(), StatusCode::UNAUTHORIZED);

    let unknown_user = app
        .post_json(
            "/api/auth/login",
            &json!({ "email": "nobody@example.com", "password": "s3cret-password" }),
            None,
        )
        .await?;
    assert_eq!(unknown_user.status(), StatusCode::UNAUTHORIZED);

    let anonymous = app.get("/api/organizations", None).await?;
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let forged = app.get("/api/auth/me", Some("not-a-jwt")).await?;
    assert_eq!(forged.status(), StatusCode::UNAUTHORIZED);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn registration_validates_and_rejects_duplicates() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let invalid = app
        .post_json(
            "/api/auth/register",
            &json!({ "email": "not-an-email", "password": "short" }),
            None,
        )
        .await?;
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    let body: Value = read_json(invalid).await?;
    assert!(body["details"]["email"].is_array());
    assert!(body["details"]["password"].is_array());

    let created = app
        .post_json(
            "/api/auth/register",
            &json!({ "email": "carol@example.com", "password": "long-enough-pw" }),
            None,
        )
        .await?;
    assert_eq!(created.status(), StatusCode::CREATED);
    let body: Value = read_json(created).await?;
    assert!(access_token(&body).is_ok());
    assert_eq!(body["user"]["email_verified"], json!(false));
    assert!(body["joined_organization"].is_null());

    let duplicate = app
        .post_json(
            "/api/auth/register",
            &json!({ "email": "carol@example.com", "password": "long-enough-pw" }),
            None,
        )
        .await?;
    assert_eq!(duplicate.status(), StatusCode::BAD_REQUEST);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    app.insert_user("alice@example.com", "s3cret-password", true)
        .await?;
    let token = app
        .login_token("alice@example.com", "s3cret-password")
        .await?;

    let response = app
        .post_json(
            "/api/user/set-organization",
            &json!({ "organization_id": "not-a-uuid" }),
            Some(&token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    app.cleanup().await?;
    Ok(())
}
