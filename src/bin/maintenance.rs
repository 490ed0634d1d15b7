use std::env;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, PooledConnection};
use diesel::PgConnection;
use uuid::Uuid;

use fieldops::{
    auth::password,
    config::AppConfig,
    db,
    models::{NewUser, User},
    org_context,
    schema::users,
};

const USAGE: &str = "Usage:
  maintenance create-user <email> <password> [--verified]
  maintenance verify-user <email>
  maintenance memberships <email>";

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{USAGE}");
        std::process::exit(1);
    };

    let mut conn = connect()?;
    match (command.as_str(), &args[1..]) {
        ("create-user", [email, secret]) => create_user(&mut conn, email, secret, false)?,
        ("create-user", [email, secret, flag]) if flag == "--verified" => {
            create_user(&mut conn, email, secret, true)?
        }
        ("verify-user", [email]) => verify_user(&mut conn, email)?,
        ("memberships", [email]) => print_memberships(&mut conn, email)?,
        _ => {
            eprintln!("Unknown or malformed command: {}\n{USAGE}", args.join(" "));
            std::process::exit(1);
        }
    }

    Ok(())
}

fn connect() -> Result<PooledConnection<ConnectionManager<PgConnection>>> {
    let config = AppConfig::from_env()?;
    println!("Using database {}", config.redacted_database_url());
    let pool = db::init_pool_with_size(&config.database_url, 1)?;
    db::run_migrations(&pool)?;
    pool.get().context("failed to get database connection")
}

fn create_user(conn: &mut PgConnection, email: &str, secret: &str, verified: bool) -> Result<()> {
    let new_user = NewUser {
        id: Uuid::new_v4(),
        email: email.to_string(),
        name: None,
        password_hash: Some(password::hash_password(secret)?),
        email_verified_at: verified.then(|| Utc::now().naive_utc()),
    };
    diesel::insert_into(users::table)
        .values(&new_user)
        .execute(conn)
        .with_context(|| format!("failed to create user {email}"))?;

    println!(
        "Created user {email} ({}){}",
        new_user.id,
        if verified { ", verified" } else { "" }
    );
    Ok(())
}

fn verify_user(conn: &mut PgConnection, email: &str) -> Result<()> {
    let now = Utc::now().naive_utc();
    let updated = diesel::update(
        users::table
            .filter(users::email.eq(email))
            .filter(users::email_verified_at.is_null()),
    )
    .set((users::email_verified_at.eq(now), users::updated_at.eq(now)))
    .execute(conn)
    .context("failed to verify user")?;

    if updated == 0 {
        find_user(conn, email)?;
        println!("{email} is already verified.");
    } else {
        println!("Verified {email}.");
    }
    Ok(())
}

fn print_memberships(conn: &mut PgConnection, email: &str) -> Result<()> {
    let user = find_user(conn, email)?;
    let memberships = org_context::list_memberships(conn, user.id)?;
    let current = org_context::get_current(conn, user.id)?;

    if memberships.is_empty() {
        println!("{email} has no active memberships.");
        return Ok(());
    }

    for membership in &memberships {
        let marker = match current {
            Some(current) if current.organization_id == membership.organization_id => "*",
            _ => " ",
        };
        println!(
            "{marker} {} {:<30} {:<8} {}",
            membership.organization_id,
            membership.organization_name,
            membership.organization_type,
            membership.role
        );
    }
    Ok(())
}

fn find_user(conn: &mut PgConnection, email: &str) -> Result<User> {
    let user: Option<User> = users::table
        .filter(users::email.eq(email))
        .first(conn)
        .optional()
        .context("failed to load user")?;
    match user {
        Some(user) => Ok(user),
        None => bail!("no user with email {email}"),
    }
}
