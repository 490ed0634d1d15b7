pub mod auth;
pub mod authz;
pub mod config;
pub mod db;
pub mod error;
pub mod invitations;
pub mod mailer;
pub mod models;
pub mod org_context;
pub mod routes;
pub mod schema;
pub mod state;
pub mod utils;
