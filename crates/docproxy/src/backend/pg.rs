//! Postgres connection setup, grounded in `crates/agent/src/main.rs`'s
//! `PgPoolOptions` construction.

use anyhow::Context;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let options = database_url
        .parse::<PgConnectOptions>()
        .context("parsing database URL")?
        .application_name("docproxy");

    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(std::time::Duration::from_secs(5))
        .connect_with(options)
        .await
        .context("connecting to database")
}

/// Quotes a backend identifier (schema or table name) for safe interpolation
/// into DDL, which sqlx cannot parameterize. `names::validate_database_name`
/// and `names::encode_table_name` already constrain the character set this
/// sees, but quoting stays defense-in-depth against a future relaxation.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
