//! The backend capability surface consumed by the rest of the core (§6 of
//! the specification): `begin`/`commit`/`rollback` plus `exec`/`query`.
//!
//! Rather than introduce a generic `Backend` trait with an associated
//! transaction type, this follows `crates/agent-sql`'s own idiom: plain
//! functions taking `&sqlx::PgPool` or `&mut sqlx::Transaction`, with
//! `sqlx::Transaction::{commit, rollback}` standing in directly for the
//! spec's `commit(tx)`/`rollback(tx)`. What *is* added here is the
//! `BackendError`/`BackendErrorCode` mapping, since the specification
//! requires distinguishing specific backend failure classes (unique
//! violation, undefined table, ...) from a generic database error, which
//! raw `sqlx::Error` does not do on its own.

use thiserror::Error;

pub mod pg;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorCode {
    UniqueViolation,
    DuplicateObject,
    DuplicateTable,
    UndefinedTable,
    UndefinedSchema,
    Other,
}

#[derive(Debug, Error)]
#[error("{code:?}: {message}")]
pub struct BackendError {
    pub code: BackendErrorCode,
    pub message: String,
    #[source]
    pub source: Option<anyhow::Error>,
}

impl BackendError {
    pub fn other(err: impl Into<anyhow::Error>) -> Self {
        let err = err.into();
        BackendError {
            code: BackendErrorCode::Other,
            message: err.to_string(),
            source: Some(err),
        }
    }
}

/// Maps a `sqlx::Error` into our `BackendError`, classifying Postgres
/// `SQLSTATE` codes into the handful of classes the specification names.
/// See https://www.postgresql.org/docs/current/errcodes-appendix.html.
pub fn from_sqlx(err: sqlx::Error) -> BackendError {
    let code = match &err {
        sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
            Some("23505") => BackendErrorCode::UniqueViolation,
            Some("42710") => BackendErrorCode::DuplicateObject,
            Some("42P07") => BackendErrorCode::DuplicateTable,
            Some("42P01") => BackendErrorCode::UndefinedTable,
            Some("3F000") => BackendErrorCode::UndefinedSchema,
            _ => BackendErrorCode::Other,
        },
        _ => BackendErrorCode::Other,
    };
    BackendError {
        message: err.to_string(),
        source: Some(err.into()),
        code,
    }
}
