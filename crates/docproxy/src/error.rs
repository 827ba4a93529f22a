//! The public error taxonomy (§7 of the specification) and its translation
//! into wire-visible shapes. Grounded in `crates/control/src/error.rs`'s
//! `AppError`/`#[from]` pattern, adapted from an HTTP `IntoResponse` target
//! to a MongoDB `writeErrors`/command-error target.

use crate::value::{Document, Value, ValueError};

/// Error codes mirroring a (small) subset of MongoDB's own numeric error
/// codes, so that clients which switch on `code` see familiar values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    BadValue = 2,
    TypeMismatch = 14,
    NamespaceNotFound = 26,
    NamespaceExists = 48,
    Unimplemented = 115,
    Cancelled = 11601,
    Internal = 1,
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid name `{0}`")]
    InvalidName(String),

    #[error("`{0}` already exists")]
    AlreadyExist(String),

    #[error("schema `{0}` does not exist")]
    SchemaNotExist(String),

    #[error("table `{0}` does not exist")]
    TableNotExist(String),

    #[error(transparent)]
    TypeMismatch(#[from] ValueError),

    #[error("bad value: {0}")]
    BadValue(String),

    #[error("`{0}` is not implemented")]
    Unimplemented(String),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("database error")]
    Backend(#[from] crate::backend::BackendError),

    #[error("stored document could not be decoded: {0}")]
    Codec(#[from] crate::codec::CodecError),
}

impl ProxyError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProxyError::InvalidName(_) => ErrorCode::BadValue,
            ProxyError::AlreadyExist(_) => ErrorCode::NamespaceExists,
            ProxyError::SchemaNotExist(_) | ProxyError::TableNotExist(_) => {
                ErrorCode::NamespaceNotFound
            }
            ProxyError::TypeMismatch(_) => ErrorCode::TypeMismatch,
            ProxyError::BadValue(_) => ErrorCode::BadValue,
            ProxyError::Unimplemented(_) => ErrorCode::Unimplemented,
            ProxyError::Cancelled => ErrorCode::Cancelled,
            ProxyError::Internal(_) | ProxyError::Backend(_) => ErrorCode::Internal,
        }
    }

    /// Builds a single entry of a `writeErrors` array for the statement at
    /// `index` within an `insert`/`update`/`delete` batch.
    pub fn to_write_error(&self, index: usize) -> Document {
        Document::from_pairs([
            ("index".to_string(), Value::Int32(index as i32)),
            ("code".to_string(), Value::Int32(self.code() as i32)),
            ("errmsg".to_string(), Value::String(self.to_string())),
        ])
    }

    /// Builds the `{ ok: 0.0, code, errmsg }` shape used for whole-command
    /// failures that never reach per-statement accounting (e.g. the
    /// command's collection name was not a string at all).
    pub fn to_command_error(&self) -> Document {
        Document::from_pairs([
            ("ok".to_string(), Value::Double(0.0)),
            ("code".to_string(), Value::Int32(self.code() as i32)),
            ("errmsg".to_string(), Value::String(self.to_string())),
        ])
    }
}
