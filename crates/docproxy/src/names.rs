//! Logical-name validation and the logical-to-physical name encoding
//! (§3 / §4.2 of the specification).
//!
//! The validation regexes are process-wide immutable configuration,
//! compiled once at startup, the same `lazy_static!` idiom used for
//! Flow's own catalog-name regexes in `crates/models/src/names.rs`.

use crate::error::ProxyError;
use lazy_static::lazy_static;
use regex::Regex;

/// Prefix reserved for this crate's own metadata tables. A collection name
/// is rejected if it begins with this prefix, so user collections can never
/// collide with the settings table (§3, §4.2).
pub const RESERVED_TABLE_PREFIX: &str = "_docproxy_";

/// Name of the per-schema settings table (§3 "Settings document").
pub const SETTINGS_TABLE: &str = "_docproxy_settings";

/// Postgres identifiers are truncated (silently, if not careful) at 63
/// bytes (`NAMEDATALEN - 1`). We bound our own encoded table names well
/// under that so a hash suffix always fits.
const MAX_TABLE_NAME_LEN: usize = 63;
const HASH_SUFFIX_LEN: usize = 8;

lazy_static! {
    static ref DATABASE_NAME_RE: Regex = Regex::new(r"^[a-z_][a-z0-9_]{0,62}$").unwrap();
    static ref COLLECTION_NAME_RE: Regex =
        Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]{0,119}$").unwrap();
}

pub fn validate_database_name(name: &str) -> Result<(), ProxyError> {
    if DATABASE_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(ProxyError::InvalidName(name.to_string()))
    }
}

pub fn validate_collection_name(name: &str) -> Result<(), ProxyError> {
    if !COLLECTION_NAME_RE.is_match(name) {
        return Err(ProxyError::InvalidName(name.to_string()));
    }
    if name.starts_with(RESERVED_TABLE_PREFIX) {
        return Err(ProxyError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Encodes a validated collection name into a stable physical table name.
///
/// The encoding lowercases and replaces non-`[a-z0-9_]` bytes with `_`.
/// A short hash suffix of the *original* name is appended whenever that
/// transform is lossy (distinct collection names could fold to the same
/// base, e.g. `Orders` and `orders`) or the result would otherwise exceed
/// the backend's identifier length limit, both exactly the cases the
/// specification calls out as collision-prone. The same collection name
/// always encodes to the same table name, across restarts.
pub fn encode_table_name(collection: &str) -> String {
    let base: String = collection
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();

    let lossy = base != collection || base.len() > MAX_TABLE_NAME_LEN - HASH_SUFFIX_LEN - 1;
    if !lossy {
        return base;
    }

    let digest = md5::compute(collection.as_bytes());
    let suffix = hex::encode(&digest.0[..HASH_SUFFIX_LEN / 2]);
    let truncated_len = MAX_TABLE_NAME_LEN - suffix.len() - 1;
    let truncated: String = base.chars().take(truncated_len).collect();
    format!("{truncated}_{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_name_accepts_regex_language() {
        assert!(validate_database_name("acme").is_ok());
        assert!(validate_database_name("acme_db_1").is_ok());
        assert!(validate_database_name("_private").is_ok());
        assert!(validate_database_name("1bad").is_err());
        assert!(validate_database_name("Acme").is_err());
        assert!(validate_database_name("").is_err());
        assert!(validate_database_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn collection_name_rejects_reserved_prefix() {
        assert!(validate_collection_name("users").is_ok());
        assert!(validate_collection_name("_docproxy_settings").is_err());
        assert!(validate_collection_name("1bad").is_err());
    }

    #[test]
    fn table_encoding_is_stable_and_deterministic() {
        assert_eq!(encode_table_name("users"), "users");
        assert_eq!(encode_table_name("users"), encode_table_name("users"));
    }

    #[test]
    fn table_encoding_avoids_case_collisions() {
        let lower = encode_table_name("orders");
        let upper = encode_table_name("Orders");
        assert_ne!(lower, upper, "distinct collection names must not collide");
        assert_eq!(lower, "orders");
        assert!(upper.starts_with("orders_"));
    }

    #[test]
    fn table_encoding_bounds_length() {
        let long_name = "a".repeat(200);
        let encoded = encode_table_name(&long_name);
        assert!(encoded.len() <= MAX_TABLE_NAME_LEN);
    }
}
