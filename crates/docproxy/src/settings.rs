//! Name Resolver & Settings Store (§4.2). Maps logical `(database,
//! collection)` pairs to physical `(schema, table)` pairs via the
//! per-schema settings document, and owns the collection lifecycle
//! (create/drop), keeping the settings-document mutation and the DDL it
//! coordinates inside one transaction (§3 "Lifecycle").
//!
//! Query shapes here use `sqlx::query`/`query_scalar` rather than the
//! `query!`/`query_as!` compile-time macros used elsewhere in this
//! workspace (e.g. `crates/agent-sql`), because the schema and table
//! identifiers are resolved at runtime per collection and cannot be known
//! when `cargo sqlx prepare` runs.

use crate::backend::{self, pg::quote_ident, BackendErrorCode};
use crate::error::ProxyError;
use crate::names::{self, SETTINGS_TABLE};
use serde_json::Value as Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashMap;

const CREATE_SETTINGS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS {table} (
        singleton boolean PRIMARY KEY DEFAULT true,
        collections jsonb NOT NULL DEFAULT '{{}}'::jsonb,
        CONSTRAINT singleton_is_true CHECK (singleton)
    )
"#;

fn settings_table_sql(db: &str) -> String {
    format!(
        "{}.{}",
        quote_ident(db),
        quote_ident(SETTINGS_TABLE)
    )
}

async fn schema_exists(pool: &PgPool, db: &str) -> Result<bool, ProxyError> {
    let found: Option<bool> = sqlx::query_scalar(
        "SELECT true FROM information_schema.schemata WHERE schema_name = $1",
    )
    .bind(db)
    .fetch_optional(pool)
    .await
    .map_err(backend::from_sqlx)?;
    Ok(found.unwrap_or(false))
}

/// Reads the settings document's `collections` map within `txn`, locking
/// the row so concurrent creators serialize on it (§5). Lazily creates the
/// settings table and its singleton row if the schema exists but has never
/// held a collection.
async fn load_collections_for_update(
    txn: &mut Transaction<'_, Postgres>,
    db: &str,
) -> Result<HashMap<String, String>, ProxyError> {
    let table = settings_table_sql(db);
    sqlx::query(&CREATE_SETTINGS_TABLE.replace("{table}", &table))
        .execute(&mut **txn)
        .await
        .map_err(backend::from_sqlx)?;
    sqlx::query(&format!(
        "INSERT INTO {table} (singleton) VALUES (true) ON CONFLICT (singleton) DO NOTHING"
    ))
    .execute(&mut **txn)
    .await
    .map_err(backend::from_sqlx)?;

    let row = sqlx::query(&format!(
        "SELECT collections FROM {table} WHERE singleton FOR UPDATE"
    ))
    .fetch_one(&mut **txn)
    .await
    .map_err(backend::from_sqlx)?;
    let collections: Json = row.try_get("collections").map_err(backend::from_sqlx)?;

    let map = collections
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();
    Ok(map)
}

async fn store_collections(
    txn: &mut Transaction<'_, Postgres>,
    db: &str,
    collections: &HashMap<String, String>,
) -> Result<(), ProxyError> {
    let table = settings_table_sql(db);
    let doc = serde_json::to_value(
        collections
            .iter()
            .map(|(k, v)| (k.clone(), Json::String(v.clone())))
            .collect::<serde_json::Map<_, _>>(),
    )
    .expect("collections map always serializes");

    sqlx::query(&format!(
        "UPDATE {table} SET collections = $1 WHERE singleton"
    ))
    .bind(doc)
    .execute(&mut **txn)
    .await
    .map_err(backend::from_sqlx)?;
    Ok(())
}

/// `collections(db)`: sorted collection names, by code-point order, applied
/// on read; the stored mapping itself is not kept sorted (§9).
pub async fn collections(pool: &PgPool, db: &str) -> Result<Vec<String>, ProxyError> {
    if !schema_exists(pool, db).await? {
        return Err(ProxyError::SchemaNotExist(db.to_string()));
    }
    let table = settings_table_sql(db);
    let row = sqlx::query(&format!(
        "SELECT collections FROM {table} WHERE singleton"
    ))
    .fetch_optional(pool)
    .await
    .map_err(backend::from_sqlx)?;

    let Some(row) = row else {
        return Ok(Vec::new());
    };
    let collections: Json = row.try_get("collections").map_err(backend::from_sqlx)?;
    let mut names: Vec<String> = collections
        .as_object()
        .map(|obj| obj.keys().cloned().collect())
        .unwrap_or_default();
    names.sort();
    Ok(names)
}

pub async fn collection_exists(pool: &PgPool, db: &str, coll: &str) -> Result<bool, ProxyError> {
    if !schema_exists(pool, db).await? {
        return Ok(false);
    }
    match collections(pool, db).await {
        Ok(names) => Ok(names.iter().any(|n| n == coll)),
        Err(ProxyError::SchemaNotExist(_)) => Ok(false),
        Err(other) => Err(other),
    }
}

/// Resolves a logical `(db, coll)` to its physical table name, without
/// creating anything. Returns `None` if the collection does not exist.
pub async fn resolve_table(
    pool: &PgPool,
    db: &str,
    coll: &str,
) -> Result<Option<String>, ProxyError> {
    if !schema_exists(pool, db).await? {
        return Ok(None);
    }
    let table = settings_table_sql(db);
    let row = sqlx::query(&format!(
        "SELECT collections FROM {table} WHERE singleton"
    ))
    .fetch_optional(pool)
    .await
    .map_err(backend::from_sqlx)?;
    let Some(row) = row else {
        return Ok(None);
    };
    let collections: Json = row.try_get("collections").map_err(backend::from_sqlx)?;
    Ok(collections
        .as_object()
        .and_then(|obj| obj.get(coll))
        .and_then(|v| v.as_str())
        .map(str::to_string))
}

/// Lists logical databases: every schema with a settings table, excluding
/// Postgres's own namespaces and `public`, which never holds collections
/// created through this crate (§4.2 "Databases ~ schemas").
pub async fn list_databases(pool: &PgPool) -> Result<Vec<String>, ProxyError> {
    let mut names: Vec<String> = sqlx::query_scalar(
        "SELECT schema_name FROM information_schema.schemata \
         WHERE schema_name !~ '^pg_' AND schema_name NOT IN ('information_schema', 'public')",
    )
    .fetch_all(pool)
    .await
    .map_err(backend::from_sqlx)?;
    names.sort();
    Ok(names)
}

pub async fn create_collection(pool: &PgPool, db: &str, coll: &str) -> Result<(), ProxyError> {
    names::validate_collection_name(coll)?;
    if !schema_exists(pool, db).await? {
        return Err(ProxyError::SchemaNotExist(db.to_string()));
    }

    let table_name = names::encode_table_name(coll);
    let mut txn = pool.begin().await.map_err(backend::from_sqlx)?;
    let mut map = load_collections_for_update(&mut txn, db).await?;

    if map.contains_key(coll) || map.values().any(|t| t == &table_name) {
        return Err(ProxyError::AlreadyExist(coll.to_string()));
    }

    let table_sql = format!("{}.{}", quote_ident(db), quote_ident(&table_name));
    let create_table = sqlx::query(&format!(
        "CREATE TABLE {table_sql} (_jsonb jsonb NOT NULL)"
    ))
    .execute(&mut *txn)
    .await;

    match create_table {
        Ok(_) => {}
        Err(err) => {
            let backend_err = backend::from_sqlx(err);
            return Err(match backend_err.code {
                BackendErrorCode::DuplicateTable | BackendErrorCode::DuplicateObject => {
                    ProxyError::AlreadyExist(coll.to_string())
                }
                _ => ProxyError::Backend(backend_err),
            });
        }
    }

    map.insert(coll.to_string(), table_name);
    store_collections(&mut txn, db, &map).await?;

    txn.commit().await.map_err(backend::from_sqlx)?;
    Ok(())
}

/// `createCollectionIfNotExist`: creates the schema if missing, tolerates
/// a concurrent creator's `AlreadyExist` and reports `created = false` in
/// that case (§4.2).
pub async fn create_collection_if_not_exist(
    pool: &PgPool,
    db: &str,
    coll: &str,
) -> Result<bool, ProxyError> {
    names::validate_collection_name(coll)?;
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(db)))
        .execute(pool)
        .await
        .map_err(backend::from_sqlx)?;

    match create_collection(pool, db, coll).await {
        Ok(()) => Ok(true),
        Err(ProxyError::AlreadyExist(_)) => Ok(false),
        Err(other) => Err(other),
    }
}

pub async fn drop_collection(pool: &PgPool, db: &str, coll: &str) -> Result<(), ProxyError> {
    if !schema_exists(pool, db).await? {
        return Err(ProxyError::SchemaNotExist(db.to_string()));
    }

    let mut txn = pool.begin().await.map_err(backend::from_sqlx)?;
    let mut map = load_collections_for_update(&mut txn, db).await?;

    let Some(table_name) = map.remove(coll) else {
        return Err(ProxyError::TableNotExist(coll.to_string()));
    };

    store_collections(&mut txn, db, &map).await?;

    let table_sql = format!("{}.{}", quote_ident(db), quote_ident(&table_name));
    sqlx::query(&format!("DROP TABLE {table_sql}"))
        .execute(&mut *txn)
        .await
        .map_err(backend::from_sqlx)?;

    txn.commit().await.map_err(backend::from_sqlx)?;
    Ok(())
}
