//! Low-level per-row table access backing the write-side commands
//! (insert/update/delete). Unlike [`crate::cursor::Cursor`], which only
//! needs to stream documents outward for `find`, writes need to address
//! individual rows -- and the physical table has a single `_jsonb` column
//! (§6 "On-disk / backend layout"), with no identity column of its own.
//! Postgres's row identifier (`ctid`) stands in for one, valid only within
//! the scope of the transaction that read it.

use crate::backend::{self};
use crate::codec;
use crate::error::ProxyError;
use crate::value::Document;
use sqlx::{Postgres, Row, Transaction};

fn table_sql(schema: &str, table: &str) -> String {
    format!(
        "{}.{}",
        backend::pg::quote_ident(schema),
        backend::pg::quote_ident(table)
    )
}

pub async fn insert_one(
    txn: &mut Transaction<'_, Postgres>,
    schema: &str,
    table: &str,
    doc: &Document,
) -> Result<(), ProxyError> {
    let json = codec::document_to_canonical_json(doc);
    sqlx::query(&format!(
        "INSERT INTO {} (_jsonb) VALUES ($1::jsonb)",
        table_sql(schema, table)
    ))
    .bind(json)
    .execute(&mut *txn)
    .await
    .map_err(backend::from_sqlx)?;
    Ok(())
}

/// A table row, scoped to the transaction that produced it -- `ctid` is
/// only stable for the lifetime of that transaction.
pub struct StoredRow {
    pub ctid: String,
    pub doc: Document,
}

/// Reads every row of the table. Returns an empty `Vec` rather than an
/// error when the table does not exist, matching the cursor's "dropped
/// collection" behavior (§4.3) for the write path's own pre-fetch.
pub async fn scan(
    txn: &mut Transaction<'_, Postgres>,
    schema: &str,
    table: &str,
) -> Result<Vec<StoredRow>, ProxyError> {
    let sql = format!(
        "SELECT ctid::text AS ctid, _jsonb FROM {}",
        table_sql(schema, table)
    );
    let rows = match sqlx::query(&sql).fetch_all(&mut *txn).await {
        Ok(rows) => rows,
        Err(err) => {
            let backend_err = backend::from_sqlx(err);
            if backend_err.code == backend::BackendErrorCode::UndefinedTable {
                return Ok(Vec::new());
            }
            return Err(ProxyError::Backend(backend_err));
        }
    };

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let ctid: String = row.try_get("ctid").map_err(backend::from_sqlx)?;
        let text: String = row.try_get("_jsonb").map_err(backend::from_sqlx)?;
        out.push(StoredRow {
            ctid,
            doc: codec::document_from_canonical_json(&text)?,
        });
    }
    Ok(out)
}

pub async fn delete_by_ctid(
    txn: &mut Transaction<'_, Postgres>,
    schema: &str,
    table: &str,
    ctids: &[String],
) -> Result<u64, ProxyError> {
    if ctids.is_empty() {
        return Ok(0);
    }
    let result = sqlx::query(&format!(
        "DELETE FROM {} WHERE ctid = ANY($1::text[]::tid[])",
        table_sql(schema, table)
    ))
    .bind(ctids)
    .execute(&mut *txn)
    .await
    .map_err(backend::from_sqlx)?;
    Ok(result.rows_affected())
}

pub async fn replace_by_ctid(
    txn: &mut Transaction<'_, Postgres>,
    schema: &str,
    table: &str,
    ctid: &str,
    doc: &Document,
) -> Result<(), ProxyError> {
    let json = codec::document_to_canonical_json(doc);
    sqlx::query(&format!(
        "UPDATE {} SET _jsonb = $1::jsonb WHERE ctid = $2::text::tid",
        table_sql(schema, table)
    ))
    .bind(json)
    .bind(ctid)
    .execute(&mut *txn)
    .await
    .map_err(backend::from_sqlx)?;
    Ok(())
}
