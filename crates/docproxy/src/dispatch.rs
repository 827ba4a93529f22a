//! Command Dispatcher (§4.4). One function per supported command; each
//! parses its arguments out of the incoming command document, drives the
//! relevant pipeline -- the name resolver + settings store, the cursor +
//! filter/limit/projection, or the per-row write executor -- and assembles
//! the reply document. Commands are matched over a closed set rather than
//! dispatched through open polymorphism (§9-ORIG "Polymorphism"), mirroring
//! `crates/dekaf/src/lib.rs`'s `handle_api` match over `messages::ApiKey`.

use crate::backend;
use crate::cursor::Cursor;
use crate::error::ProxyError;
use crate::filter;
use crate::names;
use crate::rows::{self, StoredRow};
use crate::settings;
use crate::value::{Document, Value, ValueError};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

/// Options that would silently change semantics if ignored, so they are
/// rejected outright rather than acknowledged (§6).
const STRICT_UNKNOWN_OPTIONS: &[&str] = &["let", "collation", "hint"];

/// Top-level entry point: dispatches one command document to its handler
/// and always returns a reply document, converting whole-request failures
/// into the `{ok: 0.0, code, errmsg}` shape (§4.4 step 4 / §7).
pub async fn dispatch(pool: &PgPool, request: &Document, cancel: CancellationToken) -> Document {
    match dispatch_inner(pool, request, cancel).await {
        Ok(reply) => reply,
        Err(err) => err.to_command_error(),
    }
}

async fn dispatch_inner(
    pool: &PgPool,
    request: &Document,
    cancel: CancellationToken,
) -> Result<Document, ProxyError> {
    reject_strict_unknown_options(request)?;

    if request.contains_key("hello") || request.contains_key("isMaster") || request.contains_key("ismaster")
    {
        return Ok(hello_reply());
    }
    if request.contains_key("listDatabases") {
        return list_databases(pool).await;
    }
    if let Some(coll) = command_field(request, "find") {
        return find(pool, request, coll?, cancel).await;
    }
    if let Some(coll) = command_field(request, "insert") {
        return insert(pool, request, coll?).await;
    }
    if let Some(coll) = command_field(request, "delete") {
        return delete(pool, request, coll?, cancel).await;
    }
    if let Some(coll) = command_field(request, "update") {
        return update(pool, request, coll?, cancel).await;
    }
    if let Some(coll) = command_field(request, "drop") {
        return drop_collection(pool, request, coll?).await;
    }
    if let Some(coll) = command_field(request, "create") {
        return create_collection(pool, request, coll?).await;
    }
    if request.contains_key("listCollections") {
        return list_collections(pool, request).await;
    }

    Err(ProxyError::Unimplemented(format!(
        "unrecognized command in request with keys {:?}",
        request.keys().collect::<Vec<_>>()
    )))
}

/// Everything not in [`STRICT_UNKNOWN_OPTIONS`] -- `comment`, `writeConcern`,
/// `ordered`, `lsid`, session/transaction bookkeeping fields, etc. -- is
/// acknowledged implicitly, simply by never being inspected (§4.4 step 1).
fn reject_strict_unknown_options(request: &Document) -> Result<(), ProxyError> {
    for key in STRICT_UNKNOWN_OPTIONS {
        if request.contains_key(key) {
            return Err(ProxyError::Unimplemented((*key).to_string()));
        }
    }
    Ok(())
}

/// Returns the command's primary field (the collection name) if `request`
/// names this `command`, treating a present-but-non-string value as
/// `BadValue` rather than silently skipping to the next command check.
fn command_field(request: &Document, command: &str) -> Option<Result<String, ProxyError>> {
    request.get_opt(command).map(|v| match v {
        Value::String(s) => Ok(s.clone()),
        other => Err(ProxyError::BadValue(format!(
            "'{command}' must be a string collection name, found {}",
            other.type_name()
        ))),
    })
}

fn resolve_db(request: &Document) -> Result<String, ProxyError> {
    let db = match request.get_opt("$db") {
        Some(Value::String(s)) => s.clone(),
        Some(_) => return Err(ProxyError::BadValue("'$db' must be a string".to_string())),
        None => return Err(ProxyError::BadValue("request is missing '$db'".to_string())),
    };
    names::validate_database_name(&db)?;
    Ok(db)
}

fn as_i64(value: &Value) -> Result<i64, ProxyError> {
    match value {
        Value::Int32(i) => Ok(*i as i64),
        Value::Int64(i) => Ok(*i),
        Value::Double(d) => Ok(*d as i64),
        other => Err(ValueError::TypeMismatch {
            expected: "int",
            actual: other.type_name(),
        }
        .into()),
    }
}

fn as_bool_or(value: Option<&Value>, default: bool) -> bool {
    match value {
        Some(Value::Boolean(b)) => *b,
        _ => default,
    }
}

fn hello_reply() -> Document {
    Document::from_pairs([
        ("isWritablePrimary".to_string(), Value::Boolean(true)),
        ("maxWireVersion".to_string(), Value::Int32(17)),
        ("minWireVersion".to_string(), Value::Int32(0)),
        ("readOnly".to_string(), Value::Boolean(false)),
        ("ok".to_string(), Value::Double(1.0)),
    ])
}

async fn list_databases(pool: &PgPool) -> Result<Document, ProxyError> {
    let names = settings::list_databases(pool).await?;
    let entries = names
        .into_iter()
        .map(|name| {
            Value::Document(Document::from_pairs([
                ("name".to_string(), Value::String(name)),
                ("sizeOnDisk".to_string(), Value::Int64(0)),
                ("empty".to_string(), Value::Boolean(false)),
            ]))
        })
        .collect();
    Ok(Document::from_pairs([
        ("databases".to_string(), Value::Array(entries)),
        ("totalSize".to_string(), Value::Int64(0)),
        ("ok".to_string(), Value::Double(1.0)),
    ]))
}

async fn list_collections(pool: &PgPool, request: &Document) -> Result<Document, ProxyError> {
    let db = resolve_db(request)?;
    let names = settings::collections(pool, &db).await.or_else(|err| match err {
        ProxyError::SchemaNotExist(_) => Ok(Vec::new()),
        other => Err(other),
    })?;
    let entries = names
        .into_iter()
        .map(|name| {
            Value::Document(Document::from_pairs([
                ("name".to_string(), Value::String(name)),
                ("type".to_string(), Value::String("collection".to_string())),
            ]))
        })
        .collect();
    let cursor = Document::from_pairs([
        ("id".to_string(), Value::Int64(0)),
        ("ns".to_string(), Value::String(format!("{db}.$cmd.listCollections"))),
        ("firstBatch".to_string(), Value::Array(entries)),
    ]);
    Ok(Document::from_pairs([
        ("cursor".to_string(), Value::Document(cursor)),
        ("ok".to_string(), Value::Double(1.0)),
    ]))
}

async fn create_collection(pool: &PgPool, request: &Document, coll: String) -> Result<Document, ProxyError> {
    let db = resolve_db(request)?;
    settings::create_collection_if_not_exist(pool, &db, &coll)
        .await
        .and_then(|created| {
            if created {
                Ok(())
            } else {
                Err(ProxyError::AlreadyExist(coll.clone()))
            }
        })?;
    Ok(Document::from_pairs([("ok".to_string(), Value::Double(1.0))]))
}

async fn drop_collection(pool: &PgPool, request: &Document, coll: String) -> Result<Document, ProxyError> {
    let db = resolve_db(request)?;
    settings::drop_collection(pool, &db, &coll).await?;
    Ok(Document::from_pairs([
        ("nIndexesWas".to_string(), Value::Int32(1)),
        ("ns".to_string(), Value::String(format!("{db}.{coll}"))),
        ("ok".to_string(), Value::Double(1.0)),
    ]))
}

/// `find`: resolves the collection, drains the internal [`Cursor`] through
/// `filter`/`limit`/`projection`, and returns every match in one wire-level
/// batch (§4.4's `getMore` resolution in SPEC_FULL §4.4; the internal
/// streaming machinery in §4.3 is still fully exercised, only the
/// wire-visible cursor is collapsed).
async fn find(
    pool: &PgPool,
    request: &Document,
    coll: String,
    cancel: CancellationToken,
) -> Result<Document, ProxyError> {
    let db = resolve_db(request)?;
    names::validate_collection_name(&coll)?;

    let predicate = opt_document(request.get_opt("filter"))?.unwrap_or_default();
    let projection = opt_document(request.get_opt("projection"))?;
    let limit = request
        .get_opt("limit")
        .map(as_i64)
        .transpose()?
        .unwrap_or(0);

    let Some(table) = settings::resolve_table(pool, &db, &coll).await? else {
        return Ok(find_reply(&db, &coll, Vec::new()));
    };

    let txn = pool.begin().await.map_err(backend::from_sqlx)?;
    let mut cursor = Cursor::spawn(txn, &db, &table, cancel.clone());

    let mut matched = Vec::new();
    while cursor.next().await {
        let batch = filter::filter(cursor.batch().to_vec(), &predicate)?;
        matched.extend(batch);
        if limit != 0 && matched.len() as i64 >= limit.abs() {
            break;
        }
    }
    if let Some(err) = cursor.take_error() {
        let _ = cursor.close().await;
        return Err(err);
    }
    let txn = cursor.close().await?;
    if cancel.is_cancelled() {
        let _ = txn.rollback().await;
        return Err(ProxyError::Cancelled);
    }
    txn.commit().await.map_err(backend::from_sqlx)?;

    filter::apply_limit(&mut matched, limit);
    let documents = matched
        .iter()
        .map(|doc| filter::project(doc, projection.as_ref()))
        .collect();
    Ok(find_reply(&db, &coll, documents))
}

fn find_reply(db: &str, coll: &str, documents: Vec<Document>) -> Document {
    let n = documents.len() as i32;
    let cursor = Document::from_pairs([
        ("id".to_string(), Value::Int64(0)),
        ("ns".to_string(), Value::String(format!("{db}.{coll}"))),
        (
            "firstBatch".to_string(),
            Value::Array(documents.into_iter().map(Value::Document).collect()),
        ),
    ]);
    Document::from_pairs([
        ("cursor".to_string(), Value::Document(cursor)),
        ("n".to_string(), Value::Int32(n)),
        ("ok".to_string(), Value::Double(1.0)),
    ])
}

fn opt_document(value: Option<&Value>) -> Result<Option<Document>, ProxyError> {
    value
        .map(|v| v.as_document().map(Document::clone).map_err(ProxyError::from))
        .transpose()
}

/// `insert`: implicitly creates the collection on first write (§3
/// "Lifecycle": "a schema is created on first write to any collection"),
/// then inserts each statement's document inside its own savepoint so one
/// failing statement does not undo statements around it (§9-ORIG
/// "Multi-statement write atomicity").
async fn insert(pool: &PgPool, request: &Document, coll: String) -> Result<Document, ProxyError> {
    let db = resolve_db(request)?;
    let documents = request
        .get_opt("documents")
        .ok_or_else(|| ProxyError::BadValue("'insert' requires 'documents'".to_string()))?
        .as_array()
        .map_err(ProxyError::from)?;
    let ordered = as_bool_or(request.get_opt("ordered"), true);

    settings::create_collection_if_not_exist(pool, &db, &coll).await?;
    let table = settings::resolve_table(pool, &db, &coll)
        .await?
        .ok_or_else(|| ProxyError::Internal(anyhow::anyhow!("collection vanished after creation")))?;

    let mut txn = pool.begin().await.map_err(backend::from_sqlx)?;
    let mut n = 0i64;
    let mut errors = Vec::new();

    for (index, value) in documents.iter().enumerate() {
        let doc = match value.as_document() {
            Ok(doc) => doc,
            Err(err) => {
                errors.push(ProxyError::from(err).to_write_error(index));
                if ordered {
                    break;
                }
                continue;
            }
        };

        let savepoint = format!("stmt_{index}");
        sqlx::query(&format!("SAVEPOINT {savepoint}"))
            .execute(&mut *txn)
            .await
            .map_err(backend::from_sqlx)?;

        match rows::insert_one(&mut txn, &db, &table, doc).await {
            Ok(()) => {
                sqlx::query(&format!("RELEASE SAVEPOINT {savepoint}"))
                    .execute(&mut *txn)
                    .await
                    .map_err(backend::from_sqlx)?;
                n += 1;
            }
            Err(err) => {
                sqlx::query(&format!("ROLLBACK TO SAVEPOINT {savepoint}"))
                    .execute(&mut *txn)
                    .await
                    .map_err(backend::from_sqlx)?;
                errors.push(err.to_write_error(index));
                if ordered {
                    break;
                }
            }
        }
    }

    txn.commit().await.map_err(backend::from_sqlx)?;
    Ok(write_reply(n, errors))
}

/// `delete`: one statement per entry of `deletes`, each with its own `q`
/// (filter) and `limit` (§4.3's sign convention, via `filter::apply_limit`),
/// run inside its own savepoint so one failing statement in an
/// `ordered: false` batch does not undo its neighbors (§9-ORIG
/// "Multi-statement write atomicity").
async fn delete(
    pool: &PgPool,
    request: &Document,
    coll: String,
    cancel: CancellationToken,
) -> Result<Document, ProxyError> {
    let db = resolve_db(request)?;
    let statements = request
        .get_opt("deletes")
        .ok_or_else(|| ProxyError::BadValue("'delete' requires 'deletes'".to_string()))?
        .as_array()
        .map_err(ProxyError::from)?;
    let ordered = as_bool_or(request.get_opt("ordered"), true);

    let table = settings::resolve_table(pool, &db, &coll).await?;
    let mut txn = pool.begin().await.map_err(backend::from_sqlx)?;
    let mut n = 0i64;
    let mut errors = Vec::new();

    for (index, value) in statements.iter().enumerate() {
        let savepoint = format!("stmt_{index}");
        sqlx::query(&format!("SAVEPOINT {savepoint}"))
            .execute(&mut *txn)
            .await
            .map_err(backend::from_sqlx)?;

        let result = run_delete_statement(&mut txn, &db, table.as_deref(), value).await;
        match result {
            Ok(deleted) => {
                sqlx::query(&format!("RELEASE SAVEPOINT {savepoint}"))
                    .execute(&mut *txn)
                    .await
                    .map_err(backend::from_sqlx)?;
                n += deleted;
            }
            Err(err) => {
                sqlx::query(&format!("ROLLBACK TO SAVEPOINT {savepoint}"))
                    .execute(&mut *txn)
                    .await
                    .map_err(backend::from_sqlx)?;
                errors.push(err.to_write_error(index));
                if ordered {
                    break;
                }
            }
        }
        if cancel.is_cancelled() {
            let _ = txn.rollback().await;
            return Err(ProxyError::Cancelled);
        }
    }

    txn.commit().await.map_err(backend::from_sqlx)?;
    Ok(write_reply(n, errors))
}

async fn run_delete_statement(
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    db: &str,
    table: Option<&str>,
    statement: &Value,
) -> Result<i64, ProxyError> {
    let statement = statement.as_document().map_err(ProxyError::from)?;
    let predicate = opt_document(statement.get_opt("q"))?.unwrap_or_default();
    let limit = statement
        .get_opt("limit")
        .map(as_i64)
        .transpose()?
        .unwrap_or(0);

    let Some(table) = table else {
        return Ok(0);
    };

    let all_rows = rows::scan(txn, db, table).await?;
    let mut matching: Vec<StoredRow> = Vec::new();
    for row in all_rows {
        if filter::matches(&predicate, &row.doc)? {
            matching.push(row);
        }
    }
    if limit != 0 {
        matching.truncate(limit.unsigned_abs() as usize);
    }

    let ctids: Vec<String> = matching.into_iter().map(|r| r.ctid).collect();
    let deleted = rows::delete_by_ctid(txn, db, table, &ctids).await?;
    Ok(deleted as i64)
}

/// `update`: one statement per entry of `updates`, each run inside its own
/// savepoint for the same reason `delete`'s statements are (§9-ORIG
/// "Multi-statement write atomicity"). An update document whose keys are
/// all operators (`$set`/`$unset`/`$inc`) is applied in place; otherwise
/// it's a full replacement document. `upsert: true` inserts a new document
/// (seeded from `q`'s equality fields) when nothing matches.
async fn update(
    pool: &PgPool,
    request: &Document,
    coll: String,
    cancel: CancellationToken,
) -> Result<Document, ProxyError> {
    let db = resolve_db(request)?;
    let statements = request
        .get_opt("updates")
        .ok_or_else(|| ProxyError::BadValue("'update' requires 'updates'".to_string()))?
        .as_array()
        .map_err(ProxyError::from)?;
    let ordered = as_bool_or(request.get_opt("ordered"), true);

    let mut txn = pool.begin().await.map_err(backend::from_sqlx)?;
    let mut n = 0i64;
    let mut errors = Vec::new();

    for (index, value) in statements.iter().enumerate() {
        let savepoint = format!("stmt_{index}");
        sqlx::query(&format!("SAVEPOINT {savepoint}"))
            .execute(&mut *txn)
            .await
            .map_err(backend::from_sqlx)?;

        let result = run_update_statement(&mut txn, pool, &db, &coll, value).await;
        match result {
            Ok(updated) => {
                sqlx::query(&format!("RELEASE SAVEPOINT {savepoint}"))
                    .execute(&mut *txn)
                    .await
                    .map_err(backend::from_sqlx)?;
                n += updated;
            }
            Err(err) => {
                sqlx::query(&format!("ROLLBACK TO SAVEPOINT {savepoint}"))
                    .execute(&mut *txn)
                    .await
                    .map_err(backend::from_sqlx)?;
                errors.push(err.to_write_error(index));
                if ordered {
                    break;
                }
            }
        }
        if cancel.is_cancelled() {
            let _ = txn.rollback().await;
            return Err(ProxyError::Cancelled);
        }
    }

    txn.commit().await.map_err(backend::from_sqlx)?;
    Ok(write_reply(n, errors))
}

async fn run_update_statement(
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    pool: &PgPool,
    db: &str,
    coll: &str,
    statement: &Value,
) -> Result<i64, ProxyError> {
    let statement = statement.as_document().map_err(ProxyError::from)?;
    let predicate = opt_document(statement.get_opt("q"))?.unwrap_or_default();
    let modifier = statement
        .get_opt("u")
        .ok_or_else(|| ProxyError::BadValue("update statement requires 'u'".to_string()))?
        .as_document()
        .map_err(ProxyError::from)?
        .clone();
    let multi = as_bool_or(statement.get_opt("multi"), false);
    let upsert = as_bool_or(statement.get_opt("upsert"), false);

    let table = settings::resolve_table(pool, db, coll).await?;

    let mut matching = Vec::new();
    if let Some(table) = &table {
        for row in rows::scan(txn, db, table).await? {
            if filter::matches(&predicate, &row.doc)? {
                matching.push(row);
            }
        }
    }

    if matching.is_empty() {
        if !upsert {
            return Ok(0);
        }
        let new_doc = apply_update(&seed_from_equality(&predicate), &modifier)?;
        let table = match table {
            Some(table) => table,
            None => {
                settings::create_collection_if_not_exist(pool, db, coll).await?;
                settings::resolve_table(pool, db, coll).await?.ok_or_else(|| {
                    ProxyError::Internal(anyhow::anyhow!("collection vanished after creation"))
                })?
            }
        };
        rows::insert_one(txn, db, &table, &new_doc).await?;
        return Ok(1);
    }

    let table = table.expect("matching rows imply the table exists");
    if !multi {
        matching.truncate(1);
    }
    let mut updated = 0i64;
    for row in matching {
        let new_doc = apply_update(&row.doc, &modifier)?;
        rows::replace_by_ctid(txn, db, &table, &row.ctid, &new_doc).await?;
        updated += 1;
    }
    Ok(updated)
}

/// Applies an update-modifier document to `existing`, or treats it as a
/// full replacement document when none of its keys are operators.
fn apply_update(existing: &Document, modifier: &Document) -> Result<Document, ProxyError> {
    if !filter::is_operator_document(modifier) {
        let mut replacement = modifier.clone();
        if let Some(id) = existing.get_opt("_id") {
            if !replacement.contains_key("_id") {
                replacement.set("_id", id.clone());
            }
        }
        return Ok(replacement);
    }

    let mut out = existing.clone();
    for (op, operand) in modifier.iter() {
        let fields = operand.as_document().map_err(ProxyError::from)?;
        match op {
            "$set" => {
                for (k, v) in fields.iter() {
                    out.set(k, v.clone());
                }
            }
            "$unset" => {
                for k in fields.keys() {
                    out.remove(k);
                }
            }
            "$inc" => {
                for (k, v) in fields.iter() {
                    let delta = v
                        .as_f64_lossy()
                        .ok_or_else(|| ProxyError::BadValue("$inc requires a numeric operand".to_string()))?;
                    let current = out.get_opt(k).and_then(Value::as_f64_lossy).unwrap_or(0.0);
                    out.set(k, Value::Double(current + delta));
                }
            }
            other => return Err(ProxyError::Unimplemented(other.to_string())),
        }
    }
    Ok(out)
}

/// Seeds an upsert's new document from `q`'s plain top-level equality
/// conditions (operator documents and `$or` are not invertible into a
/// concrete field value, so they're skipped).
fn seed_from_equality(predicate: &Document) -> Document {
    let mut doc = Document::new();
    for (key, value) in predicate.iter() {
        if key == "$or" {
            continue;
        }
        if let Value::Document(inner) = value {
            if filter::is_operator_document(inner) {
                continue;
            }
        }
        doc.set(key, value.clone());
    }
    doc
}

fn write_reply(n: i64, errors: Vec<Document>) -> Document {
    let mut reply = Document::new();
    reply.set("n", Value::Int32(n as i32));
    if errors.is_empty() {
        reply.set("ok", Value::Double(1.0));
    } else {
        reply.set(
            "writeErrors",
            Value::Array(errors.into_iter().map(Value::Document).collect()),
        );
    }
    reply
}
