//! Cursor / Streaming Iterator (§4.3). A transaction-scoped, buffered,
//! cancellable lazy sequence of documents pulled from the backend.
//!
//! A producer `tokio::task` owns the transaction and streams rows off the
//! backend's server-side cursor (`sqlx::Transaction::fetch`) in fixed-size
//! slices, depositing each slice on a bounded channel. The consumer
//! (`Cursor::next`/`batch`) never touches the transaction directly; this
//! is what lets the producer run ahead of the consumer while the channel's
//! bounded depth caps how far. Grounded in `crates/dekaf/src/read.rs`'s
//! `PendingRead` (a spawned, `AbortOnDropHandle`-guarded task feeding a
//! consumer through channel-like polling) and in this workspace's
//! pervasive `tokio_util::sync::CancellationToken` usage for per-connection
//! cancellation (`crates/dekaf/src/main.rs`).

use crate::backend::{self, BackendError, BackendErrorCode};
use crate::codec;
use crate::error::ProxyError;
use crate::value::Document;
use futures::TryStreamExt;
use sqlx::{Postgres, Row, Transaction};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Number of documents fetched from the backend per producer round-trip.
pub const CURSOR_SLICE_CAPACITY: usize = 32;
/// Number of in-flight slices the channel holds before the producer blocks.
pub const CURSOR_BUFFER_SIZE: usize = 4;

type Slice = Result<Vec<Document>, BackendError>;

/// A lazy, finite sequence of documents bound to one backend transaction.
pub struct Cursor {
    rx: mpsc::Receiver<Slice>,
    handle: Option<JoinHandle<Transaction<'static, Postgres>>>,
    current: Vec<Document>,
    latched: Option<ProxyError>,
    cancel: CancellationToken,
    closed: bool,
}

impl Cursor {
    /// Spawns the producer task and returns the consumer handle. `txn` is
    /// moved into the producer; it is returned (still open, uncommitted) by
    /// [`Cursor::close`] so the caller can commit or roll it back.
    pub fn spawn(
        txn: Transaction<'static, Postgres>,
        schema: &str,
        table: &str,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(CURSOR_BUFFER_SIZE);
        let sql = format!(
            "SELECT _jsonb FROM {}.{}",
            backend::pg::quote_ident(schema),
            backend::pg::quote_ident(table)
        );
        let producer_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut txn = txn;
            {
                let mut rows = sqlx::query(&sql).fetch(&mut txn);
                let mut batch = Vec::with_capacity(CURSOR_SLICE_CAPACITY);

                loop {
                    let next_row = tokio::select! {
                        biased;
                        _ = producer_cancel.cancelled() => break,
                        row = rows.try_next() => row,
                    };

                    match next_row {
                        Ok(Some(row)) => {
                            let text: String = match row.try_get("_jsonb") {
                                Ok(t) => t,
                                Err(err) => {
                                    let _ = tx.send(Err(backend::from_sqlx(err))).await;
                                    break;
                                }
                            };
                            match codec::document_from_canonical_json(&text) {
                                Ok(doc) => batch.push(doc),
                                Err(err) => {
                                    let _ = tx
                                        .send(Err(BackendError::other(anyhow::anyhow!(err))))
                                        .await;
                                    break;
                                }
                            }
                            if batch.len() == CURSOR_SLICE_CAPACITY {
                                if tx.send(Ok(std::mem::take(&mut batch))).await.is_err() {
                                    break;
                                }
                                batch = Vec::with_capacity(CURSOR_SLICE_CAPACITY);
                            }
                        }
                        Ok(None) => {
                            if !batch.is_empty() {
                                let _ = tx.send(Ok(batch)).await;
                            }
                            break;
                        }
                        Err(err) => {
                            let backend_err = backend::from_sqlx(err);
                            // A table dropped between resolution and query
                            // execution surfaces as an empty read, not an
                            // error (§4.3 "Non-existing table").
                            if backend_err.code != BackendErrorCode::UndefinedTable {
                                let _ = tx.send(Err(backend_err)).await;
                            }
                            break;
                        }
                    }
                }
            }
            txn
        });

        Cursor {
            rx,
            handle: Some(handle),
            current: Vec::new(),
            latched: None,
            cancel,
            closed: false,
        }
    }

    /// Advances to the next batch. Returns `false` on exhaustion,
    /// cancellation, or a latched producer error (in which case
    /// [`Cursor::batch`] surfaces the error).
    pub async fn next(&mut self) -> bool {
        if self.closed || self.latched.is_some() {
            return false;
        }
        if self.cancel.is_cancelled() {
            self.closed = true;
            return false;
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.closed = true;
                false
            }
            msg = self.rx.recv() => match msg {
                Some(Ok(batch)) => {
                    self.current = batch;
                    true
                }
                Some(Err(err)) => {
                    self.latched = Some(ProxyError::Backend(err));
                    false
                }
                None => {
                    self.closed = true;
                    false
                }
            },
        }
    }

    /// The current batch, valid until the next call to [`Cursor::next`].
    /// Empty once a producer error has latched; call [`Cursor::take_error`]
    /// to find out why `next()` returned `false`.
    pub fn batch(&self) -> &[Document] {
        &self.current
    }

    /// Takes the latched producer error, if `next()` returned `false`
    /// because of one rather than ordinary exhaustion or cancellation.
    pub fn take_error(&mut self) -> Option<ProxyError> {
        self.latched.take()
    }

    /// Stops the producer and returns the transaction for the caller to
    /// commit or roll back. Consumes `self`, so there is no double-close to
    /// guard against.
    pub async fn close(mut self) -> Result<Transaction<'static, Postgres>, ProxyError> {
        self.rx.close();
        self.handle
            .take()
            .expect("handle is only taken by close, which consumes self")
            .await
            .map_err(|err| ProxyError::Internal(anyhow::anyhow!(err)))
    }
}
