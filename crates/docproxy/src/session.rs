//! Per-connection state and the top-level request/reply loop. Grounded in
//! `crates/dekaf/src/session.rs`'s `Session` (per-connection state holding
//! an `Arc<App>`) and `crates/dekaf/src/lib.rs`'s `dispatch_request_frame`
//! (decode one wire frame, dispatch it, encode the reply).

use crate::dispatch;
use crate::wire;
use sqlx::PgPool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared, immutable state handed to every connection.
pub struct App {
    pub pool: PgPool,
}

/// One TCP connection's worth of state. Unlike `dekaf::Session`, which
/// accumulates Kafka group-membership and SASL state across many requests,
/// a docproxy connection is stateless between commands -- every field here
/// exists only to avoid re-deriving it (or re-cloning the pool) per request.
pub struct Session {
    app: Arc<App>,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(app: Arc<App>, cancel: CancellationToken) -> Self {
        Session { app, cancel }
    }

    /// Decodes one wire frame, dispatches the command it carries, and
    /// returns the encoded reply frame ready to write to the socket.
    pub async fn handle_frame(&mut self, frame: &[u8]) -> anyhow::Result<bytes::BytesMut> {
        let request = wire::decode_message(frame)?;
        let command = crate::codec::bson_to_document(&request.document)?;
        let reply = dispatch::dispatch(&self.app.pool, &command, self.cancel.clone()).await;
        let reply_bson = crate::codec::document_to_bson(&reply);
        wire::encode_reply(request.request_id, &reply_bson)
    }
}
