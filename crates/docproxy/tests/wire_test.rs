//! Confirms `wire::length_delimited_codec` actually frames a byte stream
//! end-to-end (not just that `encode_reply`/`decode_message` are each
//! individually correct, which `src/wire.rs`'s unit tests already cover).

use docproxy::wire;
use futures::TryStreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::codec::FramedRead;

/// Writes the raw, already length-prefixed message directly to the socket
/// half, the way `main.rs`'s `serve` loop writes an encoded reply -- framing
/// on the read side is `FramedRead`'s job, framing on the write side is
/// already baked into `encode_reply`'s output.
#[tokio::test]
async fn framed_round_trip_over_a_duplex_stream() {
    let (client, server) = tokio::io::duplex(4096);
    let (_client_r, mut client_w) = tokio::io::split(client);
    let (server_r, _server_w) = tokio::io::split(server);

    let mut reader = FramedRead::new(server_r, wire::length_delimited_codec());

    let mut doc = bson::Document::new();
    doc.insert("ping", 1i32);
    let reply = wire::encode_reply(7, &doc).unwrap();

    client_w.write_all(&reply).await.unwrap();

    let frame = reader.try_next().await.unwrap().expect("one frame");
    let decoded = wire::decode_message(&frame).unwrap();

    assert_eq!(decoded.response_to, 7);
    assert_eq!(decoded.document, doc);
}
