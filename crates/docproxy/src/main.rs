use anyhow::Context;
use clap::Parser;
use docproxy::session::{App, Session};
use futures::TryStreamExt;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// A MongoDB wire-compatible proxy that stores documents as JSONB in Postgres.
#[derive(Debug, Parser)]
#[clap(author, version, about)]
struct Args {
    /// URL of the Postgres database backing every logical database/collection.
    #[clap(long = "database", env = "DATABASE_URL")]
    database_url: String,
    /// The port to listen on for MongoDB wire protocol connections.
    #[clap(long, default_value = "27017", env = "PORT")]
    port: u16,
    /// Maximum number of concurrent client connections.
    #[clap(long, default_value = "300", env = "MAX_CONNECTIONS")]
    max_connections: usize,
    /// Maximum number of pooled Postgres connections.
    #[clap(long, default_value = "10", env = "MAX_DB_CONNECTIONS")]
    max_db_connections: u32,
}

fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting tracing default failed");

    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(async_main(args));
    tracing::info!(?result, "shutting down");
    result
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("[::]:{}", args.port))
        .await
        .context("failed to bind server port")?;

    let pool = docproxy::backend::pg::connect(&args.database_url, args.max_db_connections).await?;
    let app = Arc::new(App { pool });

    let cancel_token = tokio_util::sync::CancellationToken::new();
    let ctrl_c_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for CTRL-C");
        tracing::info!("received Ctrl+C, initiating shutdown");
        ctrl_c_token.cancel();
    });

    let connection_limit = Arc::new(tokio::sync::Semaphore::new(args.max_connections));

    tracing::info!(port = args.port, "docproxy listening");

    loop {
        tokio::select! {
            accept = listener.accept() => {
                let Ok((socket, addr)) = accept else {
                    continue;
                };
                socket.set_nodelay(true)?;

                let task_cancellation = cancel_token.child_token();
                tokio::spawn(serve(
                    app.clone(),
                    socket,
                    addr,
                    task_cancellation,
                    connection_limit.clone(),
                ));
            }
            _ = cancel_token.cancelled() => break,
        }
    }

    Ok(())
}

#[tracing::instrument(level = "info", err(Debug, level = "warn"), skip(app, socket, stop, connection_limit), fields(?addr))]
async fn serve(
    app: Arc<App>,
    socket: tokio::net::TcpStream,
    addr: std::net::SocketAddr,
    stop: tokio_util::sync::CancellationToken,
    connection_limit: Arc<tokio::sync::Semaphore>,
) -> anyhow::Result<()> {
    let permit = match connection_limit.try_acquire() {
        Ok(permit) => permit,
        Err(_) => {
            metrics::counter!("docproxy_rejected_connections", "reason" => "over_limit")
                .increment(1);
            anyhow::bail!("connection limit reached, rejecting connection");
        }
    };

    tracing::info!("accepted client connection");
    metrics::gauge!("docproxy_total_connections").increment(1);

    let mut session = Session::new(app, stop.child_token());
    let (r, mut w) = tokio::io::split(socket);
    let mut r = tokio_util::codec::FramedRead::new(r, docproxy::wire::length_delimited_codec());

    let result = async {
        loop {
            tokio::select! {
                frame = r.try_next() => {
                    let Some(frame) = frame.context("failed to read next request")? else {
                        return Ok(());
                    };
                    let reply = session.handle_frame(&frame).await?;
                    w.write_all(&reply).await?;
                }
                _ = stop.cancelled() => {
                    anyhow::bail!("signalled to stop");
                }
            }
        }
    }
    .await;

    metrics::gauge!("docproxy_total_connections").decrement(1);
    let _ = w.shutdown().await;
    drop(permit);
    result
}
