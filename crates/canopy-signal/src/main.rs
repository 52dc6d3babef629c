use std::sync::Arc;

use canopy_proto::SecretKey;
use canopy_signal::SignalServer;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "canopy-signal", about = "canopy signal relay")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:10000")]
    listen: std::net::SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    // The relay key is ephemeral: nothing is persisted, so a restart
    // simply hands clients a new key on their next handshake.
    let shutdown = CancellationToken::new();
    let server = Arc::new(SignalServer::new(SecretKey::generate(), shutdown.clone()));
    info!(key = %server.public_key(), "signal service key");

    let listener = TcpListener::bind(args.listen).await?;
    let run = tokio::spawn(server.run(listener));

    tokio::signal::ctrl_c().await?;
    shutdown.cancel();
    let _ = run.await;
    Ok(())
}
