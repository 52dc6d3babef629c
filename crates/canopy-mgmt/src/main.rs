use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use canopy_mgmt::account::RejectAllTokens;
use canopy_mgmt::{AccountManager, Config, FileStore, PeerUpdateManager, Server};
use canopy_proto::SecretKey;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "canopy-mgmt", about = "canopy management service")]
struct Args {
    /// Path to the service config file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override the configured listen address.
    #[arg(long)]
    listen: Option<std::net::SocketAddr>,
    /// Override the configured data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

/// Load the service's static key, generating one on first start.
fn load_or_create_key(data_dir: &std::path::Path) -> anyhow::Result<SecretKey> {
    let path = data_dir.join("server.key");
    if path.exists() {
        let raw = fs::read_to_string(&path)?;
        Ok(SecretKey::parse(&raw).map_err(|e| anyhow::anyhow!("{path:?}: {e}"))?)
    } else {
        fs::create_dir_all(data_dir)?;
        let key = SecretKey::generate();
        fs::write(&path, key.to_base64())?;
        info!(path = %path.display(), "generated service key");
        Ok(key)
    }
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
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    // A corrupt store is fatal: starting empty would orphan every peer.
    let store = FileStore::open(&config.data_dir)?;
    let key = load_or_create_key(&config.data_dir)?;

    let updates = Arc::new(PeerUpdateManager::new());
    let manager = Arc::new(
        AccountManager::new(store, updates.clone(), Box::new(RejectAllTokens)).await,
    );

    if manager.is_empty().await {
        let (account_id, keys) = manager.add_account().await?;
        info!(account = %account_id, "created initial account");
        for setup_key in keys {
            info!(name = %setup_key.name, key = %setup_key.key, "setup key");
        }
    }

    let shutdown = CancellationToken::new();
    let server = Arc::new(Server::new(
        manager,
        updates,
        key,
        Arc::new(config.clone()),
        shutdown.clone(),
    ));
    info!(key = %server.public_key(), "management service key");

    let listener = TcpListener::bind(config.listen_addr).await?;
    let run = tokio::spawn(server.run(listener));

    tokio::signal::ctrl_c().await?;
    shutdown.cancel();
    let _ = run.await;
    Ok(())
}
