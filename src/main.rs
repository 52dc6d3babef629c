use std::path::PathBuf;
use std::sync::Arc;

use canopy_engine::{engine, ClientConfig, MockDevice};
use canopy_proto::wire::Credential;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "canopy", about = "canopy mesh-VPN client")]
struct Args {
    /// Path to the client config file.
    #[arg(long, default_value = "/etc/canopy/config.json")]
    config: PathBuf,
    /// Management service address, used when the config does not exist yet.
    #[arg(long, default_value = "127.0.0.1:33073")]
    management: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bring the engine online and run until interrupted.
    Up {
        /// Setup key for first-time registration.
        #[arg(long)]
        setup_key: Option<String>,
    },
    /// Register this host with a setup key, then exit.
    Login {
        #[arg(long)]
        setup_key: String,
    },
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
    let config = ClientConfig::load_or_create(&args.config, &args.management)?;

    match args.command {
        Command::Up { setup_key } => {
            let credential = setup_key.map(Credential::SetupKey);
            // The data plane runs against the device seam; wiring a real
            // kernel interface in is the service wrapper's concern.
            let device = Arc::new(MockDevice::new(config.wg_port));

            let cancel = CancellationToken::new();
            let runner = {
                let cancel = cancel.clone();
                tokio::spawn(engine::run(config, credential, device, cancel))
            };

            tokio::signal::ctrl_c().await?;
            info!("interrupt received, shutting down");
            cancel.cancel();
            runner.await??;
        }
        Command::Login { setup_key } => {
            let secret = config.secret_key()?;
            let client = canopy_engine::mgmt::MgmtClient::new(config.management_addr, secret);
            let login = client
                .login_with_retry(Some(Credential::SetupKey(setup_key)), None)
                .await?;
            info!(address = %login.peer.address, "registered with management");
        }
    }
    Ok(())
}
