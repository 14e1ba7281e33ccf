use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use room_relay::{
    cli::{Cli, Command},
    client,
    config::ServerConfig,
    server::Server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => {
            let server = Server::bind(ServerConfig::from(&args)).await?;
            info!(
                "relay listening on tcp={} udp={}",
                server.tcp_addr()?,
                server.udp_addr()?
            );
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
