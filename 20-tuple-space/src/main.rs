use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use tuple_space::{
    cli::{Cli, Command},
    client,
    coordinator::Coordinator,
    frontend::FrontendServer,
    replica::{ReplicaServer, ReplicaService},
    topology::ReplicaTopology,
};

fn init_tracing(debug: bool) {
    use tracing_subscriber::{EnvFilter, fmt};

    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match cli.command {
        Command::Replica(args) => {
            let listener = TcpListener::bind(args.listen).await?;
            let server = ReplicaServer::new(listener, Arc::new(ReplicaService::new(args.id)));
            info!(replica = args.id, "replica listening on {}", server.local_addr()?);
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("replica exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Frontend(args) => {
            let topology = ReplicaTopology::new(args.replicas.clone())?;
            let coordinator = Coordinator::connect(&topology, args.coordinator_config())?;
            let listener = TcpListener::bind(args.listen).await?;
            let server = FrontendServer::new(listener, Arc::new(coordinator));
            info!(
                replicas = topology.len(),
                "frontend listening on {}",
                server.local_addr()?
            );
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("frontend exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
