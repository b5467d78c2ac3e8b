use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    ClientId, ReplicaId,
    config::{CoordinatorConfig, TakeRetryPolicy},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve one replica of the tuple space.
    Replica(ReplicaArgs),
    /// Coordinate client requests across every replica.
    Frontend(FrontendArgs),
    /// Interactive shell talking to a frontend.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ReplicaArgs {
    /// Position of this replica in the frontend's replica list.
    #[arg(long, default_value_t = 0)]
    pub id: ReplicaId,

    /// Socket address the replica should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:2001")]
    pub listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct FrontendArgs {
    /// Socket address clients connect to.
    #[arg(long, default_value = "127.0.0.1:2000")]
    pub listen: SocketAddr,

    /// Replica addresses in replica-id order, comma separated or repeated.
    #[arg(
        long = "replica",
        value_delimiter = ',',
        default_value = "127.0.0.1:2001,127.0.0.1:2002,127.0.0.1:2003"
    )]
    pub replicas: Vec<String>,

    /// Pause between TAKE locking rounds.
    #[arg(long, default_value_t = 5000)]
    pub take_backoff_ms: u64,

    /// Upper bound of the random delay added to each pause.
    #[arg(long, default_value_t = 250)]
    pub take_jitter_ms: u64,

    /// Give up a TAKE after this many failed rounds. Unbounded when omitted.
    #[arg(long)]
    pub max_take_rounds: Option<u32>,

    /// Fail a request when replicas have not answered within this many seconds.
    #[arg(long)]
    pub wait_timeout_secs: Option<u64>,
}

impl FrontendArgs {
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            take_retry: TakeRetryPolicy {
                backoff: Duration::from_millis(self.take_backoff_ms),
                jitter: Duration::from_millis(self.take_jitter_ms),
                max_rounds: self.max_take_rounds,
            },
            wait_timeout: self.wait_timeout_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Identifier of this client. Picks the voter pair used by TAKE.
    #[arg(long)]
    pub client_id: ClientId,

    /// Address of the frontend to connect to.
    #[arg(long, default_value = "127.0.0.1:2000")]
    pub server: String,
}
