use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use meetsync::{
    actor::StoreHandle,
    config::{NodeConfig, RouterConfig},
    directory::Directory,
    net::{NodeServer, RouterServer, TcpTransport},
    proto::NodeId,
    router::Router,
    store::ReplicaStore,
};
use tracing::debug;

#[derive(Parser, Debug)]
#[command(about = "Replicated meeting records over a central router")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a participant node server.
    Node {
        /// Path to the node config file.
        #[clap(short, long)]
        config: PathBuf,
    },
    /// Run the central router.
    Router {
        /// Path to the router config file.
        #[clap(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Node { config } => {
            let config = NodeConfig::load(&config).await?;
            debug!(?config, "starting node");
            tokio::fs::create_dir_all(&config.data_dir).await?;
            let store = ReplicaStore::open(NodeId::new(config.name.clone()), config.store_path())?;
            let handle = StoreHandle::spawn(store);
            let server = NodeServer::bind(handle, config.port).await?;
            server.run_until_ctrl_c().await
        }
        Command::Router { config } => {
            let config = RouterConfig::load(&config).await?;
            debug!(?config, "starting router");
            let directory = Directory::load(&config.directory)?;
            let router = Router::new(directory, TcpTransport);
            let server = RouterServer::bind(router, config.port).await?;
            server.run_until_ctrl_c().await
        }
    }
}
