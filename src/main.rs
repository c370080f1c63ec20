use clap::{value_parser, Arg, Command};
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gnsd::{Config, GnsError, LocalCluster};

#[tokio::main]
async fn main() -> Result<(), GnsError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = Command::new("gnsd")
        .version("0.1.0")
        .about("Name service replica-set reconfiguration daemon")
        .arg(
            Arg::new("config")
                .long("config")
                .help("Path to a JSON configuration file")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("nodes")
                .long("nodes")
                .help("Number of name servers in the standalone cluster")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("ip")
                .long("ip")
                .help("IP address the admin API binds to"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .help("Port the admin API listens on")
                .value_parser(value_parser!(u16)),
        )
        .arg(
            Arg::new("storage-path")
                .long("storage-path")
                .help("Directory for record snapshots")
                .value_parser(value_parser!(PathBuf)),
        )
        .get_matches();

    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(nodes) = matches.get_one::<u32>("nodes") {
        config.nodes = *nodes;
    }
    if let Some(ip) = matches.get_one::<String>("ip") {
        config.node_ip = IpAddr::from_str(ip)
            .map_err(|e| GnsError::InvalidConfig(format!("Invalid IP address: {}", e)))?;
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        config.port = *port;
    }
    if let Some(path) = matches.get_one::<PathBuf>("storage-path") {
        config.storage_path = Some(path.clone());
    }
    config.validate()?;

    info!("Starting gnsd with {} nodes", config.nodes);
    info!("Configuration: {:?}", config);

    let cluster = LocalCluster::new(config.clone()).await?;
    cluster.start().await?;

    let server = api::Server::new(config.clone().into(), config.entry_node, cluster.coordinators())?;

    tokio::select! {
        result = server.start() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    cluster.shutdown().await?;
    Ok(())
}
