use std::path::PathBuf;

use clap::Parser;
use env_logger::Env;
use portmapper::{create_portmap, DirectDialer, FileConfig, Mapping};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Json configuration with the mappings to start.
    /// example: --config portmap.json
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Network of a single mapping: udp, udp4, udp6, tcp, tcp4 or tcp6
    #[arg(short, long, default_value = "udp")]
    network: String,
    /// Listening address of a single mapping.
    /// example: --listen 0.0.0.0:5353
    #[arg(short, long)]
    listen: Option<String>,
    /// Destination of a single mapping.
    /// example: --dest 8.8.8.8:53
    #[arg(short, long)]
    dest: Option<String>,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let Args {
        config,
        network,
        listen,
        dest,
    } = Args::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let mut file = match config {
        Some(path) => FileConfig::load(&path)?,
        None => FileConfig::default(),
    };
    if let (Some(listen), Some(dest)) = (listen, dest) {
        file.mappings.push(Mapping::new(network, listen, dest));
    }
    if file.mappings.is_empty() {
        anyhow::bail!("nothing to map, pass --config or --listen with --dest");
    }
    let config = file.relay_config();

    let mut handles = Vec::new();
    for mapping in &file.mappings {
        let dialer = DirectDialer::default().set_nodelay(config.tcp.nodelay);
        match create_portmap(mapping, Box::new(dialer), &config).await? {
            Some(handle) => {
                log::info!("{mapping} listening on {}", handle.local_addr());
                handles.push(handle);
            }
            None => log::warn!("skip {mapping}"),
        }
    }

    tokio::signal::ctrl_c().await?;
    log::info!("quit");
    for handle in &handles {
        handle.shutdown();
    }
    Ok(())
}
