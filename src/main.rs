use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use peermesh::config::get_config_path;
use peermesh::mesh::{connect_centrifugo, MeshEvent, MeshManager, PeerId, RtcConnector};
use peermesh::Config;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "peermesh")]
#[command(about = "Full-mesh WebRTC data channels over a Centrifugo signaling bus", long_about = None)]
struct Cli {
    /// Config file (default: ~/.peermesh/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the mesh; stdin lines are broadcast, peer messages printed
    Start {
        /// Participant id (default: random UUID)
        #[arg(long)]
        id: Option<String>,
        /// Signaling server URL
        #[arg(long)]
        server_url: Option<String>,
        /// Centrifugo websocket URL
        #[arg(long)]
        websocket_url: Option<String>,
    },
    /// Print the resolved config
    Config,
    /// Print a freshly generated participant id
    Id,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("peermesh=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            id,
            server_url,
            websocket_url,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(url) = server_url {
                config.bus.server_url = url;
            }
            if let Some(url) = websocket_url {
                config.bus.websocket_url = url;
            }

            let local_id = id.map(PeerId::from).unwrap_or_else(PeerId::generate);
            run_mesh(config, local_id).await?;
        }
        Commands::Config => {
            let config = load_config(cli.config.as_deref())?;
            let path = cli.config.unwrap_or_else(get_config_path);
            println!("# {}", path.display());
            print!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Id => {
            println!("{}", PeerId::generate());
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

async fn run_mesh(config: Config, local_id: PeerId) -> Result<()> {
    let (signals, bus) = connect_centrifugo(&config.bus_settings(), &local_id)
        .await
        .context("Failed to connect to signaling bus")?;
    let connector = Arc::new(RtcConnector::new(config.rtc_settings()));

    let (manager, handle, events) =
        MeshManager::new(local_id, signals, connector, config.mesh_options());
    let mesh_task = tokio::spawn(manager.run());
    let mut printer = tokio::spawn(print_events(events));

    println!("Participant: {}", handle.local_id());
    println!("Signaling server: {}", config.bus.server_url);
    println!("Bus: {}", config.bus.websocket_url);
    println!("Type a line to broadcast it, Ctrl-C to leave");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = stdin.next_line(), if stdin_open => {
                match line? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => {
                        let report = handle.broadcast(line).await?;
                        info!(
                            "Sent to {} peer(s), {} skipped, {} failed",
                            report.delivered_count(),
                            report.skipped.len(),
                            report.failed.len()
                        );
                    }
                    None => stdin_open = false,
                }
            }
            _ = &mut printer => {
                info!("Mesh stopped");
                break;
            }
        }
    }

    handle.shutdown().await;
    match mesh_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Mesh stopped with error: {:#}", e),
        Err(e) => error!("Mesh task panicked: {}", e),
    }
    if !printer.is_finished() {
        let _ = printer.await;
    }
    bus.shutdown().await;

    Ok(())
}

/// Print events until the mesh drops its sender
async fn print_events(mut events: mpsc::Receiver<MeshEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            MeshEvent::Message { from, payload } => {
                println!("[{}] {}", from.short(), String::from_utf8_lossy(&payload));
            }
            MeshEvent::TopologyChanged(snapshot) => {
                println!(
                    "Mesh: {} node(s), {} edge(s)",
                    snapshot.nodes.len(),
                    snapshot.edges.len()
                );
            }
        }
    }
}
