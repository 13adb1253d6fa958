//! Wire-Node CLI Application
//!
//! Runs the peer server or talks to a remote peer.

use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use wire_node::handshake::{ConnectionCache, Initiator};
use wire_node::network::{NodeConfig, PeerChannel, PeerClient, Server, ShutdownHandle};
use wire_node::protocol::{NetworkType, VersionMessage};

#[derive(Parser)]
#[command(name = "wirenode")]
#[command(version)]
#[command(about = "Event-driven peer server for a Bitcoin-style wire protocol", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Network variant (main, test, regtest)
    #[arg(short, long, global = true)]
    network: Option<NetworkType>,

    /// Log filter, overrides RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the peer server
    Serve {
        /// Port to listen on (0 = any free port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Number of dispatch loops
        #[arg(short, long)]
        loops: Option<usize>,
    },

    /// Perform a version/verack handshake with a peer
    Handshake {
        /// Peer address (host or host:port)
        addr: String,
    },

    /// Handshake with a peer, then ping it
    Ping {
        /// Peer address (host or host:port)
        addr: String,
    },

    /// Print the effective configuration as JSON
    Config,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logger
    let env = env_logger::Env::default().default_filter_or("info");
    let mut logger = env_logger::Builder::from_env(env);
    if let Some(level) = &cli.log_level {
        logger.parse_filters(level);
    }
    logger.init();

    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(network) = cli.network {
        if cli.config.is_none() {
            config.port = network.default_port();
        }
        config.network = network;
    }

    match cli.command {
        Commands::Serve { port, loops } => {
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(loops) = loops {
                config.dispatch_loops = loops;
            }
            let server = Server::bind(config)?;
            shutdown_on_ctrl_c(server.shutdown_handle())?;
            println!("🌐 Listening on {}", server.local_addr());
            server.run()?;
            println!("👋 Server stopped");
        }

        Commands::Handshake { addr } => {
            let (mut client, mut initiator) = connect(&config, &addr)?;
            initiator.complete(&mut client)?;
            println!("✅ Handshake with {} complete", client.peer_addr());
            if let Some(version) = initiator.peer_version() {
                println!("   User agent:   {}", version.user_agent);
                println!("   Version:      {}", version.version);
                println!("   Start height: {}", version.start_height);
            }
            client.close()?;
        }

        Commands::Ping { addr } => {
            if config.settle_delay().is_zero() {
                log::warn!("settle_delay_ms is 0; the ping may share a read with the verack and go unanswered");
            }
            let (mut client, mut initiator) = connect(&config, &addr)?;
            initiator.complete(&mut client)?;
            let nonce: u64 = rand::random();
            let started = std::time::Instant::now();
            client.ping(nonce)?;
            println!(
                "🏓 Pong from {} in {:.1}ms",
                client.peer_addr(),
                started.elapsed().as_secs_f64() * 1000.0
            );
            client.close()?;
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Turn Ctrl-C into a cooperative shutdown of the server
fn shutdown_on_ctrl_c(shutdown: ShutdownHandle) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    std::thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        println!("\n📴 Shutting down...");
                        shutdown.shutdown();
                    }
                    Err(e) => log::error!("Failed to listen for Ctrl-C: {}", e),
                }
            });
        })?;
    Ok(())
}

/// Open an outbound connection and prepare a handshake for it
fn connect(
    config: &NodeConfig,
    addr: &str,
) -> Result<(PeerClient, Initiator), Box<dyn std::error::Error>> {
    let target = with_default_port(addr, config.network);
    let client = PeerClient::connect(
        &target,
        config.network,
        config.connect_timeout(),
        config.read_timeout(),
    )?;
    let version = VersionMessage::new(
        Some(client.peer_addr()),
        &config.user_agent,
        config.start_height,
    );
    let initiator = Initiator::new(
        config.network,
        version,
        Arc::new(ConnectionCache::new()),
        config.handshake_ttl(),
        config.settle_delay(),
    );
    Ok((client, initiator))
}

/// Append the network's default port when `addr` has none
fn with_default_port(addr: &str, network: NetworkType) -> String {
    if addr.parse::<SocketAddr>().is_ok() {
        return addr.to_string();
    }
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return SocketAddr::new(ip, network.default_port()).to_string();
    }
    match addr.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => addr.to_string(),
        _ => format!("{}:{}", addr, network.default_port()),
    }
}
