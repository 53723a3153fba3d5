//! LanChat CLI
//!
//! Runs the peer session layer against a static peer table.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use lanchat_core::{
    Announcement, ChatNode, Directory, EventSink, IncomingOffer, Peer, PeerCode, Presence,
    PresenceEvent, Transfer, TransferListener,
};
use tracing_subscriber::EnvFilter;

use config::Config;

/// LanChat - private chat and file transfer between LAN peers
#[derive(Parser)]
#[command(name = "lanchat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the session server and print incoming private messages
    Serve,

    /// Send a private message to a peer
    Chat {
        /// Recipient peer code
        #[arg(required = true)]
        code: PeerCode,

        /// Message text
        #[arg(required = true)]
        message: String,
    },

    /// Show configuration and known peers
    Status,
}

/// Presence stand-in: there is no broadcast transport in this binary, so
/// outgoing presence traffic is only logged.
struct LogPresence;

impl Presence for LogPresence {
    fn broadcast_expose(&self) -> lanchat_core::Result<()> {
        tracing::debug!("Expose broadcast requested");
        Ok(())
    }

    fn broadcast_get_topic(&self) -> lanchat_core::Result<()> {
        tracing::debug!("Get-topic broadcast requested");
        Ok(())
    }

    fn announce(&self, announcement: Announcement) -> lanchat_core::Result<()> {
        tracing::info!("Announcement for peer {}: {:?}", announcement.recipient(), announcement);
        Ok(())
    }
}

struct PrintSink;

impl EventSink for PrintSink {
    fn deliver(&self, peer: &Peer, event: PresenceEvent) {
        match event {
            PresenceEvent::Message { text, .. } => println!("<{}> {}", peer.nick, text),
            PresenceEvent::TopicChanged { topic, .. } => {
                println!("* {} set the topic: {}", peer.nick, topic);
            }
            PresenceEvent::Away { away, .. } => {
                println!("* {} is {}", peer.nick, if away { "away" } else { "back" });
            }
            other => tracing::debug!("Event from {}: {:?}", peer.nick, other),
        }
    }
}

struct PrintTransfers;

impl TransferListener for PrintTransfers {
    fn on_completed(&self, transfer: &Transfer) {
        println!("Transfer {} complete: {}", transfer.key(), transfer.path().display());
    }

    fn on_failed(&self, transfer: &Transfer, reason: &str) {
        println!("Transfer {} failed: {}", transfer.key(), reason);
    }

    fn on_progress(&self, transfer: &Transfer, _bytes: u64, _speed: f64, percent: u8) {
        let progress = transfer.progress();
        tracing::debug!(
            "{} {}% at {} (eta {})",
            transfer.key(),
            percent,
            progress.speed_string(),
            progress.eta_string()
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    // Initialize logging
    let level = if cli.verbose { "debug" } else { config.logging.level.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    config.validate()?;

    match cli.command {
        Commands::Serve => serve(&config).await?,
        Commands::Chat { code, message } => chat(code, &message, &config).await?,
        Commands::Status => show_status(&config)?,
    }

    Ok(())
}

fn build_node(config: &Config) -> anyhow::Result<ChatNode> {
    let directory: Arc<dyn Directory> = config.directory()?;
    let node = ChatNode::new(config.to_session_config()?, directory, Arc::new(LogPresence))?;
    node.set_event_sink(Arc::new(PrintSink));
    node.set_transfer_listener(Arc::new(PrintTransfers));
    Ok(node)
}

/// Run the session server until Ctrl+C
async fn serve(config: &Config) -> anyhow::Result<()> {
    let node = build_node(config)?;

    node.set_session_listener(Arc::new(|text: String, from: &Peer| {
        println!("[private] <{}> {}", from.nick, text);
    }));
    node.set_offer_listener(Arc::new(|offer: &IncomingOffer| {
        println!(
            "{} offers {} ({} bytes)",
            offer.from.nick, offer.local_name, offer.size
        );
    }));

    let port = match node.start().await {
        Ok(port) => port,
        Err(e) => {
            // Outbound sessions still work without a listener
            tracing::warn!("Session server unavailable: {}", e);
            0
        }
    };

    println!("LanChat {}", env!("CARGO_PKG_VERSION"));
    println!("Peer: {} ({})", config.identity.nick, config.identity.code);
    if port != 0 {
        println!("Session port: {port}");
    }
    println!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    node.stop().await;

    Ok(())
}

/// Open a session with a peer and send one private message
async fn chat(code: PeerCode, message: &str, config: &Config) -> anyhow::Result<()> {
    let node = build_node(config)?;

    node.send_private(code, message).await?;
    tracing::info!("Message delivered to peer {}", code);

    node.stop().await;
    Ok(())
}

/// Show configuration and the peer table
fn show_status(config: &Config) -> anyhow::Result<()> {
    println!("LanChat Status");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("Identity:");
    println!("  Code: {}", config.identity.code);
    println!("  Nick: {}", config.identity.nick);
    println!();

    println!("Network:");
    println!("  Bind: {}", config.network.bind_ip);
    println!(
        "  Session ports: {}..{}",
        config.network.base_port,
        config
            .network
            .base_port
            .saturating_add(config.network.port_attempts)
    );
    println!();

    println!("Transfers:");
    println!("  Download dir: {}", config.transfer.download_dir.display());
    println!("  Chunk size: {} bytes", config.transfer.chunk_size);
    println!();

    let mut peers: Vec<_> = config
        .directory()?
        .peers()
        .into_iter()
        .filter(|peer| peer.code != config.identity.code)
        .collect();
    peers.sort_by_key(|peer| peer.code);
    println!("Peers ({}):", peers.len());
    for peer in peers {
        let session = peer
            .session_addr()
            .map_or_else(|| "no session port".to_string(), |addr| addr.to_string());
        println!("  {:>6}  {:<16} {}", peer.code, peer.nick, session);
    }

    Ok(())
}
