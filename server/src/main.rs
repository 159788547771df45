use clap::Parser;
use log::info;
use server::Server;
use shared::{ProtocolConfig, SessionEvents};
use std::path::PathBuf;
use std::sync::Arc;

/// Command-line arguments for the session server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// IP address to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// The host's own player name
    #[arg(short, long, default_value = "host")]
    name: String,

    /// Maximum number of peers (overrides the config file)
    #[arg(short, long)]
    max_peers: Option<usize>,

    /// JSON protocol configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// Prints session events for the operator
struct ConsoleEvents;

impl SessionEvents for ConsoleEvents {
    fn on_join(&self, identity: &str) {
        println!("* {} joined", identity);
    }

    fn on_leave(&self, identity: &str) {
        println!("* {} left", identity);
    }

    fn on_chat(&self, identity: &str, message: &str) {
        println!("<{}> {}", identity, message);
    }

    fn on_session_end(&self) {
        println!("* session ended");
    }

    fn on_notice(&self, notice: &str) {
        println!("! {}", notice);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Tip: Set RUST_LOG=info to see server logs");
    }

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ProtocolConfig::load(path)?,
        None => ProtocolConfig::default(),
    };
    if let Some(port) = args.port {
        config.server_port = port;
    }
    if let Some(max_peers) = args.max_peers {
        config.max_peers = max_peers;
    }
    config.validate()?;

    println!("Starting server on {}:{}", args.host, config.server_port);
    println!("Max peers: {}", config.max_peers);

    let server = Server::bind(&args.host, config, args.name, Arc::new(ConsoleEvents)).await?;
    let receiver = server.start();

    tokio::select! {
        result = receiver => {
            if let Err(e) = result {
                eprintln!("Network task panicked: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!("Received Ctrl+C, shutting down gracefully...");
            server.shutdown().await;
        }
    }

    info!("Server stopped");
    Ok(())
}
