use clap::Parser;
use client::Client;
use log::info;
use rand::Rng;
use shared::{ProtocolConfig, SessionEvents};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to (host or host:port)
    #[arg(short = 's', long, default_value = "127.0.0.1")]
    server: String,

    /// Player name (a random one is picked if omitted)
    #[arg(short, long)]
    name: Option<String>,

    /// JSON protocol configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// Prints session events to the terminal
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

async fn resolve(server: &str, default_port: u16) -> Result<SocketAddr, Box<dyn std::error::Error>> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let target = if server.contains(':') {
        server.to_string()
    } else {
        format!("{}:{}", server, default_port)
    };
    let mut addrs = tokio::net::lookup_host(&target).await?;
    addrs
        .next()
        .ok_or_else(|| format!("could not resolve {}", target).into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ProtocolConfig::load(path)?,
        None => ProtocolConfig::default(),
    };
    let name = args
        .name
        .unwrap_or_else(|| format!("player{}", rand::thread_rng().gen_range(1000..10000)));
    let server_addr = resolve(&args.server, config.server_port).await?;

    info!("Starting client...");
    info!("Connecting to: {}", server_addr);

    let client = Client::bind(server_addr, name, config, Arc::new(ConsoleEvents)).await?;
    client.connect().await?;
    if let Err(e) = client.wait_for_login().await {
        eprintln!("Could not join {}: {}", server_addr, e);
        return Ok(());
    }

    println!(
        "Joined as {}. Type to chat, /who lists players, /quit leaves.",
        client.identity()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/who" => println!("Players: {}", client.list_peers().join(", ")),
                    message => {
                        if let Err(e) = client.send_chat(message).await {
                            eprintln!("Message not sent: {}", e);
                        }
                    }
                },
                None => break,
            },
            _ = client.closed() => return Ok(()),
            _ = tokio::signal::ctrl_c() => {
                println!("Received Ctrl+C, leaving...");
                break;
            }
        }
    }

    client.disconnect().await?;
    Ok(())
}
