use clap::Parser;
use log::{error, info, warn};
use server::ban_registry::{BackgroundBanStore, FileBanStore};
use server::config::ServerConfig;
use server::moderation::Moderation;
use server::network::{Server, ServerMessage};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file; flags below override its values
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Server IP address to bind to
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Server port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Tick rate (updates per second)
    #[arg(short, long)]
    tick_rate: Option<u32>,

    /// Maximum concurrent clients
    #[arg(short, long)]
    max_clients: Option<usize>,

    /// Operator password, also read from ARENA_OPERATOR_PASSWORD
    #[arg(long, env = "ARENA_OPERATOR_PASSWORD", hide_env_values = true)]
    operator_password: Option<String>,

    /// Ban list file
    #[arg(short, long)]
    ban_file: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };

        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(tick_rate) = self.tick_rate {
            config.tick_rate = tick_rate;
        }
        if let Some(max_clients) = self.max_clients {
            config.max_clients = max_clients;
        }
        if let Some(password) = self.operator_password {
            config.moderation.operator_password = password;
        }
        if let Some(ban_file) = self.ban_file {
            config.moderation.ban_file = ban_file;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let config = Args::parse().into_config()?;
    info!(
        "Starting server on {} at {} Hz (max {} clients)",
        config.bind_address(),
        config.tick_rate,
        config.max_clients
    );
    info!("Ban list: {}", config.moderation.ban_file.display());

    let (store, writer) =
        BackgroundBanStore::spawn(FileBanStore::new(config.moderation.ban_file.clone()));
    let moderation = Moderation::new(&config.moderation, Box::new(store))?;

    let mut server = Server::new(&config, moderation).await.map_err(|e| e.to_string())?;
    let shutdown = server.shutdown_sender();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down gracefully...");
            let _ = shutdown.send(ServerMessage::Shutdown);
        }
    });

    if let Err(e) = server.run().await {
        error!("Server stopped with error: {}", e);
    }

    // Dropping the server closes the ban writer's channel so it can finish
    drop(server);
    if let Err(e) = writer.await {
        warn!("Ban list writer did not finish cleanly: {}", e);
    }

    Ok(())
}
