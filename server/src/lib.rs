//! # Arena Server Library
//!
//! Authoritative server for a mass-absorption arena game, together with the
//! moderation layer that keeps the arena fair: address bans, operator
//! privilege, and detection of players secretly cooperating ("teaming").
//!
//! ## Architecture Design
//!
//! ### Single-Task Event Loop
//! Packet handling, simulation ticks and moderation all run on one task.
//! Network receive, send and timeout checks run on helper tasks that talk to
//! the main loop over channels, so moderation state never needs a lock.
//!
//! ### Tick Pipeline
//! Each tick the server applies queued inputs, advances physics (with the
//! teaming penalty applied to mass gains), hands the tick's telemetry to the
//! detector, enforces whatever the detector escalated, and broadcasts the new
//! state.
//!
//! ## Module Organization
//!
//! ### Moderation
//! - `ban_registry`: IPv4 wildcard patterns, the persisted ban list
//! - `admin`: per-client operator sessions and warning counters
//! - `detector`: pairwise suspicion scoring with decay and thresholds
//! - `moderation`: facade tying the three together, admin request execution,
//!   temporary bans
//!
//! ### Game Server
//! - `client_manager`: connection roster, input queues, timeouts
//! - `game`: arena simulation and per-tick telemetry
//! - `network`: UDP transport and the main loop
//!
//! ### Support
//! - `config`: JSON configuration with defaults for every field
//! - `error`: the moderation error type
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::ban_registry::{BackgroundBanStore, FileBanStore};
//! use server::config::ServerConfig;
//! use server::moderation::Moderation;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let mut config = ServerConfig::default();
//!     config.moderation.operator_password = "change me".to_string();
//!
//!     let (store, _writer) =
//!         BackgroundBanStore::spawn(FileBanStore::new(config.moderation.ban_file.clone()));
//!     let moderation = Moderation::new(&config.moderation, Box::new(store))?;
//!
//!     let mut server = Server::new(&config, moderation).await?;
//!     server.run().await
//! }
//! ```

pub mod admin;
pub mod ban_registry;
pub mod client_manager;
pub mod config;
pub mod detector;
pub mod error;
pub mod game;
pub mod moderation;
pub mod network;
