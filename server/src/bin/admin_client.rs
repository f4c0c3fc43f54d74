//! Command-line operator tool.
//!
//! Connects as a regular client, logs in as operator, sends one admin
//! request, prints the reply and disconnects.

use bincode::{deserialize, serialize};
use clap::{Parser, Subcommand};
use log::{debug, info};
use server::config::{flag_from_name, setting_from_name};
use shared::{AdminRequest, Packet};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: SocketAddr,

    /// Operator password, also read from ARENA_OPERATOR_PASSWORD
    #[arg(short = 'p', long, env = "ARENA_OPERATOR_PASSWORD", hide_env_values = true)]
    password: String,

    /// Seconds to wait for each reply
    #[arg(long, default_value = "2")]
    wait: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ban an address pattern such as 10.0.*.*
    Ban { pattern: String },
    /// Ban the address a connected player is using
    BanPlayer { id: u32 },
    Unban { pattern: String },
    /// Show one page of the ban list, counting from 1
    List {
        #[arg(default_value = "1")]
        page: usize,
    },
    /// Re-read the ban list file
    Reload,
    /// Respawn a player as a fresh cell
    Kill { id: u32 },
    /// Clear teaming suspicion for one player, or everyone when omitted
    Reset { id: Option<u32> },
    /// Change a detector setting, e.g. `set suspicion_decay 0.98`
    Set { name: String, value: f64 },
    /// Switch a detector flag, e.g. `flag stealthy_message on`
    Flag { name: String, state: String },
    Status,
}

impl Command {
    fn into_request(self) -> Result<AdminRequest, String> {
        Ok(match self {
            Command::Ban { pattern } => AdminRequest::Ban { pattern },
            Command::BanPlayer { id } => AdminRequest::BanPlayer { id },
            Command::Unban { pattern } => AdminRequest::Unban { pattern },
            Command::List { page } => AdminRequest::BanList {
                page: page.saturating_sub(1),
            },
            Command::Reload => AdminRequest::ReloadBans,
            Command::Kill { id } => AdminRequest::Kill { id },
            Command::Reset { id } => AdminRequest::ResetSuspicion { id },
            Command::Set { name, value } => AdminRequest::SetDetector {
                setting: setting_from_name(&name)
                    .ok_or_else(|| format!("unknown setting {}", name))?,
                value,
            },
            Command::Flag { name, state } => AdminRequest::SetDetectorFlag {
                flag: flag_from_name(&name).ok_or_else(|| format!("unknown flag {}", name))?,
                enabled: match state.as_str() {
                    "on" | "true" | "1" => true,
                    "off" | "false" | "0" => false,
                    other => return Err(format!("expected on or off, got {}", other)),
                },
            },
            Command::Status => AdminRequest::Status,
        })
    }
}

struct Connection {
    socket: UdpSocket,
    server: SocketAddr,
    wait: Duration,
}

impl Connection {
    async fn send(&self, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
        self.socket.send_to(&serialize(packet)?, self.server).await?;
        Ok(())
    }

    /// Waits for the next packet that is not a state broadcast.
    async fn recv(&self) -> Result<Packet, Box<dyn std::error::Error>> {
        let mut buf = [0u8; 4096];
        loop {
            let (len, _) = timeout(self.wait, self.socket.recv_from(&mut buf))
                .await
                .map_err(|_| "timed out waiting for the server")??;
            match deserialize::<Packet>(&buf[..len])? {
                Packet::GameState { .. } => continue,
                Packet::Notice { text } => println!("notice: {}", text),
                packet => return Ok(packet),
            }
        }
    }

    async fn request(&self, request: AdminRequest) -> Result<(bool, String), Box<dyn std::error::Error>> {
        debug!("Sending {:?}", request);
        self.send(&Packet::Admin { request }).await?;
        match self.recv().await? {
            Packet::AdminReply { ok, text } => Ok((ok, text)),
            other => Err(format!("unexpected reply: {:?}", other).into()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let request = args.command.into_request()?;

    let connection = Connection {
        socket: UdpSocket::bind("0.0.0.0:0").await?,
        server: args.server,
        wait: Duration::from_secs(args.wait),
    };

    connection
        .send(&Packet::Connect { client_version: 1 })
        .await?;
    match connection.recv().await? {
        Packet::Connected { client_id } => info!("Connected as client {}", client_id),
        Packet::Disconnected { reason } => return Err(format!("refused: {}", reason).into()),
        other => return Err(format!("unexpected reply: {:?}", other).into()),
    }

    let (ok, text) = connection
        .request(AdminRequest::Operator {
            password: args.password,
        })
        .await?;
    let outcome = if ok {
        connection.request(request).await
    } else {
        Err(format!("login failed: {}", text).into())
    };

    connection.send(&Packet::Disconnect).await?;

    let (ok, text) = outcome?;
    println!("{}", text);
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
