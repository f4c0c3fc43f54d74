//! Server network layer handling UDP communications and game loop coordination
//!
//! Packets are received on a dedicated task and forwarded to the main loop
//! over a channel; outgoing packets travel the other way to a sender task.
//! The main loop owns the game state and the moderation layer, so admission
//! checks, admin requests and detector ticks all run on one task in arrival
//! order.

use crate::client_manager::ClientManager;
use crate::config::ServerConfig;
use crate::game::GameState;
use crate::moderation::{Enforcement, Moderation};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{radius_for_mass, AdminRequest, InputState, Packet, Player, PLAYER_SPEED, START_MASS};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;

pub type ServerError = Box<dyn std::error::Error + Send + Sync>;

/// Reason sent to a peer whose address matches the ban list.
pub const BANNED_REASON: &str = "Banned";

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
    ClientTimeout { client_id: u32 },
    Shutdown,
}

/// Messages sent from game loop to network tasks
#[derive(Debug)]
pub enum GameMessage {
    SendPacket { packet: Packet, addr: SocketAddr },
    BroadcastPacket { packet: Packet, exclude: Option<u32> },
}

/// Main server coordinating networking, simulation and moderation
pub struct Server {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    game_state: GameState,
    moderation: Moderation,
    tick_duration: Duration,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    game_tx: mpsc::UnboundedSender<GameMessage>,
    game_rx: mpsc::UnboundedReceiver<GameMessage>,
}

impl Server {
    pub async fn new(config: &ServerConfig, moderation: Moderation) -> Result<Self, ServerError> {
        let socket = Arc::new(UdpSocket::bind(config.bind_address()).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (game_tx, game_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            clients: Arc::new(RwLock::new(ClientManager::new(
                config.max_clients,
                config.client_timeout(),
            ))),
            game_state: GameState::new(),
            moderation,
            tick_duration: config.tick_duration(),
            server_tx,
            server_rx,
            game_tx,
            game_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Handle for stopping [`Server::run`] from another task.
    pub fn shutdown_sender(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => match deserialize::<Packet>(&buffer[0..len]) {
                        Ok(packet) => {
                            if server_tx
                                .send(ServerMessage::PacketReceived { packet, addr })
                                .is_err()
                            {
                                debug!("Main loop gone, stopping receiver");
                                break;
                            }
                        }
                        Err(_) => warn!("Failed to deserialize packet from {}", addr),
                    },
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let clients = Arc::clone(&self.clients);
        let mut game_rx = std::mem::replace(&mut self.game_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = game_rx.recv().await {
                match message {
                    GameMessage::SendPacket { packet, addr } => {
                        if let Err(e) = send_packet_to(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    GameMessage::BroadcastPacket { packet, exclude } => {
                        let client_addrs = clients.read().await.client_addrs();

                        for (client_id, addr) in client_addrs {
                            if Some(client_id) == exclude {
                                continue;
                            }
                            if let Err(e) = send_packet_to(&socket, &packet, addr).await {
                                error!("Failed to send to client {}: {}", client_id, e);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Spawns task that drops silent clients once a second
    fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = clients.write().await.check_timeouts(Instant::now());
                for client in timed_out {
                    if server_tx
                        .send(ServerMessage::ClientTimeout { client_id: client.id })
                        .is_err()
                    {
                        return;
                    }
                }
            }
        });
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.game_tx.send(GameMessage::SendPacket { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    fn broadcast_packet(&self, packet: Packet, exclude: Option<u32>) {
        if let Err(e) = self
            .game_tx
            .send(GameMessage::BroadcastPacket { packet, exclude })
        {
            error!("Failed to queue broadcast packet: {}", e);
        }
    }

    async fn send_to_client(&self, client_id: u32, packet: Packet) {
        let addr = self.clients.read().await.addr_of(client_id);
        match addr {
            Some(addr) => self.send_packet(packet, addr),
            None => debug!("Dropping packet for departed client {}", client_id),
        }
    }

    async fn client_for(&self, addr: SocketAddr) -> Option<u32> {
        self.clients.read().await.find_client_by_addr(addr)
    }

    async fn drop_client(&mut self, client_id: u32) {
        self.clients.write().await.remove_client(client_id);
        self.forget_player(client_id);
    }

    fn forget_player(&mut self, client_id: u32) {
        self.game_state.remove_player(&client_id);
        self.moderation.on_disconnect(client_id);
    }

    /// Processes incoming packets and updates game state
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Connect { client_version } => {
                info!("Client connecting from {} (version: {})", addr, client_version);

                // A reconnect from the same address replaces the old session
                if let Some(existing_id) = self.client_for(addr).await {
                    info!("Removing existing client {} from {}", existing_id, addr);
                    self.drop_client(existing_id).await;
                }

                if self.moderation.is_banned(addr.ip(), Instant::now()) {
                    info!("Rejected banned peer {}", addr);
                    self.send_packet(
                        Packet::Disconnected {
                            reason: BANNED_REASON.to_string(),
                        },
                        addr,
                    );
                    return;
                }

                let client_id = self.clients.write().await.add_client(addr);
                match client_id {
                    Some(client_id) => {
                        self.game_state.add_player(client_id);
                        self.moderation.on_connect(client_id, addr.ip());
                        self.send_packet(Packet::Connected { client_id }, addr);
                    }
                    None => self.send_packet(
                        Packet::Disconnected {
                            reason: "Server full".to_string(),
                        },
                        addr,
                    ),
                }
            }

            Packet::Input {
                sequence,
                timestamp,
                move_x,
                move_y,
                eject,
            } => {
                let mut clients = self.clients.write().await;
                if let Some(client_id) = clients.find_client_by_addr(addr) {
                    clients.add_input(
                        client_id,
                        InputState {
                            sequence,
                            timestamp,
                            move_x,
                            move_y,
                            eject,
                        },
                    );
                }
            }

            Packet::Admin { request } => match self.client_for(addr).await {
                Some(client_id) => {
                    self.clients.write().await.touch(client_id);
                    self.handle_admin(client_id, request, addr).await;
                }
                None => warn!("Admin request from unconnected peer {}", addr),
            },

            Packet::Disconnect => {
                if let Some(client_id) = self.client_for(addr).await {
                    self.drop_client(client_id).await;
                }
            }

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    async fn handle_admin(&mut self, client_id: u32, request: AdminRequest, addr: SocketAddr) {
        debug!("Admin request from client {}: {:?}", client_id, request);

        let reply = match self.moderation.execute(client_id, request, Instant::now()) {
            Ok(reply) => {
                for effect in reply.effects {
                    self.enforce(effect).await;
                }
                Packet::AdminReply {
                    ok: true,
                    text: reply.text,
                }
            }
            Err(e) => {
                info!("Admin request from client {} refused: {}", client_id, e);
                Packet::AdminReply {
                    ok: false,
                    text: e.to_string(),
                }
            }
        };
        self.send_packet(reply, addr);
    }

    /// Carries out one moderation effect against the live game.
    async fn enforce(&mut self, effect: Enforcement) {
        match effect {
            Enforcement::Notify { id, text } => {
                self.send_to_client(id, Packet::Notice { text }).await;
            }
            Enforcement::MassLoss { id, percent } => {
                self.game_state.apply_mass_loss(id, percent);
            }
            Enforcement::Kill { id } => {
                if self.game_state.kill(id) {
                    self.send_to_client(
                        id,
                        Packet::Notice {
                            text: "You were killed by an operator".to_string(),
                        },
                    )
                    .await;
                }
            }
        }
    }

    /// Applies queued inputs and advances the simulation by `dt`.
    async fn process_inputs(&mut self, dt: f32) {
        let total_substeps = required_substeps(dt);
        let substep_dt = dt / total_substeps as f32;

        let inputs = self.clients.write().await.drain_inputs();
        for (client_id, input) in &inputs {
            self.game_state.apply_input(*client_id, input);
        }

        for _ in 0..total_substeps {
            self.game_state
                .update_physics(substep_dt, self.moderation.detector());
        }
    }

    /// Feeds the finished tick to the detector and enforces the outcome.
    async fn run_moderation(&mut self) {
        let telemetry = self.game_state.take_telemetry();
        let effects = self.moderation.on_tick(&telemetry, Instant::now());
        for effect in effects {
            self.enforce(effect).await;
        }
    }

    /// Broadcasts current game state to all connected clients
    async fn broadcast_game_state(&mut self) {
        let last_processed_input = {
            let clients = self.clients.read().await;
            if clients.is_empty() {
                return;
            }
            clients.last_processed_inputs()
        };

        let mut players: Vec<Player> = self.game_state.players.values().cloned().collect();
        players.sort_by_key(|p| p.id);

        let packet = Packet::GameState {
            tick: self.game_state.tick,
            timestamp: unix_millis(),
            last_processed_input,
            players,
        };

        self.broadcast_packet(packet, None);
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), ServerError> {
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_timeout_checker();

        let mut tick_interval = interval(self.tick_duration);
        let mut last_tick = Instant::now();

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        },
                        Some(ServerMessage::ClientTimeout { client_id }) => {
                            self.forget_player(client_id);
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                _ = tick_interval.tick() => {
                    let now = Instant::now();
                    let dt = now.duration_since(last_tick).as_secs_f32();
                    last_tick = now;

                    self.game_state.tick += 1;
                    self.process_inputs(dt).await;
                    self.run_moderation().await;
                    self.broadcast_game_state().await;

                    if self.game_state.tick % 300 == 0 {
                        debug!(
                            "Tick {}: {} players, {} suspicion records",
                            self.game_state.tick,
                            self.game_state.players.len(),
                            self.moderation.detector().record_count()
                        );
                    }
                },
            }
        }

        Ok(())
    }
}

async fn send_packet_to(
    socket: &UdpSocket,
    packet: &Packet,
    addr: SocketAddr,
) -> Result<(), ServerError> {
    let data = serialize(packet)?;
    socket.send_to(&data, addr).await?;
    Ok(())
}

/// Physics substeps needed so the fastest cell never moves further than
/// half the smallest radius in one step.
fn required_substeps(dt: f32) -> u32 {
    let max_movement_per_step = radius_for_mass(START_MASS) * 0.5;
    let max_movement_this_tick = PLAYER_SPEED * dt;

    if max_movement_this_tick > max_movement_per_step {
        (max_movement_this_tick / max_movement_per_step).ceil() as u32
    } else {
        1
    }
}

fn unix_millis() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    millis.min(u64::MAX as u128) as u64
}
