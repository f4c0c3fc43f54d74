//! Integration tests for the arena server and its moderation layer
//!
//! These tests validate cross-component interactions and real network behavior.

use bincode::{deserialize, serialize};
use server::ban_registry::{BackgroundBanStore, FileBanStore, MemoryBanStore};
use server::config::{AntiTeamingConfig, ModerationConfig, ServerConfig};
use server::game::GameState;
use server::moderation::{Enforcement, Moderation};
use server::network::{Server, ServerMessage, BANNED_REASON};
use shared::{AdminRequest, InputState, Packet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

const PASSWORD: &str = "integration";

fn moderation_config() -> ModerationConfig {
    ModerationConfig {
        operator_password: PASSWORD.to_string(),
        ..ModerationConfig::default()
    }
}

async fn send(socket: &UdpSocket, server: SocketAddr, packet: &Packet) {
    socket
        .send_to(&serialize(packet).unwrap(), server)
        .await
        .unwrap();
}

/// Receives until a packet matches, skipping everything else.
async fn recv_matching(socket: &UdpSocket, want: impl Fn(&Packet) -> bool) -> Packet {
    let mut buf = [0u8; 4096];
    loop {
        let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for server")
            .unwrap();
        let packet: Packet = deserialize(&buf[..len]).unwrap();
        if want(&packet) {
            return packet;
        }
    }
}

async fn admin(socket: &UdpSocket, server: SocketAddr, request: AdminRequest) -> (bool, String) {
    send(socket, server, &Packet::Admin { request }).await;
    match recv_matching(socket, |p| matches!(p, Packet::AdminReply { .. })).await {
        Packet::AdminReply { ok, text } => (ok, text),
        _ => unreachable!(),
    }
}

/// NETWORK PROTOCOL TESTS
mod protocol_tests {
    use super::*;

    /// Admin requests survive the wire format intact
    #[test]
    fn admin_packet_serialization() {
        let packet = Packet::Admin {
            request: AdminRequest::SetDetector {
                setting: shared::DetectorSetting::SuspicionDecay,
                value: 0.95,
            },
        };
        let decoded: Packet = deserialize(&serialize(&packet).unwrap()).unwrap();
        assert_eq!(decoded, packet);
    }

    /// Garbage on the socket must not be mistaken for a packet
    #[test]
    fn malformed_packet_handling() {
        for bytes in [&[][..], &[255, 255, 255, 255][..], &[1, 2, 3][..]] {
            assert!(deserialize::<Packet>(bytes).is_err());
        }
    }
}

/// END-TO-END SERVER TESTS
mod server_tests {
    use super::*;

    async fn start_server(
        moderation: Moderation,
    ) -> (SocketAddr, tokio::sync::mpsc::UnboundedSender<ServerMessage>) {
        let config = ServerConfig {
            port: 0,
            tick_rate: 60,
            moderation: moderation_config(),
            ..ServerConfig::default()
        };
        let mut server = Server::new(&config, moderation).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_sender();
        tokio::spawn(async move { server.run().await });
        (addr, shutdown)
    }

    /// An operator bans their own address: the live session continues, the
    /// ban is written to disk, and the next connection is refused
    #[tokio::test]
    async fn ban_applies_to_new_connections_only() {
        let dir = tempfile::tempdir().unwrap();
        let ban_file = dir.path().join("bans.txt");

        let (store, _writer) = BackgroundBanStore::spawn(FileBanStore::new(ban_file.clone()));
        let moderation = Moderation::new(&moderation_config(), Box::new(store)).unwrap();
        let (server, shutdown) = start_server(moderation).await;

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        send(&socket, server, &Packet::Connect { client_version: 1 }).await;
        let client_id = match recv_matching(&socket, |p| matches!(p, Packet::Connected { .. })).await
        {
            Packet::Connected { client_id } => client_id,
            _ => unreachable!(),
        };

        let (ok, _) = admin(&socket, server, AdminRequest::Ban {
            pattern: "127.0.0.1".to_string(),
        })
        .await;
        assert!(!ok, "non-operators must not ban");

        let (ok, text) = admin(&socket, server, AdminRequest::Operator {
            password: PASSWORD.to_string(),
        })
        .await;
        assert!(ok, "{}", text);

        let (ok, text) = admin(&socket, server, AdminRequest::Ban {
            pattern: "127.0.0.1".to_string(),
        })
        .await;
        assert!(ok);
        assert_eq!(text, "Banned 127.0.0.1");

        // Still in the game after the ban
        let state = recv_matching(&socket, |p| matches!(p, Packet::GameState { .. })).await;
        match state {
            Packet::GameState { players, .. } => {
                assert!(players.iter().any(|p| p.id == client_id));
            }
            _ => unreachable!(),
        }

        // Written by the background writer
        let mut saved = String::new();
        for _ in 0..50 {
            saved = std::fs::read_to_string(&ban_file).unwrap_or_default();
            if !saved.is_empty() {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(saved, "127.0.0.1\n");

        send(&socket, server, &Packet::Disconnect).await;
        send(&socket, server, &Packet::Connect { client_version: 1 }).await;
        let reply = recv_matching(&socket, |p| {
            matches!(p, Packet::Connected { .. } | Packet::Disconnected { .. })
        })
        .await;
        assert_eq!(
            reply,
            Packet::Disconnected {
                reason: BANNED_REASON.to_string()
            }
        );

        shutdown.send(ServerMessage::Shutdown).unwrap();
    }

    /// Operator commands reach the game: kill respawns the target
    #[tokio::test]
    async fn operator_kill_and_status() {
        let moderation =
            Moderation::new(&moderation_config(), Box::new(MemoryBanStore::default())).unwrap();
        let (server, shutdown) = start_server(moderation).await;

        let operator = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let victim = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        send(&operator, server, &Packet::Connect { client_version: 1 }).await;
        recv_matching(&operator, |p| matches!(p, Packet::Connected { .. })).await;
        send(&victim, server, &Packet::Connect { client_version: 1 }).await;
        let victim_id = match recv_matching(&victim, |p| matches!(p, Packet::Connected { .. })).await
        {
            Packet::Connected { client_id } => client_id,
            _ => unreachable!(),
        };

        admin(&operator, server, AdminRequest::Operator {
            password: PASSWORD.to_string(),
        })
        .await;

        let (ok, text) = admin(&operator, server, AdminRequest::Status).await;
        assert!(ok);
        assert!(text.starts_with("2 players, 1 operators, 0 bans"), "{}", text);

        let (ok, text) = admin(&operator, server, AdminRequest::Kill { id: victim_id }).await;
        assert!(ok, "{}", text);
        let notice = recv_matching(&victim, |p| matches!(p, Packet::Notice { .. })).await;
        assert_eq!(
            notice,
            Packet::Notice {
                text: "You were killed by an operator".to_string()
            }
        );

        let (ok, _) = admin(&operator, server, AdminRequest::Kill { id: 999 }).await;
        assert!(!ok);

        shutdown.send(ServerMessage::Shutdown).unwrap();
    }
}

/// GAME AND DETECTOR INTEGRATION TESTS
mod teaming_tests {
    use super::*;

    fn eject() -> InputState {
        InputState {
            sequence: 1,
            timestamp: 0,
            move_x: 0.0,
            move_y: 0.0,
            eject: true,
        }
    }

    /// Places a big feeder next to a small receiver
    fn arena(moderation: &mut Moderation) -> GameState {
        let mut game = GameState::new();
        for id in [1, 2] {
            game.add_player(id);
            moderation.on_connect(id, format!("10.1.1.{}", id).parse().unwrap());
        }
        reset_cells(&mut game);
        game
    }

    fn reset_cells(game: &mut GameState) {
        let feeder = game.players.get_mut(&1).unwrap();
        feeder.x = 500.0;
        feeder.y = 500.0;
        feeder.mass = 200.0;
        let receiver = game.players.get_mut(&2).unwrap();
        receiver.x = 700.0;
        receiver.y = 500.0;
        receiver.mass = 20.0;
    }

    fn feed_tick(game: &mut GameState, moderation: &mut Moderation, now: Instant) -> Vec<Enforcement> {
        game.tick += 1;
        game.apply_input(1, &eject());
        game.update_physics(1.0 / 30.0, moderation.detector());
        let telemetry = game.take_telemetry();
        reset_cells(game);
        moderation.on_tick(&telemetry, now)
    }

    /// Repeated feeding is scored, warned, then penalised
    #[test]
    fn feeding_escalates_through_the_pipeline() {
        let config = ModerationConfig {
            anti_teaming: AntiTeamingConfig {
                mass_transfer_suspicion: 20.0,
                ..AntiTeamingConfig::default()
            },
            ..moderation_config()
        };
        let mut moderation =
            Moderation::new(&config, Box::new(MemoryBanStore::default())).unwrap();
        let mut game = arena(&mut moderation);
        let now = Instant::now();

        // Four ejects are 48 mass, not yet over the window threshold
        for _ in 0..4 {
            assert!(feed_tick(&mut game, &mut moderation, now).is_empty());
        }
        assert_eq!(moderation.detector().score(1, 2), 0.0);

        let effects = feed_tick(&mut game, &mut moderation, now);
        assert_eq!(moderation.detector().score(1, 2), 20.0);
        let notified: Vec<u32> = effects
            .iter()
            .filter_map(|e| match e {
                Enforcement::Notify { id, .. } => Some(*id),
                _ => None,
            })
            .collect();
        assert_eq!(notified, vec![1, 2]);

        // Five more cross the punishment threshold and halve further gains
        for _ in 0..5 {
            feed_tick(&mut game, &mut moderation, now);
        }
        assert!(moderation.detector().score(1, 2) >= 30.0);

        game.tick += 1;
        game.apply_input(1, &eject());
        game.update_physics(1.0 / 30.0, moderation.detector());
        assert_eq!(game.players[&2].mass, 26.0);
    }

    /// Operators can feed whoever they like
    #[test]
    fn operators_are_never_scored() {
        let mut moderation =
            Moderation::new(&moderation_config(), Box::new(MemoryBanStore::default())).unwrap();
        let mut game = arena(&mut moderation);
        let now = Instant::now();
        moderation
            .execute(1, AdminRequest::Operator { password: PASSWORD.to_string() }, now)
            .unwrap();

        for _ in 0..20 {
            assert!(feed_tick(&mut game, &mut moderation, now).is_empty());
        }
        assert_eq!(moderation.detector().record_count(), 0);
    }
}
