//! Authoritative arena simulation
//!
//! Cells move toward their input direction, can eject mass into a nearby cell,
//! and swallow sufficiently smaller cells. Every mass movement between two
//! players and every close-range mutual retreat is recorded so the teaming
//! detector can inspect the tick afterwards.

use crate::detector::{AvoidanceSignal, MassTransfer, PlayerSnapshot, TickTelemetry};
use log::{debug, info};
use rand::Rng;
use shared::{
    can_absorb, distance, max_speed_for_mass, InputState, Player, EAT_RATIO, EJECT_MASS,
    EJECT_RANGE, MIN_EJECT_MASS, START_MASS, WORLD_HEIGHT, WORLD_WIDTH,
};
use std::collections::HashMap;

/// Pairs closer than this many combined radii can register avoidance.
const AVOIDANCE_RANGE: f32 = 2.0;
/// Cells slower than this are not steering anywhere.
const MIN_STEER_SPEED: f32 = 1.0;
const SPAWN_MARGIN: f32 = 100.0;

/// Decides how much of a mass gain the receiving player keeps.
pub trait MassGainPolicy {
    /// Multiplier for mass moving from `source` to `target`.
    fn gain_multiplier(&self, source: u32, target: u32) -> f32;
}

/// Every gain is kept in full.
pub struct NoPenalty;

impl MassGainPolicy for NoPenalty {
    fn gain_multiplier(&self, _source: u32, _target: u32) -> f32 {
        1.0
    }
}

#[derive(Debug, Clone)]
pub struct GameState {
    pub tick: u32,
    pub players: HashMap<u32, Player>,
    pending_ejects: Vec<u32>,
    transfers: Vec<MassTransfer>,
}

impl Default for GameState {
    fn default() -> Self {
        Self::new()
    }
}

impl GameState {
    pub fn new() -> Self {
        Self {
            tick: 0,
            players: HashMap::new(),
            pending_ejects: Vec::new(),
            transfers: Vec::new(),
        }
    }

    pub fn add_player(&mut self, client_id: u32) {
        let (x, y) = random_spawn();
        let player = Player::new(client_id, x, y);

        info!("Added player {} at ({:.0}, {:.0})", client_id, player.x, player.y);
        self.players.insert(client_id, player);
    }

    pub fn remove_player(&mut self, client_id: &u32) {
        self.players.remove(client_id);
        self.pending_ejects.retain(|id| id != client_id);
        info!("Removed player {}", client_id);
    }

    pub fn apply_input(&mut self, client_id: u32, input: &InputState) {
        if let Some(player) = self.players.get_mut(&client_id) {
            let magnitude = (input.move_x * input.move_x + input.move_y * input.move_y).sqrt();
            let max_speed = max_speed_for_mass(player.mass);
            if magnitude > 0.0 {
                // Partial stick deflection gives partial speed
                let scale = max_speed * magnitude.min(1.0) / magnitude;
                player.vel_x = input.move_x * scale;
                player.vel_y = input.move_y * scale;
            } else {
                player.vel_x = 0.0;
                player.vel_y = 0.0;
            }

            if input.eject {
                self.pending_ejects.push(client_id);
            }
        }
    }

    pub fn update_physics(&mut self, dt: f32, policy: &dyn MassGainPolicy) {
        for player in self.players.values_mut() {
            player.x = (player.x + player.vel_x * dt).clamp(0.0, WORLD_WIDTH);
            player.y = (player.y + player.vel_y * dt).clamp(0.0, WORLD_HEIGHT);
        }

        self.process_ejects(policy);
        self.handle_eating(policy);
    }

    fn process_ejects(&mut self, policy: &dyn MassGainPolicy) {
        let ejects = std::mem::take(&mut self.pending_ejects);

        for source_id in ejects {
            let Some(source) = self.players.get(&source_id).cloned() else {
                continue;
            };
            if source.mass < MIN_EJECT_MASS {
                continue;
            }

            // Nearest cell whose edge is within reach
            let target_id = self
                .players
                .values()
                .filter(|p| p.id != source_id)
                .map(|p| (p.id, distance(&source, p) - source.radius() - p.radius()))
                .filter(|(_, gap)| *gap <= EJECT_RANGE)
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(id, _)| id);

            let Some(target_id) = target_id else {
                continue;
            };

            let multiplier = policy.gain_multiplier(source_id, target_id);
            if let Some(source) = self.players.get_mut(&source_id) {
                source.mass -= EJECT_MASS;
            }
            if let Some(target) = self.players.get_mut(&target_id) {
                target.mass += EJECT_MASS * multiplier;
            }
            self.record_transfer(source_id, target_id, EJECT_MASS);
        }
    }

    fn handle_eating(&mut self, policy: &dyn MassGainPolicy) {
        let mut ids: Vec<u32> = self.players.keys().copied().collect();
        ids.sort_by(|a, b| self.players[b].mass.total_cmp(&self.players[a].mass));

        for eater_id in &ids {
            for prey_id in &ids {
                if eater_id == prey_id {
                    continue;
                }
                let (Some(eater), Some(prey)) =
                    (self.players.get(eater_id), self.players.get(prey_id))
                else {
                    continue;
                };
                if !can_absorb(eater, prey) {
                    continue;
                }

                let amount = prey.mass;
                let gained = amount * policy.gain_multiplier(*prey_id, *eater_id);
                if let Some(eater) = self.players.get_mut(eater_id) {
                    eater.mass += gained;
                }
                self.respawn(*prey_id);
                self.record_transfer(*prey_id, *eater_id, amount);
                debug!("Player {} absorbed player {} ({:.1} mass)", eater_id, prey_id, amount);
            }
        }
    }

    fn record_transfer(&mut self, source: u32, target: u32, amount: f32) {
        self.transfers.push(MassTransfer {
            source,
            target,
            amount,
            tick: self.tick as u64,
        });
    }

    fn respawn(&mut self, client_id: u32) {
        let (x, y) = random_spawn();
        if let Some(player) = self.players.get_mut(&client_id) {
            player.x = x;
            player.y = y;
            player.vel_x = 0.0;
            player.vel_y = 0.0;
            player.mass = START_MASS;
        }
    }

    /// Pairs at close range that are both moving away from each other while
    /// one of them is big enough to eat the other.
    fn detect_avoidance(&self) -> Vec<AvoidanceSignal> {
        let mut ids: Vec<u32> = self.players.keys().copied().collect();
        ids.sort();
        let mut signals = Vec::new();

        for (i, id1) in ids.iter().enumerate() {
            for id2 in &ids[i + 1..] {
                let (p1, p2) = (&self.players[id1], &self.players[id2]);
                if p1.speed() < MIN_STEER_SPEED || p2.speed() < MIN_STEER_SPEED {
                    continue;
                }
                let (bigger, smaller) = if p1.mass >= p2.mass { (p1, p2) } else { (p2, p1) };
                if bigger.mass < smaller.mass * EAT_RATIO {
                    continue;
                }
                if distance(p1, p2) >= AVOIDANCE_RANGE * (p1.radius() + p2.radius()) {
                    continue;
                }

                let dx = p2.x - p1.x;
                let dy = p2.y - p1.y;
                let p1_retreats = p1.vel_x * dx + p1.vel_y * dy < 0.0;
                let p2_retreats = p2.vel_x * dx + p2.vel_y * dy > 0.0;
                if p1_retreats && p2_retreats {
                    signals.push(AvoidanceSignal {
                        a: *id1,
                        b: *id2,
                        tick: self.tick as u64,
                    });
                }
            }
        }
        signals
    }

    pub fn snapshot(&self) -> Vec<PlayerSnapshot> {
        let mut snapshot: Vec<PlayerSnapshot> = self
            .players
            .values()
            .map(|p| PlayerSnapshot {
                id: p.id,
                x: p.x,
                y: p.y,
                radius: p.radius(),
                mass: p.mass,
            })
            .collect();
        snapshot.sort_by_key(|p| p.id);
        snapshot
    }

    /// Collects this tick's snapshot and drains the recorded events.
    pub fn take_telemetry(&mut self) -> TickTelemetry {
        TickTelemetry {
            tick: self.tick as u64,
            players: self.snapshot(),
            transfers: std::mem::take(&mut self.transfers),
            avoidances: self.detect_avoidance(),
        }
    }

    /// One-off proportional mass loss, never below the starting mass.
    pub fn apply_mass_loss(&mut self, client_id: u32, percent: f64) {
        if let Some(player) = self.players.get_mut(&client_id) {
            let keep = (1.0 - percent / 100.0).clamp(0.0, 1.0) as f32;
            player.mass = (player.mass * keep).max(START_MASS);
        }
    }

    /// Resets a player to a fresh cell. Returns false for unknown players.
    pub fn kill(&mut self, client_id: u32) -> bool {
        if self.players.contains_key(&client_id) {
            self.respawn(client_id);
            true
        } else {
            false
        }
    }
}

fn random_spawn() -> (f32, f32) {
    let mut rng = rand::thread_rng();
    (
        rng.gen_range(SPAWN_MARGIN..WORLD_WIDTH - SPAWN_MARGIN),
        rng.gen_range(SPAWN_MARGIN..WORLD_HEIGHT - SPAWN_MARGIN),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    struct Halve;

    impl MassGainPolicy for Halve {
        fn gain_multiplier(&self, _source: u32, _target: u32) -> f32 {
            0.5
        }
    }

    fn input(move_x: f32, move_y: f32, eject: bool) -> InputState {
        InputState {
            sequence: 1,
            timestamp: 0,
            move_x,
            move_y,
            eject,
        }
    }

    fn place(state: &mut GameState, id: u32, x: f32, y: f32, mass: f32) {
        let mut player = Player::new(id, x, y);
        player.mass = mass;
        state.players.insert(id, player);
    }

    #[test]
    fn test_add_and_remove_player() {
        let mut state = GameState::new();
        state.add_player(1);
        let player = &state.players[&1];
        assert!(player.x >= SPAWN_MARGIN && player.x <= WORLD_WIDTH - SPAWN_MARGIN);
        assert_eq!(player.mass, START_MASS);

        state.remove_player(&1);
        assert!(state.players.is_empty());
    }

    #[test]
    fn test_movement_clamped_to_world() {
        let mut state = GameState::new();
        place(&mut state, 1, 5.0, 5.0, START_MASS);
        state.apply_input(1, &input(-1.0, -1.0, false));
        state.update_physics(1.0, &NoPenalty);

        let player = &state.players[&1];
        assert_eq!(player.x, 0.0);
        assert_eq!(player.y, 0.0);
    }

    #[test]
    fn test_input_speed_capped() {
        let mut state = GameState::new();
        place(&mut state, 1, 500.0, 500.0, START_MASS);
        state.apply_input(1, &input(3.0, 4.0, false));
        assert_approx_eq!(state.players[&1].speed(), max_speed_for_mass(START_MASS), 0.01);

        state.apply_input(1, &input(0.0, 0.0, false));
        assert_eq!(state.players[&1].speed(), 0.0);
    }

    #[test]
    fn test_eject_feeds_nearest_player() {
        let mut state = GameState::new();
        state.tick = 7;
        place(&mut state, 1, 500.0, 500.0, 100.0);
        place(&mut state, 2, 700.0, 500.0, 20.0);
        place(&mut state, 3, 1500.0, 500.0, 20.0);

        state.apply_input(1, &input(0.0, 0.0, true));
        state.update_physics(0.0, &NoPenalty);

        assert_approx_eq!(state.players[&1].mass, 100.0 - EJECT_MASS, 0.001);
        assert_approx_eq!(state.players[&2].mass, 20.0 + EJECT_MASS, 0.001);
        assert_approx_eq!(state.players[&3].mass, 20.0, 0.001);

        let telemetry = state.take_telemetry();
        assert_eq!(
            telemetry.transfers,
            vec![MassTransfer {
                source: 1,
                target: 2,
                amount: EJECT_MASS,
                tick: 7
            }]
        );
        assert!(state.take_telemetry().transfers.is_empty());
    }

    #[test]
    fn test_eject_requires_minimum_mass() {
        let mut state = GameState::new();
        place(&mut state, 1, 500.0, 500.0, MIN_EJECT_MASS - 1.0);
        place(&mut state, 2, 600.0, 500.0, 20.0);
        state.apply_input(1, &input(0.0, 0.0, true));
        state.update_physics(0.0, &NoPenalty);
        assert!(state.take_telemetry().transfers.is_empty());
    }

    #[test]
    fn test_penalty_policy_scales_gain() {
        let mut state = GameState::new();
        place(&mut state, 1, 500.0, 500.0, 100.0);
        place(&mut state, 2, 700.0, 500.0, 20.0);
        state.apply_input(1, &input(0.0, 0.0, true));
        state.update_physics(0.0, &Halve);
        assert_approx_eq!(state.players[&2].mass, 20.0 + EJECT_MASS * 0.5, 0.001);
    }

    #[test]
    fn test_eating_transfers_mass_and_respawns_prey() {
        let mut state = GameState::new();
        place(&mut state, 1, 500.0, 500.0, 100.0);
        place(&mut state, 2, 520.0, 500.0, 10.0);

        state.update_physics(0.0, &NoPenalty);

        assert_approx_eq!(state.players[&1].mass, 110.0, 0.001);
        assert_eq!(state.players[&2].mass, START_MASS);
        let telemetry = state.take_telemetry();
        assert_eq!(telemetry.transfers.len(), 1);
        assert_eq!(telemetry.transfers[0].source, 2);
        assert_eq!(telemetry.transfers[0].target, 1);
    }

    #[test]
    fn test_avoidance_detected_for_retreating_pair() {
        let mut state = GameState::new();
        place(&mut state, 1, 500.0, 500.0, 40.0);
        place(&mut state, 2, 600.0, 500.0, 10.0);
        state.players.get_mut(&1).unwrap().vel_x = -50.0;
        state.players.get_mut(&2).unwrap().vel_x = 50.0;

        let telemetry = state.take_telemetry();
        assert_eq!(telemetry.avoidances.len(), 1);
        assert_eq!((telemetry.avoidances[0].a, telemetry.avoidances[0].b), (1, 2));

        // Chasing is not avoidance
        state.players.get_mut(&1).unwrap().vel_x = 50.0;
        assert!(state.take_telemetry().avoidances.is_empty());
    }

    #[test]
    fn test_mass_loss_and_kill() {
        let mut state = GameState::new();
        place(&mut state, 1, 500.0, 500.0, 200.0);

        state.apply_mass_loss(1, 25.0);
        assert_approx_eq!(state.players[&1].mass, 150.0, 0.001);
        state.apply_mass_loss(1, 100.0);
        assert_eq!(state.players[&1].mass, START_MASS);

        state.players.get_mut(&1).unwrap().mass = 80.0;
        assert!(state.kill(1));
        assert_eq!(state.players[&1].mass, START_MASS);
        assert!(!state.kill(9));
    }

    #[test]
    fn test_snapshot_sorted_with_radius() {
        let mut state = GameState::new();
        place(&mut state, 3, 1.0, 1.0, 25.0);
        place(&mut state, 1, 2.0, 2.0, 100.0);
        let snapshot = state.snapshot();
        assert_eq!(snapshot[0].id, 1);
        assert_approx_eq!(snapshot[0].radius, 100.0, 0.001);
        assert_approx_eq!(snapshot[1].radius, 50.0, 0.001);
    }
}
