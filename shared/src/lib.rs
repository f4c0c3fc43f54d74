use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const WORLD_WIDTH: f32 = 2000.0;
pub const WORLD_HEIGHT: f32 = 2000.0;
pub const PLAYER_SPEED: f32 = 300.0;
pub const START_MASS: f32 = 10.0;
pub const MIN_EJECT_MASS: f32 = 32.0;
pub const EJECT_MASS: f32 = 12.0;
pub const EJECT_RANGE: f32 = 250.0;
pub const EAT_RATIO: f32 = 1.25;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    Connect {
        client_version: u32,
    },
    Input {
        sequence: u32,
        timestamp: u64,
        move_x: f32,
        move_y: f32,
        eject: bool,
    },
    Admin {
        request: AdminRequest,
    },
    Disconnect,

    Connected {
        client_id: u32,
    },
    GameState {
        tick: u32,
        timestamp: u64,
        last_processed_input: HashMap<u32, u32>,
        players: Vec<Player>,
    },
    Notice {
        text: String,
    },
    AdminReply {
        ok: bool,
        text: String,
    },
    Disconnected {
        reason: String,
    },
}

/// Privileged requests a connected client may submit.
///
/// Only `Operator` is accepted from a non-operator; everything else is
/// rejected unless the sender currently holds operator privilege.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum AdminRequest {
    /// Toggles operator privilege for the sender.
    Operator { password: String },
    Ban { pattern: String },
    /// Bans the current address of a connected player.
    BanPlayer { id: u32 },
    Unban { pattern: String },
    BanList { page: usize },
    ReloadBans,
    Kill { id: u32 },
    /// Clears teaming suspicion for one player, or for everyone when `None`.
    ResetSuspicion { id: Option<u32> },
    SetDetector { setting: DetectorSetting, value: f64 },
    SetDetectorFlag { flag: DetectorFlag, enabled: bool },
    Status,
}

/// Numeric anti-teaming parameters that can be overridden at runtime.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum DetectorSetting {
    ProximityMultiplier,
    ProximityThreshold,
    ProximitySuspicion,
    MassTransferWindow,
    MassTransferThreshold,
    MassTransferSuspicion,
    AvoidanceThreshold,
    AvoidanceSuspicion,
    SuspicionDecay,
    WarningThreshold,
    PunishmentThreshold,
    MaxWarnings,
    MassLossPercent,
    MassAbsorptionPenalty,
    BanDuration,
}

/// Boolean anti-teaming switches that can be flipped at runtime.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum DetectorFlag {
    Enabled,
    Warnings,
    StealthyMessage,
    StealthyPunishment,
    MassLossPunishment,
    TempBans,
}

/// A player cell. Position is the cell center.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Player {
    pub id: u32,
    pub x: f32,
    pub y: f32,
    pub vel_x: f32,
    pub vel_y: f32,
    pub mass: f32,
}

impl Player {
    pub fn new(id: u32, x: f32, y: f32) -> Self {
        Self {
            id,
            x,
            y,
            vel_x: 0.0,
            vel_y: 0.0,
            mass: START_MASS,
        }
    }

    pub fn radius(&self) -> f32 {
        radius_for_mass(self.mass)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x, self.y)
    }

    pub fn speed(&self) -> f32 {
        (self.vel_x * self.vel_x + self.vel_y * self.vel_y).sqrt()
    }
}

pub fn radius_for_mass(mass: f32) -> f32 {
    (mass.max(0.0) * 100.0).sqrt()
}

pub fn distance(player1: &Player, player2: &Player) -> f32 {
    let dx = player2.x - player1.x;
    let dy = player2.y - player1.y;
    (dx * dx + dy * dy).sqrt()
}

/// Returns true when `eater` is large enough and close enough to swallow `prey`.
pub fn can_absorb(eater: &Player, prey: &Player) -> bool {
    if eater.mass < prey.mass * EAT_RATIO {
        return false;
    }
    distance(eater, prey) < eater.radius() - prey.radius() * 0.5
}

/// Top speed shrinks as a cell grows.
pub fn max_speed_for_mass(mass: f32) -> f32 {
    PLAYER_SPEED * (START_MASS / mass.max(START_MASS)).powf(0.25)
}

#[derive(Debug, Clone)]
pub struct InputState {
    pub sequence: u32,
    pub timestamp: u64,
    pub move_x: f32,
    pub move_y: f32,
    pub eject: bool,
}
