//! Pairwise teaming detector
//!
//! Teaming is judged per unordered pair of players. Each pair that shows up
//! together gets a [`SuspicionRecord`] holding a decaying score fed by three
//! independent heuristics:
//!
//! - **Proximity**: the pair stays within `proximity_multiplier` times their
//!   combined radius for more than `proximity_threshold` consecutive ticks.
//! - **Mass transfer**: more than `mass_transfer_threshold` mass moves between
//!   the two within a `mass_transfer_window` tick window.
//! - **Avoidance**: the pair repeatedly steers apart at close range instead of
//!   fighting.
//!
//! Each tick runs in three phases: the carried-over score decays, this tick's
//! evidence is added, then thresholds are checked. Evidence added this tick is
//! therefore never decayed on the same tick.
//!
//! The detector only reports threshold crossings as [`Escalation`]s. Warning
//! counters, bans and messages are handled by the moderation layer.

use crate::config::AntiTeamingConfig;
use crate::error::ModerationError;
use crate::game::MassGainPolicy;
use log::debug;
use shared::{DetectorFlag, DetectorSetting};
use std::collections::{HashMap, HashSet, VecDeque};

/// Records below this score with no pending evidence are dropped.
pub const SCORE_FLOOR: f64 = 0.01;

/// Canonical key for an unordered pair of distinct players.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey {
    low: u32,
    high: u32,
}

impl PairKey {
    /// Returns `None` for a player paired with itself.
    pub fn new(a: u32, b: u32) -> Option<Self> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Some(Self { low: a, high: b }),
            std::cmp::Ordering::Greater => Some(Self { low: b, high: a }),
            std::cmp::Ordering::Equal => None,
        }
    }

    pub fn members(&self) -> [u32; 2] {
        [self.low, self.high]
    }

    pub fn contains(&self, id: u32) -> bool {
        self.low == id || self.high == id
    }
}

/// Per-tick view of one player, provided by the game loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerSnapshot {
    pub id: u32,
    pub x: f32,
    pub y: f32,
    pub radius: f32,
    pub mass: f32,
}

/// Mass absorbed by `target` from `source`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MassTransfer {
    pub source: u32,
    pub target: u32,
    pub amount: f32,
    pub tick: u64,
}

/// The two players were seen steering away from each other at close range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AvoidanceSignal {
    pub a: u32,
    pub b: u32,
    pub tick: u64,
}

/// Everything the detector consumes for one simulation tick.
#[derive(Debug, Clone, Default)]
pub struct TickTelemetry {
    pub tick: u64,
    pub players: Vec<PlayerSnapshot>,
    pub transfers: Vec<MassTransfer>,
    pub avoidances: Vec<AvoidanceSignal>,
}

#[derive(Debug, Clone, Default)]
pub struct SuspicionRecord {
    pub score: f64,
    pub last_update: u64,
    pub last_evidence: u64,
    pub proximity_ticks: u32,
    /// (amount, tick) pairs inside the current window
    pub transfers: VecDeque<(f64, u64)>,
    pub avoidances: u32,
    warned: bool,
    punished: bool,
}

impl SuspicionRecord {
    fn add_suspicion(&mut self, amount: f64, tick: u64) {
        self.score += amount;
        self.last_evidence = tick;
    }

    fn window_total(&self) -> f64 {
        self.transfers.iter().map(|(amount, _)| amount).sum()
    }

    fn has_pending_evidence(&self) -> bool {
        self.proximity_ticks > 0 || !self.transfers.is_empty() || self.avoidances > 0
    }

    /// True while the pair is at or above the punishment threshold.
    pub fn is_punished(&self) -> bool {
        self.punished
    }
}

/// Threshold crossings reported by [`Detector::tick`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Escalation {
    /// Score rose to the warning threshold.
    Warning { pair: PairKey, score: f64 },
    /// Score rose to the punishment threshold.
    Punishment { pair: PairKey, score: f64 },
}

pub struct Detector {
    config: AntiTeamingConfig,
    records: HashMap<PairKey, SuspicionRecord>,
    by_player: HashMap<u32, HashSet<PairKey>>,
    /// Operators as of the last tick
    exempt: HashSet<u32>,
    tick: u64,
}

impl Detector {
    pub fn new(config: AntiTeamingConfig) -> Self {
        Self {
            config,
            records: HashMap::new(),
            by_player: HashMap::new(),
            exempt: HashSet::new(),
            tick: 0,
        }
    }

    pub fn config(&self) -> &AntiTeamingConfig {
        &self.config
    }

    pub fn apply_setting(
        &mut self,
        setting: DetectorSetting,
        value: f64,
    ) -> Result<(), ModerationError> {
        self.config.set(setting, value)
    }

    pub fn apply_flag(&mut self, flag: DetectorFlag, enabled: bool) {
        self.config.set_flag(flag, enabled);
    }

    pub fn record(&self, a: u32, b: u32) -> Option<&SuspicionRecord> {
        PairKey::new(a, b).and_then(|key| self.records.get(&key))
    }

    pub fn score(&self, a: u32, b: u32) -> f64 {
        self.record(a, b).map(|r| r.score).unwrap_or(0.0)
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Pairs the given player currently has a record with.
    pub fn pairs_of(&self, id: u32) -> Vec<PairKey> {
        let mut pairs: Vec<PairKey> = self
            .by_player
            .get(&id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        pairs.sort();
        pairs
    }

    /// Advances every record by one tick. `exempt` players (operators) never
    /// accumulate evidence and are never escalated.
    pub fn tick(&mut self, telemetry: &TickTelemetry, exempt: &HashSet<u32>) -> Vec<Escalation> {
        self.tick = telemetry.tick;
        self.exempt.clone_from(exempt);
        self.decay();

        if !self.config.enabled {
            self.prune();
            return Vec::new();
        }

        let active: HashMap<u32, &PlayerSnapshot> =
            telemetry.players.iter().map(|p| (p.id, p)).collect();
        let eligible =
            |key: &PairKey| key.members().iter().all(|id| active.contains_key(id) && !exempt.contains(id));

        self.accumulate_proximity(&telemetry.players, &eligible);

        for transfer in &telemetry.transfers {
            if let Some(key) = PairKey::new(transfer.source, transfer.target) {
                if eligible(&key) {
                    self.accumulate_transfer(key, transfer);
                }
            }
        }

        for signal in &telemetry.avoidances {
            if let Some(key) = PairKey::new(signal.a, signal.b) {
                if eligible(&key) {
                    self.accumulate_avoidance(key);
                }
            }
        }

        let escalations = self.escalate(&eligible);
        self.prune();
        escalations
    }

    fn decay(&mut self) {
        let decay = self.config.suspicion_decay;
        let window = self.config.mass_transfer_window as u64;
        let now = self.tick;

        for record in self.records.values_mut() {
            record.score = (record.score * decay).max(0.0);
            record.last_update = now;
            while let Some(&(_, tick)) = record.transfers.front() {
                if now.saturating_sub(tick) >= window {
                    record.transfers.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    fn accumulate_proximity(
        &mut self,
        players: &[PlayerSnapshot],
        eligible: &dyn Fn(&PairKey) -> bool,
    ) {
        let mut near = HashSet::new();

        for (i, p1) in players.iter().enumerate() {
            for p2 in &players[i + 1..] {
                let Some(key) = PairKey::new(p1.id, p2.id) else {
                    continue;
                };
                if !eligible(&key) {
                    continue;
                }

                let dx = (p2.x - p1.x) as f64;
                let dy = (p2.y - p1.y) as f64;
                let separation = (dx * dx + dy * dy).sqrt();
                let range = self.config.proximity_multiplier * (p1.radius + p2.radius) as f64;
                if separation < range {
                    near.insert(key);
                }
            }
        }

        // Proximity must be consecutive
        for (key, record) in self.records.iter_mut() {
            if !near.contains(key) {
                record.proximity_ticks = 0;
            }
        }

        let threshold = self.config.proximity_threshold;
        let suspicion = self.config.proximity_suspicion;
        let now = self.tick;
        for key in near {
            let record = self.record_mut(key);
            record.proximity_ticks += 1;
            if record.proximity_ticks > threshold {
                record.add_suspicion(suspicion, now);
                record.proximity_ticks = 0;
                debug!("Proximity evidence for {:?}, score {:.2}", key, record.score);
            }
        }
    }

    fn accumulate_transfer(&mut self, key: PairKey, transfer: &MassTransfer) {
        let threshold = self.config.mass_transfer_threshold;
        let suspicion = self.config.mass_transfer_suspicion;
        let now = self.tick;

        let record = self.record_mut(key);
        record.transfers.push_back((transfer.amount as f64, transfer.tick));
        if record.window_total() > threshold {
            record.add_suspicion(suspicion, now);
            record.transfers.clear();
            debug!("Mass transfer evidence for {:?}, score {:.2}", key, record.score);
        }
    }

    fn accumulate_avoidance(&mut self, key: PairKey) {
        let threshold = self.config.avoidance_threshold;
        let suspicion = self.config.avoidance_suspicion;
        let now = self.tick;

        let record = self.record_mut(key);
        record.avoidances += 1;
        if record.avoidances > threshold {
            record.add_suspicion(suspicion, now);
            record.avoidances = 0;
            debug!("Avoidance evidence for {:?}, score {:.2}", key, record.score);
        }
    }

    fn escalate(&mut self, eligible: &dyn Fn(&PairKey) -> bool) -> Vec<Escalation> {
        let warning = self.config.warning_threshold;
        let punishment = self.config.punishment_threshold;
        let mut escalations = Vec::new();

        for (key, record) in self.records.iter_mut() {
            // Falling back below a threshold re-arms it
            if record.score < warning {
                record.warned = false;
            }
            if record.score < punishment {
                record.punished = false;
            }
            if !eligible(key) {
                continue;
            }

            if record.score >= warning && !record.warned {
                record.warned = true;
                escalations.push(Escalation::Warning {
                    pair: *key,
                    score: record.score,
                });
            }
            if record.score >= punishment && !record.punished {
                record.punished = true;
                escalations.push(Escalation::Punishment {
                    pair: *key,
                    score: record.score,
                });
            }
        }

        // Deterministic order for callers
        escalations.sort_by_key(|e| match e {
            Escalation::Warning { pair, .. } => (*pair, 0),
            Escalation::Punishment { pair, .. } => (*pair, 1),
        });
        escalations
    }

    fn prune(&mut self) {
        let stale: Vec<PairKey> = self
            .records
            .iter()
            .filter(|(_, r)| r.score < SCORE_FLOOR && !r.has_pending_evidence())
            .map(|(key, _)| *key)
            .collect();
        for key in stale {
            self.drop_record(key);
        }
    }

    fn record_mut(&mut self, key: PairKey) -> &mut SuspicionRecord {
        let now = self.tick;
        if !self.records.contains_key(&key) {
            for id in key.members() {
                self.by_player.entry(id).or_default().insert(key);
            }
        }
        self.records.entry(key).or_insert_with(|| SuspicionRecord {
            last_update: now,
            last_evidence: now,
            ..SuspicionRecord::default()
        })
    }

    fn drop_record(&mut self, key: PairKey) {
        self.records.remove(&key);
        for id in key.members() {
            if let Some(pairs) = self.by_player.get_mut(&id) {
                pairs.remove(&key);
                if pairs.is_empty() {
                    self.by_player.remove(&id);
                }
            }
        }
    }

    /// Drops every record involving `id`. Called on disconnect.
    pub fn remove_player(&mut self, id: u32) {
        for key in self.pairs_of(id) {
            self.drop_record(key);
        }
    }

    /// Clears suspicion for one player, or for everyone.
    pub fn reset(&mut self, id: Option<u32>) -> usize {
        match id {
            Some(id) => {
                let pairs = self.pairs_of(id);
                let count = pairs.len();
                for key in pairs {
                    self.drop_record(key);
                }
                count
            }
            None => {
                let count = self.records.len();
                self.records.clear();
                self.by_player.clear();
                count
            }
        }
    }
}

impl MassGainPolicy for Detector {
    /// Mass moving inside a punished pair is scaled down while stealthy
    /// punishment is on. Repeated punishment does not compound the penalty,
    /// and pairs with an operator in them are never penalised.
    fn gain_multiplier(&self, source: u32, target: u32) -> f32 {
        if !self.config.enabled || !self.config.stealthy_punishment {
            return 1.0;
        }
        if self.exempt.contains(&source) || self.exempt.contains(&target) {
            return 1.0;
        }
        match self.record(source, target) {
            Some(record) if record.score >= self.config.punishment_threshold => {
                self.config.mass_absorption_penalty as f32
            }
            _ => 1.0,
        }
    }
}
