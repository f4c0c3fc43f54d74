//! Moderation facade
//!
//! Owns the ban registry, operator sessions and teaming detector, and is the
//! only thing the network loop talks to. All calls happen on the server's
//! single game task, so admin requests and detector ticks never interleave.
//!
//! Detector escalations are turned into concrete effects here:
//!
//! - a warning increments both players' warning counters and, unless
//!   messages are stealthy, tells them
//! - once a counter goes past `max_warnings` the player's address is banned
//!   for `ban_duration` seconds and the counter starts over
//! - a punishment optionally costs both players a share of their mass
//!
//! Temporary bans are in-memory registry entries with a deadline kept here.
//! They are never written to the ban file, so a restart forgets them instead
//! of making them permanent. The deadlines are checked every tick and before
//! every admission check.

use crate::admin::AdminAuthority;
use crate::ban_registry::{ipv4_of, AddressPattern, BanRegistry, BanStore, Mutation};
use crate::config::{setting_name, ModerationConfig};
use crate::detector::{Detector, Escalation, PairKey, TickTelemetry};
use crate::error::ModerationError;
use log::{error, info, warn};
use shared::AdminRequest;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

pub const BAN_LIST_PAGE_SIZE: usize = 10;

/// Effects the game loop must carry out.
#[derive(Debug, Clone, PartialEq)]
pub enum Enforcement {
    Notify { id: u32, text: String },
    MassLoss { id: u32, percent: f64 },
    Kill { id: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    pub text: String,
    pub effects: Vec<Enforcement>,
}

impl CommandReply {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            effects: Vec::new(),
        }
    }
}

pub struct Moderation {
    registry: BanRegistry,
    authority: AdminAuthority,
    detector: Detector,
    /// Expiry deadlines for detector-issued bans, by pattern
    temp_bans: HashMap<String, Instant>,
}

impl Moderation {
    /// Builds the moderation layer and loads the ban list from `store`.
    ///
    /// Fails when the anti-teaming settings are out of range. An unreadable
    /// ban list is logged and the registry starts empty.
    pub fn new(
        config: &ModerationConfig,
        store: Box<dyn BanStore>,
    ) -> Result<Self, ModerationError> {
        if let Err(e) = config.anti_teaming.validate() {
            error!("Rejecting anti-teaming configuration: {}", e);
            return Err(e);
        }

        let mut registry = BanRegistry::new(store);
        if let Err(e) = registry.reload() {
            error!("Could not load ban list, starting empty: {}", e);
        }

        Ok(Self {
            registry,
            authority: AdminAuthority::new(
                config.operator_password.clone(),
                config.session_timeout(),
            ),
            detector: Detector::new(config.anti_teaming.clone()),
            temp_bans: HashMap::new(),
        })
    }

    pub fn registry(&self) -> &BanRegistry {
        &self.registry
    }

    pub fn authority(&self) -> &AdminAuthority {
        &self.authority
    }

    pub fn detector(&self) -> &Detector {
        &self.detector
    }

    /// Admission check for a connecting peer.
    pub fn is_banned(&mut self, addr: IpAddr, now: Instant) -> bool {
        self.expire_temp_bans(now);
        self.registry.is_banned(addr)
    }

    pub fn on_connect(&mut self, id: u32, addr: IpAddr) {
        self.authority.connect(id, addr);
    }

    pub fn on_disconnect(&mut self, id: u32) {
        self.authority.disconnect(id);
        self.detector.remove_player(id);
    }

    /// Runs the detector over one tick and returns the resulting effects.
    pub fn on_tick(&mut self, telemetry: &TickTelemetry, now: Instant) -> Vec<Enforcement> {
        self.expire_temp_bans(now);

        let operators = self.authority.operators(now);
        let escalations = self.detector.tick(telemetry, &operators);

        let mut effects = Vec::new();
        for escalation in escalations {
            match escalation {
                Escalation::Warning { pair, score } => {
                    info!("Teaming warning for {:?} (score {:.1})", pair, score);
                    self.warn_pair(pair, now, &mut effects);
                }
                Escalation::Punishment { pair, score } => {
                    info!("Teaming punishment for {:?} (score {:.1})", pair, score);
                    self.punish_pair(pair, &mut effects);
                }
            }
        }
        effects
    }

    fn warn_pair(&mut self, pair: PairKey, now: Instant, effects: &mut Vec<Enforcement>) {
        let config = self.detector.config().clone();

        for id in pair.members() {
            let Some(count) = self.authority.add_warning(id) else {
                continue;
            };

            if count > config.max_warnings && config.temp_bans_enabled {
                self.authority.reset_warnings(id);
                if self.temp_ban(id, now).is_some() && !config.stealthy_message {
                    effects.push(Enforcement::Notify {
                        id,
                        text: format!(
                            "You have been banned for {} seconds for teaming",
                            config.ban_duration
                        ),
                    });
                }
            } else if config.warnings_enabled && !config.stealthy_message {
                effects.push(Enforcement::Notify {
                    id,
                    text: format!(
                        "Teaming is not allowed here (warning {}/{})",
                        count.min(config.max_warnings),
                        config.max_warnings
                    ),
                });
            }
        }
    }

    fn punish_pair(&mut self, pair: PairKey, effects: &mut Vec<Enforcement>) {
        let config = self.detector.config();
        if !config.mass_loss_punishment {
            return;
        }

        for id in pair.members() {
            effects.push(Enforcement::MassLoss {
                id,
                percent: config.mass_loss_percent,
            });
            if !config.stealthy_message {
                effects.push(Enforcement::Notify {
                    id,
                    text: "You lost mass as a penalty for teaming".to_string(),
                });
            }
        }
    }

    /// Bans the player's current address until the configured duration has
    /// passed. Addresses that are already banned are left alone, so a
    /// permanent ban is never given an expiry.
    fn temp_ban(&mut self, id: u32, now: Instant) -> Option<String> {
        let Some(v4) = self.authority.address(id).and_then(ipv4_of) else {
            warn!("Player {} has no IPv4 address, skipping teaming ban", id);
            return None;
        };
        let pattern = AddressPattern::exact(v4).to_string();

        match self.registry.add_temporary(&pattern) {
            Ok(false) => None,
            Ok(true) => {
                let expires_at = now + self.detector.config().ban_duration();
                self.temp_bans.insert(pattern.clone(), expires_at);
                info!(
                    "Player {} temporarily banned for teaming ({} for {}s)",
                    id,
                    pattern,
                    self.detector.config().ban_duration
                );
                Some(pattern)
            }
            Err(e) => {
                error!("Could not ban player {}: {}", id, e);
                None
            }
        }
    }

    fn expire_temp_bans(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .temp_bans
            .iter()
            .filter(|(_, deadline)| now >= **deadline)
            .map(|(pattern, _)| pattern.clone())
            .collect();

        for pattern in expired {
            self.temp_bans.remove(&pattern);
            if self.registry.remove_temporary(&pattern) {
                info!("Temporary ban on {} expired", pattern);
            }
        }
    }

    pub fn temp_ban_deadline(&self, pattern: &str) -> Option<Instant> {
        self.temp_bans.get(pattern).copied()
    }

    /// Executes an admin request from player `id`. Everything except the
    /// operator login itself needs operator privilege.
    pub fn execute(
        &mut self,
        id: u32,
        request: AdminRequest,
        now: Instant,
    ) -> Result<CommandReply, ModerationError> {
        match request {
            AdminRequest::Operator { password } => self.toggle_operator(id, &password, now),
            request => {
                self.authority.require_privilege(id, now)?;
                self.execute_privileged(id, request, now)
            }
        }
    }

    fn toggle_operator(
        &mut self,
        id: u32,
        password: &str,
        now: Instant,
    ) -> Result<CommandReply, ModerationError> {
        let granted = self.authority.authenticate(id, password, now)?;
        Ok(CommandReply::text(if granted {
            "You are now an operator"
        } else {
            "You are no longer an operator"
        }))
    }

    fn execute_privileged(
        &mut self,
        id: u32,
        request: AdminRequest,
        now: Instant,
    ) -> Result<CommandReply, ModerationError> {
        match request {
            AdminRequest::Operator { password } => self.toggle_operator(id, &password, now),
            AdminRequest::Ban { pattern } => self.ban(&pattern),
            AdminRequest::BanPlayer { id: target } => {
                let addr = self
                    .authority
                    .address(target)
                    .ok_or(ModerationError::UnknownIdentity(target))?;
                let v4 = ipv4_of(addr)
                    .ok_or_else(|| ModerationError::InvalidAddressPattern(addr.to_string()))?;
                self.ban(&AddressPattern::exact(v4).to_string())
            }
            AdminRequest::Unban { pattern } => {
                let mutation = self.registry.remove(&pattern)?;
                let key = pattern.parse::<AddressPattern>()?.to_string();
                self.temp_bans.remove(&key);
                let text = if mutation.changed {
                    format!("Unbanned {}", key)
                } else {
                    format!("{} is not banned", key)
                };
                Ok(CommandReply::text(with_persist_warning(text, &mutation)))
            }
            AdminRequest::BanList { page } => {
                let total = self.registry.len();
                let pages = total.div_ceil(BAN_LIST_PAGE_SIZE).max(1);
                let mut lines = vec![format!(
                    "Ban list page {}/{} ({} entries)",
                    page + 1,
                    pages,
                    total
                )];
                lines.extend(self.registry.list_page(page, BAN_LIST_PAGE_SIZE));
                Ok(CommandReply::text(lines.join("\n")))
            }
            AdminRequest::ReloadBans => {
                let count = self.registry.reload()?;
                let registry = &self.registry;
                self.temp_bans.retain(|pattern, _| registry.is_temporary(pattern));
                Ok(CommandReply::text(format!("Reloaded {} ban entries", count)))
            }
            AdminRequest::Kill { id: target } => {
                if self.authority.session(target).is_none() {
                    return Err(ModerationError::UnknownIdentity(target));
                }
                info!("Operator {} killed player {}", id, target);
                Ok(CommandReply {
                    text: format!("Killed player {}", target),
                    effects: vec![Enforcement::Kill { id: target }],
                })
            }
            AdminRequest::ResetSuspicion { id: target } => {
                let cleared = self.detector.reset(target);
                match target {
                    Some(target) => self.authority.reset_warnings(target),
                    None => self.authority.reset_all_warnings(),
                }
                Ok(CommandReply::text(format!(
                    "Cleared {} suspicion records",
                    cleared
                )))
            }
            AdminRequest::SetDetector { setting, value } => {
                self.detector.apply_setting(setting, value)?;
                info!("Operator {} set {} to {}", id, setting_name(setting), value);
                Ok(CommandReply::text(format!(
                    "{} set to {}",
                    setting_name(setting),
                    value
                )))
            }
            AdminRequest::SetDetectorFlag { flag, enabled } => {
                self.detector.apply_flag(flag, enabled);
                info!("Operator {} set {:?} to {}", id, flag, enabled);
                Ok(CommandReply::text(format!("{:?} set to {}", flag, enabled)))
            }
            AdminRequest::Status => {
                let operators = self.authority.operators(now).len();
                Ok(CommandReply::text(format!(
                    "{} players, {} operators, {} bans ({} temporary), {} suspicion records",
                    self.authority.len(),
                    operators,
                    self.registry.len(),
                    self.registry.temporary_len(),
                    self.detector.record_count()
                )))
            }
        }
    }

    /// Manual bans are permanent, even over a pending temporary one.
    fn ban(&mut self, pattern: &str) -> Result<CommandReply, ModerationError> {
        let key = pattern.parse::<AddressPattern>()?.to_string();
        let was_temporary = self.registry.is_temporary(&key);
        let mutation = self.registry.add(&key)?;
        self.temp_bans.remove(&key);

        let text = if mutation.changed && was_temporary {
            format!("{} is now banned permanently", key)
        } else if mutation.changed {
            format!("Banned {}", key)
        } else {
            format!("{} is already banned", key)
        };
        Ok(CommandReply::text(with_persist_warning(text, &mutation)))
    }
}

fn with_persist_warning(text: String, mutation: &Mutation) -> String {
    match &mutation.persist_error {
        Some(e) => format!("{} (warning: {})", text, e),
        None => text,
    }
}
