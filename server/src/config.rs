//! Server and moderation configuration
//!
//! All sections deserialize with `#[serde(default)]`, so a JSON config file
//! only needs to name the values it overrides. Command-line flags are layered
//! on top by the binary.

use crate::error::ModerationError;
use serde::{Deserialize, Serialize};
use shared::{DetectorFlag, DetectorSetting};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Simulation ticks per second
    pub tick_rate: u32,
    pub max_clients: usize,
    /// Seconds of silence before a client is dropped
    pub client_timeout_secs: u64,
    pub moderation: ModerationConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            tick_rate: 30,
            max_clients: 32,
            client_timeout_secs: 5,
            moderation: ModerationConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&text)?)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModerationConfig {
    /// Shared operator credential. Empty disables operator login.
    pub operator_password: String,
    /// Operator session lifetime in seconds, 0 for no expiry
    pub session_timeout_secs: u64,
    /// Ban list file, one pattern per line
    pub ban_file: PathBuf,
    pub anti_teaming: AntiTeamingConfig,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            operator_password: String::new(),
            session_timeout_secs: 0,
            ban_file: PathBuf::from("banlist.txt"),
            anti_teaming: AntiTeamingConfig::default(),
        }
    }
}

impl ModerationConfig {
    pub fn session_timeout(&self) -> Option<Duration> {
        match self.session_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Tuning for the pairwise teaming detector.
///
/// Tick counts are simulation ticks; scores are unitless suspicion points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiTeamingConfig {
    pub enabled: bool,

    /// Pair counts as close when separation < multiplier * (r1 + r2)
    pub proximity_multiplier: f64,
    pub proximity_threshold: u32,
    pub proximity_suspicion: f64,

    pub mass_transfer_window: u32,
    pub mass_transfer_threshold: f64,
    pub mass_transfer_suspicion: f64,

    pub avoidance_threshold: u32,
    pub avoidance_suspicion: f64,

    /// Multiplicative per-tick decay, strictly between 0 and 1
    pub suspicion_decay: f64,

    pub warning_threshold: f64,
    pub punishment_threshold: f64,
    pub max_warnings: u32,

    pub warnings_enabled: bool,
    pub stealthy_message: bool,
    pub stealthy_punishment: bool,
    pub mass_loss_punishment: bool,
    pub mass_loss_percent: f64,
    /// Gain multiplier applied to pair-internal mass transfers while punished
    pub mass_absorption_penalty: f64,

    pub temp_bans_enabled: bool,
    /// Seconds
    pub ban_duration: u64,
}

impl Default for AntiTeamingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            proximity_multiplier: 1.5,
            proximity_threshold: 100,
            proximity_suspicion: 2.0,
            mass_transfer_window: 75,
            mass_transfer_threshold: 50.0,
            mass_transfer_suspicion: 5.0,
            avoidance_threshold: 40,
            avoidance_suspicion: 3.0,
            suspicion_decay: 0.99,
            warning_threshold: 15.0,
            punishment_threshold: 30.0,
            max_warnings: 3,
            warnings_enabled: true,
            stealthy_message: false,
            stealthy_punishment: true,
            mass_loss_punishment: false,
            mass_loss_percent: 20.0,
            mass_absorption_penalty: 0.5,
            temp_bans_enabled: true,
            ban_duration: 300,
        }
    }
}

impl AntiTeamingConfig {
    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.ban_duration)
    }

    /// Checks every numeric field against its allowed range.
    pub fn validate(&self) -> Result<(), ModerationError> {
        check_range("proximity_multiplier", self.proximity_multiplier, 0.0, f64::MAX, false)?;
        check_range("proximity_suspicion", self.proximity_suspicion, 0.0, f64::MAX, true)?;
        check_range("mass_transfer_threshold", self.mass_transfer_threshold, 0.0, f64::MAX, true)?;
        check_range("mass_transfer_suspicion", self.mass_transfer_suspicion, 0.0, f64::MAX, true)?;
        check_range("avoidance_suspicion", self.avoidance_suspicion, 0.0, f64::MAX, true)?;
        check_range("warning_threshold", self.warning_threshold, 0.0, f64::MAX, false)?;
        check_range("punishment_threshold", self.punishment_threshold, 0.0, f64::MAX, false)?;
        check_range("mass_loss_percent", self.mass_loss_percent, 0.0, 100.0, true)?;
        check_range("mass_absorption_penalty", self.mass_absorption_penalty, 0.0, 1.0, true)?;
        if !(self.suspicion_decay > 0.0 && self.suspicion_decay < 1.0) {
            return Err(invalid("suspicion_decay", "must be strictly between 0 and 1"));
        }
        if self.mass_transfer_window == 0 {
            return Err(invalid("mass_transfer_window", "must be at least one tick"));
        }
        Ok(())
    }

    /// Overrides one numeric parameter. The config is left untouched when the
    /// new value is rejected.
    pub fn set(&mut self, setting: DetectorSetting, value: f64) -> Result<(), ModerationError> {
        if !value.is_finite() {
            return Err(invalid(setting_name(setting), "must be a finite number"));
        }
        let mut candidate = self.clone();
        match setting {
            DetectorSetting::ProximityMultiplier => candidate.proximity_multiplier = value,
            DetectorSetting::ProximityThreshold => candidate.proximity_threshold = as_count(setting, value)?,
            DetectorSetting::ProximitySuspicion => candidate.proximity_suspicion = value,
            DetectorSetting::MassTransferWindow => candidate.mass_transfer_window = as_count(setting, value)?,
            DetectorSetting::MassTransferThreshold => candidate.mass_transfer_threshold = value,
            DetectorSetting::MassTransferSuspicion => candidate.mass_transfer_suspicion = value,
            DetectorSetting::AvoidanceThreshold => candidate.avoidance_threshold = as_count(setting, value)?,
            DetectorSetting::AvoidanceSuspicion => candidate.avoidance_suspicion = value,
            DetectorSetting::SuspicionDecay => candidate.suspicion_decay = value,
            DetectorSetting::WarningThreshold => candidate.warning_threshold = value,
            DetectorSetting::PunishmentThreshold => candidate.punishment_threshold = value,
            DetectorSetting::MaxWarnings => candidate.max_warnings = as_count(setting, value)?,
            DetectorSetting::MassLossPercent => candidate.mass_loss_percent = value,
            DetectorSetting::MassAbsorptionPenalty => candidate.mass_absorption_penalty = value,
            DetectorSetting::BanDuration => candidate.ban_duration = as_count(setting, value)? as u64,
        }
        candidate.validate()?;
        *self = candidate;
        Ok(())
    }

    pub fn set_flag(&mut self, flag: DetectorFlag, enabled: bool) {
        match flag {
            DetectorFlag::Enabled => self.enabled = enabled,
            DetectorFlag::Warnings => self.warnings_enabled = enabled,
            DetectorFlag::StealthyMessage => self.stealthy_message = enabled,
            DetectorFlag::StealthyPunishment => self.stealthy_punishment = enabled,
            DetectorFlag::MassLossPunishment => self.mass_loss_punishment = enabled,
            DetectorFlag::TempBans => self.temp_bans_enabled = enabled,
        }
    }
}

pub const SETTINGS: [DetectorSetting; 15] = [
    DetectorSetting::ProximityMultiplier,
    DetectorSetting::ProximityThreshold,
    DetectorSetting::ProximitySuspicion,
    DetectorSetting::MassTransferWindow,
    DetectorSetting::MassTransferThreshold,
    DetectorSetting::MassTransferSuspicion,
    DetectorSetting::AvoidanceThreshold,
    DetectorSetting::AvoidanceSuspicion,
    DetectorSetting::SuspicionDecay,
    DetectorSetting::WarningThreshold,
    DetectorSetting::PunishmentThreshold,
    DetectorSetting::MaxWarnings,
    DetectorSetting::MassLossPercent,
    DetectorSetting::MassAbsorptionPenalty,
    DetectorSetting::BanDuration,
];

pub fn setting_from_name(name: &str) -> Option<DetectorSetting> {
    SETTINGS.into_iter().find(|s| setting_name(*s) == name)
}

pub fn flag_from_name(name: &str) -> Option<DetectorFlag> {
    match name {
        "enabled" => Some(DetectorFlag::Enabled),
        "warnings" => Some(DetectorFlag::Warnings),
        "stealthy_message" => Some(DetectorFlag::StealthyMessage),
        "stealthy_punishment" => Some(DetectorFlag::StealthyPunishment),
        "mass_loss_punishment" => Some(DetectorFlag::MassLossPunishment),
        "temp_bans" => Some(DetectorFlag::TempBans),
        _ => None,
    }
}

pub fn setting_name(setting: DetectorSetting) -> &'static str {
    match setting {
        DetectorSetting::ProximityMultiplier => "proximity_multiplier",
        DetectorSetting::ProximityThreshold => "proximity_threshold",
        DetectorSetting::ProximitySuspicion => "proximity_suspicion",
        DetectorSetting::MassTransferWindow => "mass_transfer_window",
        DetectorSetting::MassTransferThreshold => "mass_transfer_threshold",
        DetectorSetting::MassTransferSuspicion => "mass_transfer_suspicion",
        DetectorSetting::AvoidanceThreshold => "avoidance_threshold",
        DetectorSetting::AvoidanceSuspicion => "avoidance_suspicion",
        DetectorSetting::SuspicionDecay => "suspicion_decay",
        DetectorSetting::WarningThreshold => "warning_threshold",
        DetectorSetting::PunishmentThreshold => "punishment_threshold",
        DetectorSetting::MaxWarnings => "max_warnings",
        DetectorSetting::MassLossPercent => "mass_loss_percent",
        DetectorSetting::MassAbsorptionPenalty => "mass_absorption_penalty",
        DetectorSetting::BanDuration => "ban_duration",
    }
}

fn as_count(setting: DetectorSetting, value: f64) -> Result<u32, ModerationError> {
    if value < 0.0 || value.fract() != 0.0 || value > u32::MAX as f64 {
        return Err(invalid(setting_name(setting), "must be a whole non-negative number"));
    }
    Ok(value as u32)
}

fn check_range(
    name: &str,
    value: f64,
    min: f64,
    max: f64,
    min_inclusive: bool,
) -> Result<(), ModerationError> {
    let above_min = if min_inclusive { value >= min } else { value > min };
    if !value.is_finite() || !above_min || value > max {
        let bound = if min_inclusive { ">=" } else { ">" };
        return Err(invalid(name, &format!("must be {} {} and <= {}", bound, min, max)));
    }
    Ok(())
}

fn invalid(name: &str, reason: &str) -> ModerationError {
    ModerationError::InvalidSetting {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(AntiTeamingConfig::default().validate().is_ok());
        let config = ServerConfig::default();
        assert_eq!(config.bind_address(), "127.0.0.1:8080");
        assert_eq!(config.moderation.session_timeout(), None);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{
            "port": 9000,
            "moderation": {
                "operator_password": "hunter2",
                "session_timeout_secs": 600,
                "anti_teaming": { "suspicion_decay": 0.95, "stealthy_message": true }
            }
        }"#;

        let config = ServerConfig::from_json(json).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.tick_rate, 30);
        assert_eq!(config.moderation.operator_password, "hunter2");
        assert_eq!(
            config.moderation.session_timeout(),
            Some(Duration::from_secs(600))
        );
        assert_eq!(config.moderation.anti_teaming.suspicion_decay, 0.95);
        assert!(config.moderation.anti_teaming.stealthy_message);
        assert_eq!(config.moderation.anti_teaming.max_warnings, 3);
    }

    #[test]
    fn test_set_rejects_out_of_range_decay() {
        let mut config = AntiTeamingConfig::default();

        for bad in [0.0, 1.0, 1.5, -0.2, f64::NAN] {
            let result = config.set(DetectorSetting::SuspicionDecay, bad);
            assert!(
                matches!(result, Err(ModerationError::InvalidSetting { .. })),
                "decay {} should be rejected",
                bad
            );
        }
        assert_eq!(config.suspicion_decay, 0.99);

        config.set(DetectorSetting::SuspicionDecay, 0.9).unwrap();
        assert_eq!(config.suspicion_decay, 0.9);
    }

    #[test]
    fn test_set_counts_must_be_whole() {
        let mut config = AntiTeamingConfig::default();
        assert!(config.set(DetectorSetting::MaxWarnings, 2.5).is_err());
        assert!(config.set(DetectorSetting::MaxWarnings, -1.0).is_err());
        config.set(DetectorSetting::MaxWarnings, 5.0).unwrap();
        assert_eq!(config.max_warnings, 5);
        assert!(config.set(DetectorSetting::MassTransferWindow, 0.0).is_err());
        assert_eq!(config.mass_transfer_window, 75);
    }

    #[test]
    fn test_names_round_trip() {
        for setting in SETTINGS {
            assert_eq!(setting_from_name(setting_name(setting)), Some(setting));
        }
        assert_eq!(setting_from_name("nonsense"), None);
        assert_eq!(flag_from_name("temp_bans"), Some(DetectorFlag::TempBans));
        assert_eq!(flag_from_name("Enabled"), None);
    }

    #[test]
    fn test_set_flag() {
        let mut config = AntiTeamingConfig::default();
        config.set_flag(DetectorFlag::MassLossPunishment, true);
        config.set_flag(DetectorFlag::TempBans, false);
        assert!(config.mass_loss_punishment);
        assert!(!config.temp_bans_enabled);
    }
}
