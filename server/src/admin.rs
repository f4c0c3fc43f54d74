//! Operator privilege for connected players
//!
//! Every connected player has an [`OperatorSession`] created on connect with
//! privilege off. Submitting the shared operator password toggles privilege:
//! the first correct submission grants it, the next one revokes it.
//!
//! When a session timeout is configured, granting privilege sets a deadline.
//! Nothing runs when the deadline passes; the next privilege check notices it
//! and switches privilege off.

use crate::error::ModerationError;
use log::{info, warn};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;

#[derive(Debug, Clone)]
pub struct OperatorSession {
    pub addr: IpAddr,
    pub operator: bool,
    pub expires_at: Option<Instant>,
    /// Anti-teaming warnings issued to this player
    pub warnings: u32,
}

impl OperatorSession {
    pub fn new(addr: IpAddr) -> Self {
        Self {
            addr,
            operator: false,
            expires_at: None,
            warnings: 0,
        }
    }

    /// Drops privilege if the deadline has passed. Returns true when it did.
    fn expire(&mut self, now: Instant) -> bool {
        match self.expires_at {
            Some(deadline) if self.operator && now >= deadline => {
                self.operator = false;
                self.expires_at = None;
                true
            }
            _ => false,
        }
    }
}

pub struct AdminAuthority {
    credential: String,
    session_timeout: Option<Duration>,
    sessions: HashMap<u32, OperatorSession>,
}

impl AdminAuthority {
    pub fn new(credential: impl Into<String>, session_timeout: Option<Duration>) -> Self {
        let credential = credential.into();
        if credential.is_empty() {
            warn!("No operator password configured, operator login is disabled");
        }
        Self {
            credential,
            session_timeout,
            sessions: HashMap::new(),
        }
    }

    pub fn connect(&mut self, id: u32, addr: IpAddr) {
        self.sessions.insert(id, OperatorSession::new(addr));
    }

    pub fn disconnect(&mut self, id: u32) -> Option<OperatorSession> {
        self.sessions.remove(&id)
    }

    pub fn session(&self, id: u32) -> Option<&OperatorSession> {
        self.sessions.get(&id)
    }

    pub fn address(&self, id: u32) -> Option<IpAddr> {
        self.sessions.get(&id).map(|s| s.addr)
    }

    /// Toggles operator privilege when `submitted` matches the configured
    /// password. Returns the privilege state after the toggle.
    pub fn authenticate(
        &mut self,
        id: u32,
        submitted: &str,
        now: Instant,
    ) -> Result<bool, ModerationError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(ModerationError::UnknownIdentity(id))?;

        if self.credential.is_empty()
            || !bool::from(self.credential.as_bytes().ct_eq(submitted.as_bytes()))
        {
            warn!("Player {} submitted a wrong operator password", id);
            return Err(ModerationError::InvalidCredential);
        }

        // A lapsed session counts as off, so this submission grants again
        session.expire(now);
        session.operator = !session.operator;
        session.expires_at = match (session.operator, self.session_timeout) {
            (true, Some(timeout)) => Some(now + timeout),
            _ => None,
        };

        if session.operator {
            info!("Player {} is now an operator", id);
        } else {
            info!("Player {} is no longer an operator", id);
        }
        Ok(session.operator)
    }

    pub fn check_privilege(&mut self, id: u32, now: Instant) -> bool {
        match self.sessions.get_mut(&id) {
            Some(session) => {
                if session.expire(now) {
                    info!("Operator session for player {} expired", id);
                }
                session.operator
            }
            None => false,
        }
    }

    pub fn require_privilege(&mut self, id: u32, now: Instant) -> Result<(), ModerationError> {
        if self.check_privilege(id, now) {
            Ok(())
        } else {
            Err(ModerationError::NotAuthorized)
        }
    }

    /// Every current operator, expiring lapsed sessions on the way.
    pub fn operators(&mut self, now: Instant) -> HashSet<u32> {
        let mut operators = HashSet::new();
        for (id, session) in self.sessions.iter_mut() {
            if session.expire(now) {
                info!("Operator session for player {} expired", id);
            }
            if session.operator {
                operators.insert(*id);
            }
        }
        operators
    }

    pub fn add_warning(&mut self, id: u32) -> Option<u32> {
        self.sessions.get_mut(&id).map(|session| {
            session.warnings += 1;
            session.warnings
        })
    }

    pub fn warnings(&self, id: u32) -> u32 {
        self.sessions.get(&id).map(|s| s.warnings).unwrap_or(0)
    }

    pub fn reset_warnings(&mut self, id: u32) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.warnings = 0;
        }
    }

    pub fn reset_all_warnings(&mut self) {
        for session in self.sessions.values_mut() {
            session.warnings = 0;
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
    }

    fn authority(timeout: Option<Duration>) -> AdminAuthority {
        let mut authority = AdminAuthority::new("s3cret", timeout);
        authority.connect(1, addr());
        authority.connect(2, addr());
        authority
    }

    #[test]
    fn test_new_session_has_no_privilege() {
        let mut authority = authority(None);
        let now = Instant::now();
        assert!(!authority.check_privilege(1, now));
        assert_eq!(
            authority.require_privilege(1, now),
            Err(ModerationError::NotAuthorized)
        );
        assert_eq!(authority.warnings(1), 0);
    }

    #[test]
    fn test_wrong_password_rejected() {
        let mut authority = authority(None);
        let now = Instant::now();
        for wrong in ["", "s3cre", "s3cret!", "S3CRET"] {
            assert_eq!(
                authority.authenticate(1, wrong, now),
                Err(ModerationError::InvalidCredential)
            );
        }
        assert!(!authority.check_privilege(1, now));
    }

    #[test]
    fn test_authenticate_toggles() {
        let mut authority = authority(None);
        let now = Instant::now();

        assert_eq!(authority.authenticate(1, "s3cret", now), Ok(true));
        assert!(authority.check_privilege(1, now));
        assert!(authority.require_privilege(1, now).is_ok());
        assert!(!authority.check_privilege(2, now));

        assert_eq!(authority.authenticate(1, "s3cret", now), Ok(false));
        assert!(!authority.check_privilege(1, now));
    }

    #[test]
    fn test_unknown_identity() {
        let mut authority = authority(None);
        assert_eq!(
            authority.authenticate(99, "s3cret", Instant::now()),
            Err(ModerationError::UnknownIdentity(99))
        );
        assert!(!authority.check_privilege(99, Instant::now()));
    }

    #[test]
    fn test_empty_credential_disables_login() {
        let mut authority = AdminAuthority::new("", None);
        authority.connect(1, addr());
        assert_eq!(
            authority.authenticate(1, "", Instant::now()),
            Err(ModerationError::InvalidCredential)
        );
    }

    #[test]
    fn test_session_expires_lazily() {
        let mut authority = authority(Some(Duration::from_secs(60)));
        let start = Instant::now();

        authority.authenticate(1, "s3cret", start).unwrap();
        assert!(authority.check_privilege(1, start + Duration::from_secs(59)));

        // Still flagged until someone looks
        assert!(authority.session(1).unwrap().operator);
        assert!(!authority.check_privilege(1, start + Duration::from_secs(60)));
        assert!(!authority.session(1).unwrap().operator);
        assert!(authority.session(1).unwrap().expires_at.is_none());
    }

    #[test]
    fn test_reauthenticate_after_lapse_grants() {
        let mut authority = authority(Some(Duration::from_secs(10)));
        let start = Instant::now();
        authority.authenticate(1, "s3cret", start).unwrap();

        let later = start + Duration::from_secs(30);
        assert_eq!(authority.authenticate(1, "s3cret", later), Ok(true));
        assert!(authority.check_privilege(1, later + Duration::from_secs(9)));
    }

    #[test]
    fn test_reauthenticate_restarts_timer() {
        let mut authority = authority(Some(Duration::from_secs(10)));
        let start = Instant::now();
        authority.authenticate(1, "s3cret", start).unwrap();
        authority.authenticate(1, "s3cret", start).unwrap();
        let regrant = start + Duration::from_secs(8);
        authority.authenticate(1, "s3cret", regrant).unwrap();
        assert!(authority.check_privilege(1, start + Duration::from_secs(15)));
    }

    #[test]
    fn test_operators_applies_expiry() {
        let mut authority = authority(Some(Duration::from_secs(5)));
        let start = Instant::now();
        authority.authenticate(1, "s3cret", start).unwrap();

        assert_eq!(authority.operators(start), HashSet::from([1]));
        assert!(authority.operators(start + Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn test_disconnect_destroys_session() {
        let mut authority = authority(None);
        let now = Instant::now();
        authority.authenticate(1, "s3cret", now).unwrap();
        authority.add_warning(1);

        let session = authority.disconnect(1).unwrap();
        assert!(session.operator);
        assert_eq!(session.warnings, 1);

        authority.connect(1, addr());
        assert!(!authority.check_privilege(1, now));
        assert_eq!(authority.warnings(1), 0);
    }

    #[test]
    fn test_warning_counter() {
        let mut authority = authority(None);
        assert_eq!(authority.add_warning(1), Some(1));
        assert_eq!(authority.add_warning(1), Some(2));
        assert_eq!(authority.add_warning(42), None);
        authority.reset_warnings(1);
        assert_eq!(authority.warnings(1), 0);
    }

    #[test]
    fn test_password_prefix_and_extension_rejected() {
        let now = Instant::now();
        let mut authority = AdminAuthority::new("secret", None);
        authority.connect(1, addr());

        for attempt in ["secre", "secret ", "secretx", "SECRET"] {
            assert!(matches!(
                authority.authenticate(1, attempt, now),
                Err(ModerationError::InvalidCredential)
            ));
        }
        assert!(!authority.check_privilege(1, now));
        assert!(authority.authenticate(1, "secret", now).unwrap());
    }
}
