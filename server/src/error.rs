use thiserror::Error;

/// Failures surfaced by the moderation layer.
///
/// Only an invalid setting in the startup configuration stops the server.
/// Authentication and authorization errors go back to the requesting client,
/// and persistence failures leave the in-memory ban set in force.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModerationError {
    #[error("invalid operator credential")]
    InvalidCredential,

    #[error("operator privilege required")]
    NotAuthorized,

    #[error("invalid address pattern: {0}")]
    InvalidAddressPattern(String),

    #[error("unknown player {0}")]
    UnknownIdentity(u32),

    #[error("failed to persist ban list: {0}")]
    PersistenceFailure(String),

    #[error("invalid value for {name}: {reason}")]
    InvalidSetting { name: String, reason: String },
}

impl From<std::io::Error> for ModerationError {
    fn from(err: std::io::Error) -> Self {
        ModerationError::PersistenceFailure(err.to_string())
    }
}
