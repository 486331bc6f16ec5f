//! Error types for kitrelay-core

use thiserror::Error;

use crate::types::{Capability, KitId};

/// Main error type for the kitrelay-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A single kit configuration block could not be parsed
    #[error("malformed configuration for kit {kit_id}: {message}")]
    MalformedKitConfig { kit_id: KitId, message: String },

    /// The event shape does not fit the requested capability
    #[error("cannot dispatch {event} event with {capability} capability")]
    CapabilityMismatch {
        event: &'static str,
        capability: Capability,
    },

    /// Kit failure surfaced outside of dispatch (e.g. from the factory)
    #[error(transparent)]
    Kit(#[from] KitError),

    /// The coordination context has shut down
    #[error("coordinator is no longer running")]
    CoordinatorClosed,
}

/// Result type alias for kitrelay-core
pub type Result<T> = std::result::Result<T, Error>;

/// Failure raised by a destination while handling a call.
///
/// The engine never propagates these; they are logged with the kit name and
/// the capability that was invoked, and the destination is treated as having
/// not forwarded the call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KitError {
    /// The kit rejected or failed the call
    #[error("{0}")]
    Failed(String),

    /// The kit could not be constructed from its configuration
    #[error("kit construction failed: {0}")]
    Construction(String),

    /// The kit handler panicked
    #[error("kit handler panicked: {0}")]
    Panicked(String),
}

impl KitError {
    pub fn failed(message: impl Into<String>) -> Self {
        KitError::Failed(message.into())
    }
}

/// Result type returned by destination handlers
pub type KitResult<T> = std::result::Result<T, KitError>;
