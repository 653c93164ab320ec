//! Error types for kx-relay.

use kx_types::ETag;

/// Main error type for kx-relay startup and serving.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by a key/value backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Redis command or connection failure.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Value stored under a counter key is not a number.
    #[error("counter {key} holds a non-numeric value")]
    NotACounter {
        /// The offending key.
        key: String,
    },
}

/// Errors raised by the channel store and the blacklist.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend failure.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Record serialization failed.
    #[error("record serialization failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Record deserialization failed.
    #[error("record deserialization failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Channel is absent, expired or torn down.
    #[error("channel not found: {channel}")]
    NotFound {
        /// The channel id that was not found.
        channel: String,
    },

    /// `If-Match` tag does not match the current version.
    #[error("version mismatch, current version is {current}")]
    Conflict {
        /// Version the caller should resynchronize to.
        current: ETag,
    },

    /// A third distinct client tried to write to a channel.
    #[error("channel {channel} already has two participants")]
    ThirdParticipant {
        /// The channel id.
        channel: String,
    },

    /// Every CAS attempt lost a race against concurrent updates.
    #[error("gave up after {attempts} contended updates")]
    Contention {
        /// Number of attempts made.
        attempts: usize,
    },

    /// No free channel id was found.
    #[error("no free channel id after {attempts} attempts")]
    IdSpaceExhausted {
        /// Number of ids drawn.
        attempts: usize,
    },
}

/// Request-level errors, each mapped to one HTTP status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Malformed identifier, empty report or protocol violation (400).
    #[error("bad request: {reason}")]
    BadRequest {
        /// Reason for rejection.
        reason: String,
    },

    /// Unknown path, unknown or torn-down channel (404).
    #[error("not found")]
    NotFound,

    /// Known path, unsupported method (405).
    #[error("method not allowed")]
    MethodNotAllowed,

    /// `If-Match` mismatch (412); carries the current version.
    #[error("precondition failed, current version is {current}")]
    PreconditionFailed {
        /// Version the caller should resynchronize to.
        current: ETag,
    },

    /// Caller IP is blacklisted (403).
    #[error("forbidden")]
    Forbidden,

    /// Backend unavailable or overloaded (503).
    #[error("service unavailable: {reason}")]
    ServiceUnavailable {
        /// Reason for the failure.
        reason: String,
    },
}

impl ProtocolError {
    /// Shorthand for [`ProtocolError::BadRequest`].
    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::BadRequest {
            reason: reason.into(),
        }
    }
}

impl From<kx_types::TypesError> for ProtocolError {
    fn from(err: kx_types::TypesError) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl From<StoreError> for ProtocolError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => Self::NotFound,
            StoreError::Conflict { current } => Self::PreconditionFailed { current },
            StoreError::ThirdParticipant { .. } => {
                Self::bad_request("channel already has two participants")
            }
            other => Self::ServiceUnavailable {
                reason: other.to_string(),
            },
        }
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
