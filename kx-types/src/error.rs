//! Validation errors for keyexchange types.

use thiserror::Error;

/// Errors raised while validating identifiers received from the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypesError {
    /// Client identifier is absent.
    #[error("missing client identifier")]
    MissingClientId,

    /// Client identifier does not have the protocol length.
    #[error("client identifier must be {expected} characters, got {actual}")]
    ClientIdLength {
        /// Required length.
        expected: usize,
        /// Length received.
        actual: usize,
    },

    /// Channel identifier is not a valid channel id.
    #[error("invalid channel id: {0:?}")]
    InvalidChannelId(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = TypesError::ClientIdLength {
            expected: 256,
            actual: 3,
        };
        assert_eq!(
            err.to_string(),
            "client identifier must be 256 characters, got 3"
        );
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TypesError>();
    }
}
