//! Identifier types for the keyexchange relay.

use crate::TypesError;
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Characters a channel id is drawn from.
pub const CHANNEL_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Length every client identifier must have.
pub const CLIENT_ID_LENGTH: usize = 256;

/// Identifier of a relay channel.
///
/// Short enough for a user to type next to a pairing secret; drawn from
/// the OS random source so ids cannot be predicted from earlier ones.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(String);

impl ChannelId {
    /// Draw a new random ChannelId of `len` characters.
    pub fn random(len: usize) -> Self {
        let mut rng = OsRng;
        let id = (0..len)
            .map(|_| CHANNEL_ID_ALPHABET[rng.gen_range(0..CHANNEL_ID_ALPHABET.len())] as char)
            .collect();
        Self(id)
    }

    /// Parse a ChannelId taken from a request path.
    ///
    /// Anything that could not have been produced by [`ChannelId::random`]
    /// with the same length is rejected.
    pub fn parse(raw: &str, len: usize) -> Result<Self, TypesError> {
        let valid = raw.len() == len && raw.bytes().all(|b| CHANNEL_ID_ALPHABET.contains(&b));
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(TypesError::InvalidChannelId(raw.to_string()))
        }
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.0)
    }
}

/// Opaque identifier a participant attaches to every request.
///
/// The relay never interprets it beyond its length; it only remembers the
/// first two distinct values seen on a channel.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    /// Validate a client identifier taken from a request header.
    pub fn parse(raw: Option<&str>, expected_len: usize) -> Result<Self, TypesError> {
        let raw = raw.ok_or(TypesError::MissingClientId)?;
        let actual = raw.chars().count();
        if actual != expected_len {
            return Err(TypesError::ClientIdLength {
                expected: expected_len,
                actual,
            });
        }
        Ok(Self(raw.to_string()))
    }

    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(8).collect();
        write!(f, "ClientId({prefix}..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_channel_id_has_requested_length() {
        let id = ChannelId::random(4);
        assert_eq!(id.as_str().len(), 4);
        assert!(id.as_str().bytes().all(|b| CHANNEL_ID_ALPHABET.contains(&b)));
    }

    #[test]
    fn random_channel_ids_differ() {
        let a = ChannelId::random(16);
        let b = ChannelId::random(16);
        assert_ne!(a, b);
    }

    #[test]
    fn channel_id_parse_accepts_generated_ids() {
        let id = ChannelId::random(4);
        assert_eq!(ChannelId::parse(id.as_str(), 4).unwrap(), id);
    }

    #[test]
    fn channel_id_parse_rejects_foreign_shapes() {
        assert!(ChannelId::parse("UPER", 4).is_err());
        assert!(ChannelId::parse("o", 4).is_err());
        assert!(ChannelId::parse("boo", 4).is_err());
        assert!(ChannelId::parse("ab-d", 4).is_err());
        assert!(ChannelId::parse("new_channel", 4).is_err());
    }

    #[test]
    fn client_id_requires_exact_length() {
        let ok = "b".repeat(CLIENT_ID_LENGTH);
        assert!(ClientId::parse(Some(&ok), CLIENT_ID_LENGTH).is_ok());

        let short = "e".repeat(CLIENT_ID_LENGTH - 1);
        assert_eq!(
            ClientId::parse(Some(&short), CLIENT_ID_LENGTH),
            Err(TypesError::ClientIdLength {
                expected: CLIENT_ID_LENGTH,
                actual: CLIENT_ID_LENGTH - 1,
            })
        );

        let long = "e".repeat(CLIENT_ID_LENGTH + 1);
        assert!(ClientId::parse(Some(&long), CLIENT_ID_LENGTH).is_err());
        assert!(ClientId::parse(Some("boo"), CLIENT_ID_LENGTH).is_err());
    }

    #[test]
    fn client_id_missing() {
        assert_eq!(
            ClientId::parse(None, CLIENT_ID_LENGTH),
            Err(TypesError::MissingClientId)
        );
    }

    #[test]
    fn client_id_debug_is_truncated() {
        let id = ClientId::parse(Some(&"a".repeat(256)), 256).unwrap();
        assert_eq!(format!("{id:?}"), "ClientId(aaaaaaaa..)");
    }

    #[test]
    fn client_id_serde_roundtrip() {
        let id = ClientId::parse(Some(&"c".repeat(256)), 256).unwrap();
        let bytes = rmp_serde::to_vec(&id).unwrap();
        let restored: ClientId = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(id, restored);
    }
}
