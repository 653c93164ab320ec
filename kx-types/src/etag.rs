//! Content-derived version tokens.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Version token of a channel's content.
///
/// Hex SHA-256 of the content, so two writes of the same bytes produce the
/// same tag and any different content produces a different one.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ETag(String);

impl ETag {
    /// Compute the tag of `content`.
    pub fn of(content: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(content)))
    }

    /// Parse a tag from an `If-Match` / `If-None-Match` header value.
    ///
    /// Surrounding quotes and a weak `W/` prefix are ignored. An empty
    /// value means "no tag" and yields `None`.
    pub fn from_header(value: &str) -> Option<Self> {
        let value = value.trim();
        let value = value.strip_prefix("W/").unwrap_or(value);
        let value = value.trim_matches('"');
        if value.is_empty() {
            None
        } else {
            Some(Self(value.to_string()))
        }
    }

    /// Get the tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short: String = self.0.chars().take(12).collect();
        write!(f, "ETag({short})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_content_same_tag() {
        assert_eq!(ETag::of(b"one"), ETag::of(b"one"));
        assert_ne!(ETag::of(b"one"), ETag::of(b"two"));
    }

    #[test]
    fn empty_content_has_a_tag() {
        assert_eq!(ETag::of(b"").as_str().len(), 64);
    }

    #[test]
    fn header_parsing_strips_decoration() {
        let tag = ETag::of(b"xxx");
        let quoted = format!("\"{tag}\"");
        let weak = format!("W/\"{tag}\"");
        assert_eq!(ETag::from_header(tag.as_str()), Some(tag.clone()));
        assert_eq!(ETag::from_header(&quoted), Some(tag.clone()));
        assert_eq!(ETag::from_header(&weak), Some(tag));
    }

    #[test]
    fn empty_header_is_no_tag() {
        assert_eq!(ETag::from_header(""), None);
        assert_eq!(ETag::from_header("\"\""), None);
        assert_eq!(ETag::from_header("  "), None);
    }

    #[test]
    fn debug_truncates_on_char_boundaries() {
        let tag = ETag::of(b"xxx");
        assert_eq!(format!("{tag:?}"), format!("ETag({})", &tag.as_str()[..12]));

        let wide = ETag::from_header("ééééééééééééé").unwrap();
        assert_eq!(format!("{wide:?}"), "ETag(éééééééééééé)");
    }
}
