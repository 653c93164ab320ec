//! # kx-types
//!
//! Shared types for the keyexchange channel relay.
//!
//! Both the relay and its clients agree on these:
//! - [`ChannelId`] - short random identifier of a relay channel
//! - [`ClientId`] - opaque fixed-length token a participant sends on every call
//! - [`ETag`] - content-derived version token used for optimistic concurrency
//! - [`headers`] - HTTP header names of the relay protocol
//! - [`TypesError`] - validation errors

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod etag;
pub mod headers;
mod ids;

pub use error::TypesError;
pub use etag::ETag;
pub use ids::{ChannelId, ClientId, CHANNEL_ID_ALPHABET, CLIENT_ID_LENGTH};
