//! # keyexchange-relay
//!
//! Channel relay for two-party key-exchange handshakes.
//!
//! Two clients that want to run a key-exchange protocol but cannot reach
//! each other directly meet on a short-lived channel:
//! - one client allocates a channel and passes its id out of band
//! - both clients take turns writing and polling the channel content
//! - every write carries an `If-Match` version so no message is lost
//! - the channel closes after a few reads, on a third participant or on
//!   a client report
//!
//! The relay never interprets the payload.
//!
//! ## Architecture
//!
//! ```text
//! Client A ──┐                      ┌── Client B
//!            │   HTTP (GET / PUT)   │
//!        ┌───┴──────────────────────┴───┐
//!        │  admission (blacklist/limit) │
//!        │  protocol ──► channel store  │
//!        └──────────────┬───────────────┘
//!                       │ get/set/add/cas/incr/delete
//!                ┌──────┴──────┐
//!                │ Redis / mem │  shared by every instance
//!                └─────────────┘
//! ```
//!
//! ## Endpoints
//!
//! - `GET /new_channel` → channel id
//! - `GET /<id>`, `PUT /<id>` → exchange
//! - `POST /report` → client-side failure report
//! - `GET /` → backend probe, then redirect

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod blacklist;
pub mod channels;
pub mod config;
pub mod error;
pub mod http;
pub mod limits;
pub mod protocol;
pub mod report;
pub mod server;
pub mod sync;
