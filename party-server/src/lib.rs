//! A server for collaborative prompt-to-image party games.
//!
//! Players connect over WebSockets, group into four letter code sessions,
//! vote for a mini game, and the server then interprets that game's script:
//! a declarative op list driving per-player steps, synchronization barriers
//! and image generation requests against a pool of upstream image servers.

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod engine;
pub mod images;
pub mod lobby;
pub mod script;
pub mod session;
pub mod store;
