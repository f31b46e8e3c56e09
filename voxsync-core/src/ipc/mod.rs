//! Event payloads the engine publishes to hosts and network peers.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host can
//! forward them unchanged over its own event bus or replication channel.

pub mod events;
