// Public API for replicas, the relay binary and integration tests

pub mod channel;
pub mod client;
pub mod config;
pub mod draw;
pub mod error;
pub mod frame;
pub mod persist;
pub mod protocol;
pub mod replay;
pub mod replicator;
pub mod roster;
pub mod scrub;
pub mod state;
pub mod types;
pub mod ws;
