//! Outbound P2P: wire codec, per-peer sessions, and the sync coordinator.

pub mod coordinator;
pub mod peer_book;
pub mod session;
pub mod wire;
