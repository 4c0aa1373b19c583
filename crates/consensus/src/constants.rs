//! Protocol-level constants.

/// Protocol version advertised in our `version` message.
pub const PROTOCOL_VERSION: i32 = 70015;

/// Oldest protocol version we keep talking to.
pub const MIN_PEER_PROTOCOL_VERSION: i32 = 70001;

/// Service bit for a full node able to serve headers.
pub const NODE_NETWORK: u64 = 1;

/// Upper bound on headers returned for a single `getheaders`.
pub const MAX_HEADERS_RESULTS: usize = 2000;

/// Upper bound on locator hashes accepted in `getheaders`.
pub const MAX_LOCATOR_HASHES: usize = 101;

/// Upper bound on entries in an `addr` payload.
pub const MAX_ADDR_RESULTS: usize = 1000;

/// Timestamps may not exceed wall clock by more than this many seconds.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;

/// Misbehavior score at which a peer is banned.
pub const BAN_SCORE_THRESHOLD: u32 = 100;
