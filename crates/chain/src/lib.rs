//! The header chain engine: validation, persistence, fork tracking and the
//! read surface consumed by HTTP/WebSocket/webhook collaborators.

use std::fmt;

use pulse_store::StoreError;

pub mod events;
pub mod orphans;
pub mod query;
pub mod service;
pub mod validation;

pub use events::{BroadcastSink, ChainEvent, EventSink, NullSink};
pub use query::{ConfirmationState, MerkleConfirmation};
pub use service::{AcceptOutcome, ChainOptions, ChainService, Clock, SystemClock};
pub use validation::ValidationError;

#[derive(Debug)]
pub enum ChainError {
    Store(StoreError),
    /// A structural invariant did not hold; always a bug or corruption.
    Internal(&'static str),
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::Store(err) => write!(f, "{err}"),
            ChainError::Internal(message) => write!(f, "internal chain error: {message}"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<StoreError> for ChainError {
    fn from(err: StoreError) -> Self {
        ChainError::Store(err)
    }
}
