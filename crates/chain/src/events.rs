//! Chain events and the sink boundary toward collaborators.

use pulse_consensus::BlockHash;
use tokio::sync::broadcast;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainEvent {
    HeaderAdded {
        hash: BlockHash,
        height: u32,
    },
    TipChanged {
        hash: BlockHash,
        height: u32,
    },
    Reorg {
        from: BlockHash,
        to: BlockHash,
        common: BlockHash,
        depth: u32,
    },
}

/// Outbound event boundary. Publishing never fails from the chain's point
/// of view; a sink that buffers or drops does so on its own account.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: ChainEvent);
}

/// Sink that discards everything; the default until a collaborator attaches.
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: ChainEvent) {}
}

/// Fan-out sink over a tokio broadcast channel. Slow subscribers lag and
/// lose old events rather than backpressuring the chain service.
pub struct BroadcastSink {
    tx: broadcast::Sender<ChainEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: ChainEvent) {
        // Send only errors when there is no subscriber; that is fine.
        let _ = self.tx.send(event);
    }
}
