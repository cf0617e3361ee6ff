//! Event bus between the observers and the coordinator.
//!
//! Single consumer, per-source FIFO. Cross-chain ordering is NOT provided
//! and the coordinator must not assume any.

use tokio::sync::mpsc;

use crate::error::RelayerError;
use crate::event::ChainEvent;

pub const DEFAULT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct BusSender {
    tx: mpsc::Sender<ChainEvent>,
}

#[derive(Debug)]
pub struct BusReceiver {
    rx: mpsc::Receiver<ChainEvent>,
}

pub fn channel(capacity: usize) -> (BusSender, BusReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (BusSender { tx }, BusReceiver { rx })
}

impl BusSender {
    /// Blocks the publishing observer when the coordinator falls behind;
    /// backpressure instead of unbounded buffering.
    pub async fn publish(&self, event: ChainEvent) -> Result<(), RelayerError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| RelayerError::Other("event bus closed".into()))
    }
}

impl BusReceiver {
    /// Next event, or None once every observer has shut down.
    pub async fn next(&mut self) -> Option<ChainEvent> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Chain, EventMeta};
    use chrono::Utc;

    fn refunded(log_index: u64) -> ChainEvent {
        ChainEvent::Refunded {
            meta: EventMeta {
                chain: Chain::Evm,
                contract_id: format!("0x{}", hex::encode([0xaa; 32])),
                tx_hash: format!("0x{}", hex::encode([0x11; 32])),
                log_index,
                position: 5,
                observed_at: Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn test_fifo_per_publisher() {
        let (tx, mut rx) = channel(8);
        tx.publish(refunded(0)).await.unwrap();
        tx.publish(refunded(1)).await.unwrap();
        assert_eq!(rx.next().await.unwrap().meta().log_index, 0);
        assert_eq!(rx.next().await.unwrap().meta().log_index, 1);
    }

    #[tokio::test]
    async fn test_receiver_ends_when_senders_drop() {
        let (tx, mut rx) = channel(8);
        drop(tx);
        assert!(rx.next().await.is_none());
    }
}
