//! Bridge from callback-style broker acknowledgments to an awaited outcome.
//!
//! Every publish creates one [`DeliveryAck`]/receiver pair. The broker client
//! owns the ack and resolves it from whatever thread its delivery callback
//! runs on; the publishing task awaits the receiver. Resolution consumes the
//! ack, and an ack dropped unresolved reports [`DeliveryFailure::Abandoned`],
//! so each publish observes exactly one outcome.

use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::DeliveryFailure;

/// Where the broker stored an acknowledged message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub partition: i32,
    pub offset: i64,
}

pub type DeliveryOutcome = Result<DeliveryReceipt, DeliveryFailure>;

/// Serialized message handed to a [`DeliveryClient`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundRecord {
    pub topic: String,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Single-resolution completion handle for one message.
#[derive(Debug)]
pub struct DeliveryAck {
    tx: Option<oneshot::Sender<DeliveryOutcome>>,
}

impl DeliveryAck {
    /// Create an ack and the receiver its outcome arrives on.
    pub fn channel() -> (Self, oneshot::Receiver<DeliveryOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Report the outcome. Safe to call from any thread.
    pub fn resolve(mut self, outcome: DeliveryOutcome) {
        if let Some(tx) = self.tx.take() {
            // Receiver gone means the publisher already gave up waiting.
            let _ = tx.send(outcome);
        }
    }

    pub fn succeed(self, receipt: DeliveryReceipt) {
        self.resolve(Ok(receipt));
    }

    pub fn fail(self, failure: DeliveryFailure) {
        self.resolve(Err(failure));
    }
}

impl Drop for DeliveryAck {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(DeliveryFailure::Abandoned));
        }
    }
}

/// Asynchronous, callback-driven broker client.
///
/// `send` must not block on delivery: it queues the record and arranges for
/// `ack` to be resolved when the broker answers (or immediately if the record
/// cannot be queued).
pub trait DeliveryClient: Send + Sync {
    fn send(&self, record: OutboundRecord, ack: DeliveryAck);

    /// Wait up to `timeout` for queued records to be delivered. Returns the
    /// number still in flight afterwards.
    fn flush(&self, timeout: Duration) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_delivers_outcome() {
        let (ack, rx) = DeliveryAck::channel();
        ack.succeed(DeliveryReceipt {
            partition: 3,
            offset: 42,
        });
        assert_eq!(
            rx.await.unwrap(),
            Ok(DeliveryReceipt {
                partition: 3,
                offset: 42
            })
        );
    }

    #[tokio::test]
    async fn dropped_ack_reports_abandoned() {
        let (ack, rx) = DeliveryAck::channel();
        drop(ack);
        assert_eq!(rx.await.unwrap(), Err(DeliveryFailure::Abandoned));
    }

    #[tokio::test]
    async fn resolves_from_foreign_thread() {
        let (ack, rx) = DeliveryAck::channel();
        std::thread::spawn(move || {
            ack.fail(DeliveryFailure::Rejected("Broker: Message size too large".into()));
        });
        assert_eq!(
            rx.await.unwrap(),
            Err(DeliveryFailure::Rejected("Broker: Message size too large".into()))
        );
    }

    #[test]
    fn resolve_after_receiver_dropped_is_silent() {
        let (ack, rx) = DeliveryAck::channel();
        drop(rx);
        ack.fail(DeliveryFailure::Abandoned);
    }
}
