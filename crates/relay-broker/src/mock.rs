use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;

use crate::delivery::{DeliveryAck, DeliveryClient, DeliveryReceipt, OutboundRecord};
use crate::error::DeliveryFailure;

/// What the mock does with the next record it receives.
#[derive(Clone, Debug)]
pub enum MockDelivery {
    /// Acknowledge on a separate thread, like a broker callback.
    Ack,
    /// Report a broker-side rejection.
    Reject(String),
    /// Keep the ack and never resolve it.
    Hold,
    /// Drop the ack without resolving it.
    Drop,
}

/// In-memory [`DeliveryClient`] for deterministic tests without a broker.
///
/// Outcomes are consumed in order from the script; once it is empty every
/// record is acknowledged.
pub struct MockDeliveryClient {
    script: Mutex<VecDeque<MockDelivery>>,
    sent: Mutex<Vec<OutboundRecord>>,
    held: Mutex<Vec<DeliveryAck>>,
    flushes: Mutex<Vec<Duration>>,
}

impl Default for MockDeliveryClient {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl MockDeliveryClient {
    pub fn new(script: Vec<MockDelivery>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            sent: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
            flushes: Mutex::new(Vec::new()),
        }
    }

    /// Every record handed to `send`, in order.
    pub fn sent(&self) -> Vec<OutboundRecord> {
        self.sent.lock().clone()
    }

    pub fn flushes(&self) -> Vec<Duration> {
        self.flushes.lock().clone()
    }

    /// Resolve all held acks successfully.
    pub fn release_held(&self) {
        for ack in self.held.lock().drain(..) {
            ack.succeed(DeliveryReceipt {
                partition: 0,
                offset: -1,
            });
        }
    }
}

impl DeliveryClient for MockDeliveryClient {
    fn send(&self, record: OutboundRecord, ack: DeliveryAck) {
        let offset = {
            let mut sent = self.sent.lock();
            sent.push(record);
            sent.len() as i64 - 1
        };
        let behavior = self.script.lock().pop_front().unwrap_or(MockDelivery::Ack);
        match behavior {
            MockDelivery::Ack => {
                std::thread::spawn(move || {
                    ack.succeed(DeliveryReceipt {
                        partition: 0,
                        offset,
                    })
                });
            }
            MockDelivery::Reject(reason) => ack.fail(DeliveryFailure::Rejected(reason)),
            MockDelivery::Hold => self.held.lock().push(ack),
            MockDelivery::Drop => drop(ack),
        }
    }

    fn flush(&self, timeout: Duration) -> usize {
        self.flushes.lock().push(timeout);
        self.held.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> OutboundRecord {
        OutboundRecord {
            topic: "t".into(),
            key: vec![1],
            value: vec![2],
        }
    }

    #[tokio::test]
    async fn script_then_default_ack() {
        let mock = MockDeliveryClient::new(vec![MockDelivery::Reject("nope".into())]);

        let (ack, rx) = DeliveryAck::channel();
        mock.send(record(), ack);
        assert_eq!(
            rx.await.unwrap(),
            Err(DeliveryFailure::Rejected("nope".into()))
        );

        let (ack, rx) = DeliveryAck::channel();
        mock.send(record(), ack);
        assert_eq!(rx.await.unwrap().unwrap().offset, 1);
        assert_eq!(mock.sent().len(), 2);
    }

    #[tokio::test]
    async fn held_acks_resolve_on_release() {
        let mock = MockDeliveryClient::new(vec![MockDelivery::Hold]);
        let (ack, rx) = DeliveryAck::channel();
        mock.send(record(), ack);
        assert_eq!(mock.flush(Duration::from_millis(1)), 1);

        mock.release_held();
        assert!(rx.await.unwrap().is_ok());
        assert_eq!(mock.flush(Duration::from_millis(1)), 0);
        assert_eq!(mock.flushes().len(), 2);
    }
}
