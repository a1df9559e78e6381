//! librdkafka-backed [`DeliveryClient`].
//!
//! `ThreadedProducer` polls on its own thread and invokes
//! [`ProducerContext::delivery`] there; each message carries its boxed
//! [`DeliveryAck`] as the delivery opaque and the callback resolves it.

use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use rdkafka::util::Timeout;
use rdkafka::ClientContext;
use relay_core::Properties;
use tracing::{debug, warn};

use crate::delivery::{DeliveryAck, DeliveryClient, DeliveryReceipt, OutboundRecord};
use crate::error::{BrokerError, DeliveryFailure};

const MESSAGE_TIMEOUT_KEY: &str = "message.timeout.ms";

/// Extra wait past `message.timeout.ms` for the delivery report to arrive.
pub const ACK_GRACE: Duration = Duration::from_secs(5);

/// Resolves each message's ack from the librdkafka delivery report.
pub struct AckContext {
    message_timeout: Duration,
}

impl ClientContext for AckContext {}

impl ProducerContext for AckContext {
    type DeliveryOpaque = Box<DeliveryAck>;

    fn delivery(&self, result: &DeliveryResult<'_>, ack: Self::DeliveryOpaque) {
        let ack = *ack;
        match result {
            Ok(msg) => {
                debug!(
                    topic = msg.topic(),
                    partition = msg.partition(),
                    offset = msg.offset(),
                    "message delivered"
                );
                ack.succeed(DeliveryReceipt {
                    partition: msg.partition(),
                    offset: msg.offset(),
                });
            }
            Err((err, msg)) => {
                warn!(topic = msg.topic(), error = %err, "message delivery failed");
                ack.fail(delivery_failure(err, self.message_timeout));
            }
        }
    }
}

/// Map a librdkafka error to a delivery failure.
fn delivery_failure(err: &KafkaError, message_timeout: Duration) -> DeliveryFailure {
    match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::MessageTimedOut) => DeliveryFailure::TimedOut(message_timeout),
        _ => DeliveryFailure::Rejected(err.to_string()),
    }
}

/// `message.timeout.ms` from the properties, or `fallback` when unset.
fn message_timeout(props: &Properties, fallback: Duration) -> Duration {
    props
        .get(MESSAGE_TIMEOUT_KEY)
        .and_then(|ms| ms.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(fallback)
}

pub struct KafkaDeliveryClient {
    producer: ThreadedProducer<AckContext>,
    message_timeout: Duration,
}

impl KafkaDeliveryClient {
    /// Create a producer from client properties. Every key is passed to
    /// librdkafka unchanged; unknown keys are a configuration error. When the
    /// properties leave `message.timeout.ms` unset it is set to
    /// `default_message_timeout`.
    pub fn new(props: &Properties, default_message_timeout: Duration) -> Result<Self, BrokerError> {
        let mut config = ClientConfig::new();
        for (key, value) in props {
            config.set(key, value);
        }

        let message_timeout = message_timeout(props, default_message_timeout);
        if !props.contains_key(MESSAGE_TIMEOUT_KEY) {
            config.set(MESSAGE_TIMEOUT_KEY, message_timeout.as_millis().to_string());
        }

        let producer: ThreadedProducer<AckContext> = config
            .create_with_context(AckContext { message_timeout })
            .map_err(|e| BrokerError::Config(e.to_string()))?;

        Ok(Self {
            producer,
            message_timeout,
        })
    }

    pub fn message_timeout(&self) -> Duration {
        self.message_timeout
    }

    /// How long a publisher should wait for the delivery report. librdkafka
    /// reports `MessageTimedOut` itself before this elapses.
    pub fn ack_wait(&self) -> Duration {
        self.message_timeout + ACK_GRACE
    }
}

impl DeliveryClient for KafkaDeliveryClient {
    fn send(&self, record: OutboundRecord, ack: DeliveryAck) {
        let base = BaseRecord::with_opaque_to(&record.topic, Box::new(ack))
            .key(record.key.as_slice())
            .payload(record.value.as_slice());

        if let Err((err, rejected)) = self.producer.send(base) {
            let ack = *rejected.delivery_opaque;
            ack.fail(DeliveryFailure::Rejected(err.to_string()));
        }
    }

    fn flush(&self, timeout: Duration) -> usize {
        if let Err(e) = self.producer.flush(Timeout::After(timeout)) {
            warn!(error = %e, "producer flush incomplete");
        }
        self.producer.in_flight_count().max(0) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn timeout_error_maps_to_timed_out() {
        let err = KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut);
        assert_eq!(
            delivery_failure(&err, Duration::from_secs(5)),
            DeliveryFailure::TimedOut(Duration::from_secs(5))
        );
    }

    #[test]
    fn other_errors_map_to_rejected() {
        let err = KafkaError::MessageProduction(RDKafkaErrorCode::UnknownTopicOrPartition);
        assert!(matches!(
            delivery_failure(&err, Duration::from_secs(5)),
            DeliveryFailure::Rejected(_)
        ));
    }

    #[test]
    fn message_timeout_defaults_to_fallback() {
        let fallback = Duration::from_secs(30);
        assert_eq!(message_timeout(&props(&[]), fallback), fallback);
        assert_eq!(
            message_timeout(&props(&[("message.timeout.ms", "45000")]), fallback),
            Duration::from_secs(45)
        );
    }

    #[test]
    fn ack_wait_follows_message_timeout() {
        let client = KafkaDeliveryClient::new(
            &props(&[("bootstrap.servers", "127.0.0.1:9")]),
            Duration::from_secs(30),
        )
        .unwrap();
        assert_eq!(client.message_timeout(), Duration::from_secs(30));
        assert_eq!(client.ack_wait(), Duration::from_secs(30) + ACK_GRACE);

        let client = KafkaDeliveryClient::new(
            &props(&[
                ("bootstrap.servers", "127.0.0.1:9"),
                ("message.timeout.ms", "120000"),
            ]),
            Duration::from_secs(30),
        )
        .unwrap();
        assert_eq!(client.message_timeout(), Duration::from_secs(120));
        assert_eq!(client.ack_wait(), Duration::from_secs(120) + ACK_GRACE);
    }

    #[test]
    fn unknown_property_is_config_error() {
        let err = KafkaDeliveryClient::new(
            &props(&[
                ("bootstrap.servers", "127.0.0.1:9"),
                ("no.such.property", "1"),
            ]),
            Duration::from_secs(30),
        )
        .err()
        .unwrap();
        assert!(matches!(err, BrokerError::Config(_)));
    }

    #[tokio::test]
    async fn unreachable_broker_times_out_through_callback() {
        let client = KafkaDeliveryClient::new(
            &props(&[("bootstrap.servers", "127.0.0.1:9")]),
            Duration::from_millis(200),
        )
        .unwrap();

        let (ack, rx) = DeliveryAck::channel();
        client.send(
            OutboundRecord {
                topic: "customer_questions".into(),
                key: b"k".to_vec(),
                value: b"v".to_vec(),
            },
            ack,
        );

        let outcome = tokio::time::timeout(Duration::from_secs(10), rx)
            .await
            .expect("delivery callback never ran")
            .unwrap();
        assert_eq!(
            outcome,
            Err(DeliveryFailure::TimedOut(Duration::from_millis(200)))
        );
    }
}
