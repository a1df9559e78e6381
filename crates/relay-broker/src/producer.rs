use std::sync::Arc;
use std::time::{Duration, Instant};

use relay_core::{OutboundQuestion, Properties};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::delivery::{DeliveryAck, DeliveryClient, DeliveryReceipt, OutboundRecord};
use crate::error::{BrokerError, DeliveryFailure};
use crate::kafka::KafkaDeliveryClient;
use crate::registry::{RegistrySettings, SchemaRegistryClient};
use crate::schema::SchemaBinding;

#[derive(Clone, Debug)]
pub struct ProducerConfig {
    /// Upper bound on waiting for one acknowledgment. `connect` also uses it
    /// as `message.timeout.ms` when the broker properties leave that unset,
    /// and waits for the broker's own timeout report past it.
    pub delivery_timeout: Duration,
    /// How long `flush` waits for in-flight messages.
    pub flush_timeout: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            delivery_timeout: Duration::from_secs(30),
            flush_timeout: Duration::from_secs(10),
        }
    }
}

/// Publishes question records to a fixed topic and waits for the broker's
/// acknowledgment of each one.
pub struct QuestionProducer {
    binding: SchemaBinding,
    client: Arc<dyn DeliveryClient>,
    config: ProducerConfig,
}

impl QuestionProducer {
    pub fn new(binding: SchemaBinding, client: Arc<dyn DeliveryClient>, config: ProducerConfig) -> Self {
        Self {
            binding,
            client,
            config,
        }
    }

    /// Bind schemas with the registry and open a Kafka producer.
    ///
    /// Registry problems surface here as `RegistryUnavailable`, before any
    /// message is published.
    pub async fn connect(
        broker_props: &Properties,
        registry: &RegistrySettings,
        topic: &str,
        config: ProducerConfig,
    ) -> Result<Self, BrokerError> {
        info!(topic, "binding schemas");
        let registry = SchemaRegistryClient::new(registry)?;
        let binding = SchemaBinding::bind(&registry, topic).await?;

        let client = KafkaDeliveryClient::new(broker_props, config.delivery_timeout)?;
        let config = ProducerConfig {
            delivery_timeout: client.ack_wait(),
            ..config
        };
        info!(
            topic,
            message_timeout_ms = client.message_timeout().as_millis() as u64,
            "broker producer created"
        );
        Ok(Self::new(binding, Arc::new(client), config))
    }

    pub fn topic(&self) -> &str {
        self.binding.topic()
    }

    /// Publish the key and value records for one question.
    pub async fn publish_question(&self, question: &OutboundQuestion) -> Result<DeliveryReceipt, BrokerError> {
        self.publish(&question.key, &question.value).await
    }

    /// Encode both records, hand them to the broker client and wait for the
    /// delivery outcome. Encoding failures return before anything is sent.
    pub async fn publish<K, V>(&self, key: &K, value: &V) -> Result<DeliveryReceipt, BrokerError>
    where
        K: Serialize + ?Sized,
        V: Serialize + ?Sized,
    {
        let key = self.binding.key().encode(key)?;
        let value = self.binding.value().encode(value)?;

        let (ack, rx) = DeliveryAck::channel();
        let started = Instant::now();
        self.client.send(
            OutboundRecord {
                topic: self.binding.topic().to_owned(),
                key,
                value,
            },
            ack,
        );

        let outcome = match tokio::time::timeout(self.config.delivery_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(DeliveryFailure::Abandoned),
            Err(_) => Err(DeliveryFailure::TimedOut(self.config.delivery_timeout)),
        };

        match outcome {
            Ok(receipt) => {
                debug!(
                    topic = self.binding.topic(),
                    partition = receipt.partition,
                    offset = receipt.offset,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "publish acknowledged"
                );
                Ok(receipt)
            }
            Err(cause) => {
                warn!(topic = self.binding.topic(), %cause, "publish failed");
                Err(BrokerError::delivery(cause))
            }
        }
    }

    /// Drain in-flight messages. Best-effort: logs what could not be drained.
    pub fn flush(&self) {
        info!(topic = self.binding.topic(), "flushing producer");
        let remaining = self.client.flush(self.config.flush_timeout);
        if remaining > 0 {
            warn!(remaining, "producer flush left messages undelivered");
        } else {
            info!("producer flushed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchemaError;
    use crate::mock::{MockDelivery, MockDeliveryClient};
    use relay_core::SessionId;

    fn producer(mock: Arc<MockDeliveryClient>, delivery_timeout: Duration) -> QuestionProducer {
        QuestionProducer::new(
            SchemaBinding::with_ids("customer_questions", 1, 2).unwrap(),
            mock,
            ProducerConfig {
                delivery_timeout,
                flush_timeout: Duration::from_millis(50),
            },
        )
    }

    fn question(id: &str) -> OutboundQuestion {
        OutboundQuestion::for_session(&SessionId::from_raw(id), "hi", "")
    }

    #[tokio::test]
    async fn publish_hands_encoded_records_to_client() {
        let mock = Arc::new(MockDeliveryClient::default());
        let p = producer(Arc::clone(&mock), Duration::from_secs(5));

        let receipt = p.publish_question(&question("abc")).await.unwrap();
        assert_eq!(receipt.offset, 0);

        let sent = mock.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "customer_questions");
        assert_eq!(sent[0].key, vec![0, 0, 0, 0, 1, 6, b'a', b'b', b'c']);
        assert_eq!(&sent[0].value[..5], &[0, 0, 0, 0, 2]);
    }

    #[tokio::test]
    async fn schema_violation_never_reaches_client() {
        #[derive(Serialize)]
        struct BadKey {
            key: bool,
        }
        let mock = Arc::new(MockDeliveryClient::default());
        let p = producer(Arc::clone(&mock), Duration::from_secs(5));

        let err = p
            .publish(&BadKey { key: true }, &question("abc").value)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Schema(SchemaError::Violation(_))));
        assert!(mock.sent().is_empty());
    }

    #[tokio::test]
    async fn broker_rejection_is_delivery_failed() {
        let mock = Arc::new(MockDeliveryClient::new(vec![MockDelivery::Reject(
            "Broker: Topic authorization failed".into(),
        )]));
        let p = producer(mock, Duration::from_secs(5));

        let err = p.publish_question(&question("abc")).await.unwrap_err();
        match err {
            BrokerError::DeliveryFailed {
                cause: DeliveryFailure::Rejected(reason),
            } => assert!(reason.contains("authorization")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_callback_is_abandoned() {
        let mock = Arc::new(MockDeliveryClient::new(vec![MockDelivery::Drop]));
        let p = producer(mock, Duration::from_secs(5));

        let err = p.publish_question(&question("abc")).await.unwrap_err();
        assert!(matches!(
            err,
            BrokerError::DeliveryFailed {
                cause: DeliveryFailure::Abandoned
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_callback_times_out() {
        let mock = Arc::new(MockDeliveryClient::new(vec![MockDelivery::Hold]));
        let p = producer(Arc::clone(&mock), Duration::from_secs(30));

        let err = p.publish_question(&question("abc")).await.unwrap_err();
        assert!(matches!(
            err,
            BrokerError::DeliveryFailed {
                cause: DeliveryFailure::TimedOut(_)
            }
        ));
        // Late resolution after the caller gave up is harmless.
        mock.release_held();
    }

    #[tokio::test]
    async fn concurrent_publishes_each_get_one_outcome() {
        let mock = Arc::new(MockDeliveryClient::new(vec![
            MockDelivery::Ack,
            MockDelivery::Reject("x".into()),
            MockDelivery::Ack,
            MockDelivery::Drop,
        ]));
        let p = Arc::new(producer(Arc::clone(&mock), Duration::from_secs(5)));

        let mut handles = Vec::new();
        for i in 0..4 {
            let p = Arc::clone(&p);
            handles.push(tokio::spawn(async move {
                p.publish_question(&question(&format!("s{i}"))).await.is_ok()
            }));
        }
        let mut ok = 0;
        for h in handles {
            if h.await.unwrap() {
                ok += 1;
            }
        }
        assert_eq!(ok, 2);
        assert_eq!(mock.sent().len(), 4);
    }

    #[tokio::test]
    async fn flush_uses_configured_timeout() {
        let mock = Arc::new(MockDeliveryClient::default());
        let p = producer(Arc::clone(&mock), Duration::from_secs(5));
        p.flush();
        assert_eq!(mock.flushes(), vec![Duration::from_millis(50)]);
    }

    #[tokio::test]
    async fn connect_fails_without_registry_url() {
        let err = QuestionProducer::connect(
            &Properties::new(),
            &RegistrySettings::default(),
            "customer_questions",
            ProducerConfig::default(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(
            err,
            BrokerError::Schema(SchemaError::RegistryUnavailable(_))
        ));
    }
}
