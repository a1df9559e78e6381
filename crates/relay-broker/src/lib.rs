pub mod delivery;
pub mod error;
pub mod kafka;
pub mod mock;
pub mod producer;
pub mod registry;
pub mod schema;

pub use delivery::{DeliveryAck, DeliveryClient, DeliveryReceipt, OutboundRecord};
pub use error::{BrokerError, DeliveryFailure, SchemaError};
pub use kafka::KafkaDeliveryClient;
pub use producer::{ProducerConfig, QuestionProducer};
pub use registry::{RegistrySettings, SchemaRegistryClient};
pub use schema::{RecordEncoder, SchemaBinding};
