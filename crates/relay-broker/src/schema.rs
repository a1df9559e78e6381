//! Avro schemas for question messages and their registry-bound encoders.

use apache_avro::Schema;
use serde::Serialize;

use crate::error::SchemaError;
use crate::registry::SchemaRegistryClient;

/// Key record: the session id.
pub const KEY_SCHEMA: &str = r#"{
  "type": "record",
  "name": "customer_conversations_key",
  "namespace": "org.apache.flink.avro.generated.record",
  "fields": [
    { "name": "key", "type": "string" }
  ]
}"#;

/// Value record: question text and where to post the answer.
pub const VALUE_SCHEMA: &str = r#"{
  "type": "record",
  "name": "customer_conversations_value",
  "namespace": "org.apache.flink.avro.generated.record",
  "fields": [
    { "name": "input", "type": ["null", "string"], "default": null },
    { "name": "callback_url", "type": ["null", "string"], "default": null }
  ]
}"#;

/// Confluent wire-format magic byte.
const MAGIC_BYTE: u8 = 0;

/// Which half of a message a schema describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageField {
    Key,
    Value,
}

impl MessageField {
    /// Subject under the topic-name strategy.
    pub fn subject(self, topic: &str) -> String {
        match self {
            Self::Key => format!("{topic}-key"),
            Self::Value => format!("{topic}-value"),
        }
    }
}

/// Encodes records against one schema, prefixed with its registry id.
#[derive(Clone, Debug)]
pub struct RecordEncoder {
    schema: Schema,
    schema_id: u32,
    subject: String,
}

impl RecordEncoder {
    pub fn new(schema_str: &str, schema_id: u32, subject: impl Into<String>) -> Result<Self, SchemaError> {
        let schema = Schema::parse_str(schema_str).map_err(|e| SchemaError::Violation(e.to_string()))?;
        Ok(Self {
            schema,
            schema_id,
            subject: subject.into(),
        })
    }

    pub fn schema_id(&self) -> u32 {
        self.schema_id
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Validate `record` against the schema and encode it in the Confluent
    /// wire format: magic byte, big-endian schema id, Avro binary datum.
    pub fn encode<T: Serialize + ?Sized>(&self, record: &T) -> Result<Vec<u8>, SchemaError> {
        let value = apache_avro::to_value(record)
            .map_err(|e| SchemaError::Violation(format!("{}: {e}", self.subject)))?;
        let datum = apache_avro::to_avro_datum(&self.schema, value)
            .map_err(|e| SchemaError::Violation(format!("{}: {e}", self.subject)))?;

        let mut out = Vec::with_capacity(5 + datum.len());
        out.push(MAGIC_BYTE);
        out.extend_from_slice(&self.schema_id.to_be_bytes());
        out.extend_from_slice(&datum);
        Ok(out)
    }
}

/// Key and value encoders for one topic.
#[derive(Clone, Debug)]
pub struct SchemaBinding {
    topic: String,
    key: RecordEncoder,
    value: RecordEncoder,
}

impl SchemaBinding {
    /// Register both schemas with the registry and build encoders from the
    /// returned ids. Fails eagerly when the registry is unreachable.
    pub async fn bind(registry: &SchemaRegistryClient, topic: &str) -> Result<Self, SchemaError> {
        let key_subject = MessageField::Key.subject(topic);
        let value_subject = MessageField::Value.subject(topic);
        let key_id = registry.register(&key_subject, KEY_SCHEMA).await?;
        let value_id = registry.register(&value_subject, VALUE_SCHEMA).await?;
        Self::with_ids(topic, key_id, value_id)
    }

    /// Build encoders for already-registered schema ids.
    pub fn with_ids(topic: &str, key_id: u32, value_id: u32) -> Result<Self, SchemaError> {
        Ok(Self {
            topic: topic.to_owned(),
            key: RecordEncoder::new(KEY_SCHEMA, key_id, MessageField::Key.subject(topic))?,
            value: RecordEncoder::new(VALUE_SCHEMA, value_id, MessageField::Value.subject(topic))?,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn key(&self) -> &RecordEncoder {
        &self.key
    }

    pub fn value(&self) -> &RecordEncoder {
        &self.value
    }
}
