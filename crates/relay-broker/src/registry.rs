//! Confluent-compatible schema registry client.
//!
//! Only registration is needed: the relay writes with fixed schemas and
//! never reads messages back.

use std::time::Duration;

use relay_core::Properties;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::SchemaError;

const CONTENT_TYPE: &str = "application/vnd.schemaregistry.v1+json";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings read from the registry properties file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistrySettings {
    pub url: Option<String>,
    pub basic_auth: Option<(String, String)>,
    pub timeout: Option<Duration>,
}

impl RegistrySettings {
    /// Recognised keys: `url` (first of a comma-separated list),
    /// `basic.auth.user.info` (`user:password`) and `request.timeout.ms`.
    pub fn from_properties(props: &Properties) -> Self {
        let url = props
            .get("url")
            .and_then(|urls| urls.split(',').map(str::trim).find(|u| !u.is_empty()))
            .map(|u| u.trim_end_matches('/').to_owned());
        let basic_auth = props
            .get("basic.auth.user.info")
            .and_then(|info| info.split_once(':'))
            .map(|(user, pass)| (user.to_owned(), pass.to_owned()));
        let timeout = props
            .get("request.timeout.ms")
            .and_then(|ms| ms.parse::<u64>().ok())
            .map(Duration::from_millis);
        Self {
            url,
            basic_auth,
            timeout,
        }
    }
}

#[derive(Debug, Serialize)]
struct RegisterSchemaRequest<'a> {
    schema: &'a str,
    #[serde(rename = "schemaType")]
    schema_type: &'a str,
}

#[derive(Debug, Deserialize)]
struct RegisterSchemaResponse {
    id: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    message: Option<String>,
}

pub struct SchemaRegistryClient {
    client: Client,
    base_url: String,
    basic_auth: Option<(String, String)>,
}

impl SchemaRegistryClient {
    /// Fails with `RegistryUnavailable` when no URL is configured.
    pub fn new(settings: &RegistrySettings) -> Result<Self, SchemaError> {
        let base_url = settings.url.clone().ok_or_else(|| {
            SchemaError::RegistryUnavailable("no schema registry url configured".into())
        })?;
        let client = Client::builder()
            .timeout(settings.timeout.unwrap_or(DEFAULT_TIMEOUT))
            .build()
            .map_err(|e| SchemaError::RegistryUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            basic_auth: settings.basic_auth.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Register an Avro schema under `subject`, returning its global id.
    /// Registering an identical schema again returns the existing id.
    pub async fn register(&self, subject: &str, schema: &str) -> Result<u32, SchemaError> {
        let url = format!("{}/subjects/{}/versions", self.base_url, subject);
        let mut request = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .json(&RegisterSchemaRequest {
                schema,
                schema_type: "AVRO",
            });
        if let Some((user, pass)) = &self.basic_auth {
            request = request.basic_auth(user, Some(pass));
        }

        let response = request
            .send()
            .await
            .map_err(|e| SchemaError::RegistryUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(parse_error(status, &body));
        }

        let result: RegisterSchemaResponse = response
            .json()
            .await
            .map_err(|e| SchemaError::RegistryUnavailable(format!("bad registry response: {e}")))?;

        tracing::info!(subject, schema_id = result.id, "registered schema");
        Ok(result.id)
    }
}

fn parse_error(status: StatusCode, body: &str) -> SchemaError {
    let message = serde_json::from_str::<ErrorResponse>(body)
        .ok()
        .and_then(|e| e.message)
        .unwrap_or_else(|| body.to_owned());
    if status.is_server_error() {
        SchemaError::RegistryUnavailable(format!("{status}: {message}"))
    } else {
        SchemaError::Registry {
            status: status.as_u16(),
            message,
        }
    }
}
