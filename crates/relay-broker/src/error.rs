use std::time::Duration;

/// Failures binding schemas or encoding records against them.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SchemaError {
    /// Record does not match its bound schema. Not retryable.
    #[error("schema violation: {0}")]
    Violation(String),

    /// Registry could not be reached or is not configured.
    #[error("schema registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// Registry answered but refused the request.
    #[error("schema registry error {status}: {message}")]
    Registry { status: u16, message: String },
}

impl SchemaError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Violation(_) => "schema_violation",
            Self::RegistryUnavailable(_) => "registry_unavailable",
            Self::Registry { .. } => "registry_error",
        }
    }
}

/// Why a handed-off message was not acknowledged.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryFailure {
    /// Broker or local client refused the message.
    #[error("rejected: {0}")]
    Rejected(String),

    /// No acknowledgment arrived in time.
    #[error("no acknowledgment within {0:?}")]
    TimedOut(Duration),

    /// The delivery callback was dropped without reporting an outcome.
    #[error("delivery callback abandoned")]
    Abandoned,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("delivery failed: {cause}")]
    DeliveryFailed { cause: DeliveryFailure },

    #[error("broker client configuration: {0}")]
    Config(String),
}

impl BrokerError {
    pub fn delivery(cause: DeliveryFailure) -> Self {
        Self::DeliveryFailed { cause }
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Schema(e) => e.error_kind(),
            Self::DeliveryFailed { cause } => match cause {
                DeliveryFailure::Rejected(_) => "delivery_rejected",
                DeliveryFailure::TimedOut(_) => "delivery_timed_out",
                DeliveryFailure::Abandoned => "delivery_abandoned",
            },
            Self::Config(_) => "config",
        }
    }
}
