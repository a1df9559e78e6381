use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use relay_broker::{ProducerConfig, QuestionProducer, RegistrySettings};
use relay_core::config::read_properties;
use relay_core::ConfigKind;
use relay_server::ServerConfig;
use relay_telemetry::TelemetryConfig;

#[derive(Debug, Parser)]
#[command(name = "relay", about = "Question/answer relay between browser chat and Kafka")]
struct Args {
    /// HTTP listen port.
    #[arg(long, env = "RELAY_PORT", default_value_t = 8001)]
    port: u16,

    /// Kafka client properties file.
    #[arg(long, env = "RELAY_CLIENT_CONFIG", default_value = "client.properties")]
    client_config: PathBuf,

    /// Schema-registry properties file.
    #[arg(long, env = "RELAY_SR_CONFIG", default_value = "sr.properties")]
    sr_config: PathBuf,

    /// Topic questions are published to.
    #[arg(long, env = "CUSTOMER_QUESTIONS_TOPIC", default_value = "customer_questions")]
    topic: String,

    /// Prefix for the callback URL attached to each question.
    #[arg(long, env = "CALLBACK_BASE_URL", default_value = "")]
    callback_base_url: String,

    /// Broker delivery timeout, used as `message.timeout.ms` unless the
    /// client properties set it.
    #[arg(long, env = "RELAY_DELIVERY_TIMEOUT_SECS", default_value_t = 30)]
    delivery_timeout_secs: u64,

    /// Emit JSON log lines.
    #[arg(long, env = "RELAY_LOG_JSON", default_value_t = true, action = clap::ArgAction::Set)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let telemetry = relay_telemetry::init_telemetry(TelemetryConfig {
        json: args.log_json,
        ..Default::default()
    });

    tracing::info!(topic = %args.topic, "starting relay");

    let config = ServerConfig {
        port: args.port,
        callback_base_url: args.callback_base_url.clone(),
        ..Default::default()
    };
    let handle = relay_server::start(config, telemetry.metrics())
        .await
        .context("failed to start HTTP server")?;

    tracing::info!(port = handle.port(), "relay server ready");

    let producer = match connect_producer(&args).await {
        Ok(producer) => Arc::new(producer),
        Err(e) => {
            tracing::error!(error = %e, "producer initialization failed");
            handle.shutdown().await;
            return Err(e);
        }
    };
    handle.install_producer(Arc::clone(&producer));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    tokio::task::spawn_blocking(move || producer.flush())
        .await
        .context("producer flush task panicked")?;

    Ok(())
}

async fn connect_producer(args: &Args) -> anyhow::Result<QuestionProducer> {
    let broker_props = read_properties(&args.client_config, ConfigKind::Broker)?;
    let sr_props = read_properties(&args.sr_config, ConfigKind::SchemaRegistry)?;
    let registry = RegistrySettings::from_properties(&sr_props);

    let producer_config = ProducerConfig {
        delivery_timeout: Duration::from_secs(args.delivery_timeout_secs),
        ..Default::default()
    };
    let producer = QuestionProducer::connect(&broker_props, &registry, &args.topic, producer_config)
        .await
        .with_context(|| format!("failed to bind producer for topic {}", args.topic))?;
    Ok(producer)
}
