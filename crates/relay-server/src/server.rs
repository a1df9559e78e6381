use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use parking_lot::RwLock;
use relay_broker::QuestionProducer;
use relay_telemetry::MetricsRecorder;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::registry::SessionRegistry;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Prefix for the `callback_url` sent with each question. Empty for a
    /// relative `/answers/{id}` path.
    pub callback_base_url: String,
    /// How long a reconnect waits for the replaced stream to exit.
    pub retire_timeout: Duration,
    /// SSE keep-alive comment interval.
    pub keep_alive: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8001,
            callback_base_url: String::new(),
            retire_timeout: Duration::from_secs(5),
            keep_alive: Duration::from_secs(15),
        }
    }
}

/// Producer installed once startup has bound the schema registry.
#[derive(Default)]
pub struct ProducerSlot {
    inner: RwLock<Option<Arc<QuestionProducer>>>,
}

impl ProducerSlot {
    pub fn install(&self, producer: Arc<QuestionProducer>) {
        *self.inner.write() = Some(producer);
    }

    pub fn get(&self) -> Option<Arc<QuestionProducer>> {
        self.inner.read().clone()
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionRegistry>,
    pub producer: Arc<ProducerSlot>,
    pub metrics: Arc<MetricsRecorder>,
    pub callback_base: Arc<str>,
    pub keep_alive: Duration,
}

impl AppState {
    pub fn new(config: &ServerConfig, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            sessions: Arc::new(SessionRegistry::new(
                config.retire_timeout,
                Arc::clone(&metrics),
            )),
            producer: Arc::new(ProducerSlot::default()),
            metrics,
            callback_base: config.callback_base_url.as_str().into(),
            keep_alive: config.keep_alive,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/chat/{session_id}", get(handlers::open_stream))
        .route("/questions/{session_id}", post(handlers::submit_question))
        .route("/answers/{session_id}", post(handlers::receive_answer))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and start serving. Returns a handle for installing the producer and
/// shutting down.
pub async fn start(config: ServerConfig, metrics: Arc<MetricsRecorder>) -> Result<ServerHandle, std::io::Error> {
    let state = AppState::new(&config, metrics);
    let router = build_router(state.clone());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "relay server started");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(signal.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok(ServerHandle {
        local_addr,
        state,
        shutdown,
        server,
    })
}

/// Handle returned by `start()`: keeps the server task and shared state.
pub struct ServerHandle {
    local_addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.state.sessions
    }

    /// Make the ingress endpoint live.
    pub fn install_producer(&self, producer: Arc<QuestionProducer>) {
        self.state.producer.install(producer);
        tracing::info!("producer installed");
    }

    pub fn producer(&self) -> Option<Arc<QuestionProducer>> {
        self.state.producer.get()
    }

    /// Close every open stream, stop accepting connections and wait for the
    /// server task to finish.
    pub async fn shutdown(self) {
        let closed = self.state.sessions.close_all();
        tracing::info!(closed, "closing streams");
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "server task ended abnormally");
        }
    }
}
