//! HTTP endpoints: stream attach, question ingress, answer callback, health and metrics.

use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use relay_core::{AnswerItem, OutboundQuestion, SessionId, SubmitQuestion};
use serde_json::json;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::server::AppState;
use crate::stream::answer_events;

/// `GET /chat/{id}`: attach (or replace) the session's stream.
pub async fn open_stream(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let session = state.sessions.attach(SessionId::from(id)).await;
    Sse::new(answer_events(session)).keep_alive(KeepAlive::new().interval(state.keep_alive))
}

/// `POST /questions/{id}`: publish a question and confirm broker receipt.
pub async fn submit_question(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<SubmitQuestion>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) =
        body.map_err(|e| ApiError::BadRequest(format!("Malformed question payload: {}", e.body_text())))?;
    let producer = state
        .producer
        .get()
        .ok_or_else(|| ApiError::ServiceUnavailable("Producer not available.".into()))?;

    let id = SessionId::from(id);
    let question = OutboundQuestion::for_session(&id, body.into_text(), &state.callback_base);

    let started = Instant::now();
    let result = producer.publish_question(&question).await;
    state.metrics.histogram_observe(
        "relay.publish.duration_ms",
        &[],
        started.elapsed().as_secs_f64() * 1000.0,
    );

    match result {
        Ok(_) => {
            state.metrics.counter_inc("relay.questions.published", &[], 1);
            info!(session_id = %id, topic = producer.topic(), "question published");
            Ok((
                StatusCode::ACCEPTED,
                Json(json!({ "message": "Question accepted for processing." })),
            ))
        }
        Err(e) => {
            state
                .metrics
                .counter_inc("relay.questions.failed", &[("reason", e.error_kind())], 1);
            warn!(session_id = %id, error = %e, "question not published");
            Err(e.into())
        }
    }
}

/// `POST /answers/{id}`: push the first answer's text onto the session stream.
pub async fn receive_answer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<Vec<AnswerItem>>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let id = SessionId::from(id);
    let reject = |detail: String| {
        state.metrics.counter_inc("relay.answers.rejected", &[], 1);
        ApiError::BadRequest(detail)
    };

    let Json(items) = body.map_err(|e| reject(format!("Malformed answer payload: {}", e.body_text())))?;
    let answer = items
        .into_iter()
        .next()
        .ok_or_else(|| reject("Request body cannot be an empty list.".into()))?;
    // An SSE event with empty data is never dispatched by the browser.
    if answer.response.is_empty() {
        return Err(reject("Answer response cannot be empty.".into()));
    }

    if let Err(e) = state.sessions.deliver(&id, answer.response) {
        if matches!(e, crate::registry::SessionError::NotFound(_)) {
            state.metrics.counter_inc("relay.answers.not_found", &[], 1);
            info!(session_id = %id, "answer for session without a stream");
        } else {
            warn!(session_id = %id, error = %e, "answer could not be queued");
        }
        return Err(e.into());
    }

    state.metrics.counter_inc("relay.answers.delivered", &[], 1);
    info!(session_id = %id, "answer queued for stream");
    Ok((
        StatusCode::OK,
        Json(json!({ "message": "Answer propagated to stream." })),
    ))
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "producerInitialized": state.producer.get().is_some(),
        "activeSessions": state.sessions.len(),
    }))
}

/// `GET /metrics`
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}
