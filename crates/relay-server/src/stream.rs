//! Server-sent event rendering of a session stream.

use std::convert::Infallible;

use axum::response::sse::Event;
use futures::Stream;

use crate::registry::{SessionStream, StreamEnd};

/// Named event sent when the server ends a stream.
pub const CLOSE_EVENT: &str = "close";

/// Each answer becomes an unnamed `message` event carrying the response
/// text. A stream ended by the server finishes with a `close` event whose
/// data says why; a client disconnect just stops.
pub fn answer_events(session: SessionStream) -> impl Stream<Item = Result<Event, Infallible>> {
    futures::stream::unfold(Some(session), |state| async move {
        let mut session = state?;
        if let Some(text) = session.next_answer().await {
            return Some((Ok(Event::default().data(text)), Some(session)));
        }
        let reason = match session.end_reason() {
            Some(StreamEnd::Replaced) => "replaced",
            Some(StreamEnd::Closed) => "closed",
            _ => return None,
        };
        tracing::debug!(session_id = %session.session_id(), reason, "ending event stream");
        Some((Ok(Event::default().event(CLOSE_EVENT).data(reason)), None))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use futures::StreamExt;
    use relay_core::SessionId;
    use relay_telemetry::MetricsRecorder;

    use crate::registry::SessionRegistry;

    #[tokio::test]
    async fn answers_then_close_event() {
        let reg = Arc::new(SessionRegistry::new(
            Duration::from_secs(1),
            Arc::new(MetricsRecorder::new()),
        ));
        let id = SessionId::from_raw("abc");
        let session = reg.attach(id.clone()).await;

        reg.deliver(&id, "hello".into()).unwrap();
        reg.close(&id);

        let events: Vec<_> = answer_events(session).collect().await;
        assert_eq!(events.len(), 2);
        assert!(!reg.contains(&id));
    }

    #[tokio::test]
    async fn dropping_event_stream_detaches_session() {
        let reg = Arc::new(SessionRegistry::new(
            Duration::from_secs(1),
            Arc::new(MetricsRecorder::new()),
        ));
        let id = SessionId::from_raw("abc");
        let events = answer_events(reg.attach(id.clone()).await);
        assert!(reg.contains(&id));

        drop(events);
        assert!(!reg.contains(&id));
    }
}
