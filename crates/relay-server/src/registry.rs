//! Process-wide map from session id to the queue feeding its live stream.
//!
//! Each attach installs a fresh entry tagged with a generation number. A
//! stream removes its own entry on teardown only if the generation still
//! matches, so teardown of a replaced stream never touches its successor.
//! Replacement retires the old stream and waits for it to exit before the
//! new entry is installed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use relay_core::SessionId;
use relay_telemetry::MetricsRecorder;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no active stream for session {0}")]
    NotFound(SessionId),

    #[error("stream queue for session {0} is closed")]
    QueueClosed(SessionId),
}

/// Item pushed into a session queue.
#[derive(Debug)]
enum StreamItem {
    Answer(String),
    /// Closing sentinel: the stream ends after this.
    Close,
}

/// Why a session stream stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEnd {
    /// Closing sentinel received.
    Closed,
    /// A newer attach under the same id retired this stream.
    Replaced,
    /// All queue senders went away.
    Disconnected,
}

struct SessionEntry {
    generation: u64,
    queue: mpsc::UnboundedSender<StreamItem>,
    retire: CancellationToken,
    /// Resolves once the stream has torn down.
    exited: oneshot::Receiver<()>,
}

pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionEntry>,
    next_generation: AtomicU64,
    retire_timeout: Duration,
    /// Cancelled by `close_all`; ends current and later streams.
    closing: CancellationToken,
    metrics: Arc<MetricsRecorder>,
}

impl SessionRegistry {
    pub fn new(retire_timeout: Duration, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            sessions: DashMap::new(),
            next_generation: AtomicU64::new(1),
            retire_timeout,
            closing: CancellationToken::new(),
            metrics,
        }
    }

    /// Attach a stream to `id`, retiring any stream already attached.
    pub async fn attach(self: &Arc<Self>, id: SessionId) -> SessionStream {
        loop {
            let previous = match self.sessions.entry(id.clone()) {
                Entry::Vacant(slot) => {
                    let (entry, stream) = self.open(&id);
                    slot.insert(entry);
                    self.record_active();
                    info!(session_id = %id, active = self.sessions.len(), "stream attached");
                    return stream;
                }
                Entry::Occupied(slot) => slot.remove(),
            };
            info!(session_id = %id, "stream reconnected, replacing previous");
            self.metrics.counter_inc("relay.sessions.replaced", &[], 1);
            self.retire(&id, previous).await;
        }
    }

    fn open(self: &Arc<Self>, id: &SessionId) -> (SessionEntry, SessionStream) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (queue, rx) = mpsc::unbounded_channel();
        let (exit_tx, exited) = oneshot::channel();
        let retire = CancellationToken::new();
        let entry = SessionEntry {
            generation,
            queue,
            retire: retire.clone(),
            exited,
        };
        let stream = SessionStream {
            id: id.clone(),
            generation,
            rx,
            retire,
            closing: self.closing.clone(),
            registry: Arc::clone(self),
            exit_tx: Some(exit_tx),
            end: None,
        };
        (entry, stream)
    }

    /// Signal a removed entry's stream to stop and wait for it to exit.
    async fn retire(&self, id: &SessionId, entry: SessionEntry) {
        self.record_active();
        entry.retire.cancel();
        let _ = entry.queue.send(StreamItem::Close);
        match tokio::time::timeout(self.retire_timeout, entry.exited).await {
            Ok(_) => debug!(session_id = %id, "previous stream exited"),
            Err(_) => warn!(
                session_id = %id,
                timeout_ms = self.retire_timeout.as_millis() as u64,
                "previous stream did not exit in time, installing replacement anyway"
            ),
        }
    }

    /// Queue an answer for the stream attached to `id`. Never creates a session.
    pub fn deliver(&self, id: &SessionId, text: String) -> Result<(), SessionError> {
        let entry = self
            .sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        entry
            .queue
            .send(StreamItem::Answer(text))
            .map_err(|_| SessionError::QueueClosed(id.clone()))
    }

    /// Push the closing sentinel to one session. Returns false if absent.
    pub fn close(&self, id: &SessionId) -> bool {
        match self.sessions.get(id) {
            Some(entry) => {
                let _ = entry.queue.send(StreamItem::Close);
                true
            }
            None => false,
        }
    }

    /// Push the closing sentinel to every session. Streams attached afterwards
    /// end as soon as they are polled.
    pub fn close_all(&self) -> usize {
        self.closing.cancel();
        let mut closed = 0;
        for entry in self.sessions.iter() {
            if entry.queue.send(StreamItem::Close).is_ok() {
                closed += 1;
            }
        }
        closed
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove `id` if it still belongs to `generation`.
    fn unregister(&self, id: &SessionId, generation: u64) {
        if self
            .sessions
            .remove_if(id, |_, entry| entry.generation == generation)
            .is_some()
        {
            self.record_active();
            info!(session_id = %id, active = self.sessions.len(), "stream detached");
        }
    }

    fn record_active(&self) {
        self.metrics
            .gauge_set("relay.sessions.active", &[], self.sessions.len() as f64);
    }
}

/// Receiving side of one attached session.
///
/// Tears down on end of stream or on drop, whichever comes first.
pub struct SessionStream {
    id: SessionId,
    generation: u64,
    rx: mpsc::UnboundedReceiver<StreamItem>,
    retire: CancellationToken,
    closing: CancellationToken,
    registry: Arc<SessionRegistry>,
    exit_tx: Option<oneshot::Sender<()>>,
    end: Option<StreamEnd>,
}

enum Next {
    Item(Option<StreamItem>),
    Retired,
    Closing,
}

impl SessionStream {
    pub fn session_id(&self) -> &SessionId {
        &self.id
    }

    /// Next queued answer, or `None` once the stream has ended. Retirement
    /// takes priority over queued answers, which are then discarded. Registry
    /// shutdown ends the stream once its queue is empty.
    pub async fn next_answer(&mut self) -> Option<String> {
        if self.end.is_some() {
            return None;
        }
        let next = tokio::select! {
            biased;
            _ = self.retire.cancelled() => Next::Retired,
            item = self.rx.recv() => Next::Item(item),
            _ = self.closing.cancelled() => Next::Closing,
        };
        let end = match next {
            Next::Item(Some(StreamItem::Answer(text))) => return Some(text),
            Next::Item(Some(StreamItem::Close)) | Next::Closing => StreamEnd::Closed,
            Next::Item(None) => StreamEnd::Disconnected,
            Next::Retired => StreamEnd::Replaced,
        };
        self.end = Some(end);
        self.teardown();
        None
    }

    pub fn end_reason(&self) -> Option<StreamEnd> {
        self.end
    }

    pub fn is_retired(&self) -> bool {
        self.retire.is_cancelled()
    }

    fn teardown(&mut self) {
        if let Some(exit_tx) = self.exit_tx.take() {
            self.registry.unregister(&self.id, self.generation);
            let _ = exit_tx.send(());
        }
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        if self.exit_tx.is_some() {
            debug!(session_id = %self.id, "stream dropped by client");
        }
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(retire_timeout: Duration) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(
            retire_timeout,
            Arc::new(MetricsRecorder::new()),
        ))
    }

    fn sid(s: &str) -> SessionId {
        SessionId::from_raw(s)
    }

    #[tokio::test]
    async fn answers_arrive_in_enqueue_order() {
        let reg = registry(Duration::from_secs(1));
        let mut stream = reg.attach(sid("abc")).await;

        for text in ["one", "two", "three"] {
            reg.deliver(&sid("abc"), text.into()).unwrap();
        }
        assert_eq!(stream.next_answer().await.as_deref(), Some("one"));
        assert_eq!(stream.next_answer().await.as_deref(), Some("two"));
        assert_eq!(stream.next_answer().await.as_deref(), Some("three"));
    }

    #[tokio::test]
    async fn deliver_without_session_is_not_found_and_creates_nothing() {
        let reg = registry(Duration::from_secs(1));
        let err = reg.deliver(&sid("xyz"), "x".into()).unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
        assert!(reg.is_empty());
        assert!(!reg.contains(&sid("xyz")));
    }

    #[tokio::test]
    async fn close_sentinel_ends_stream_and_unregisters() {
        let reg = registry(Duration::from_secs(1));
        let mut stream = reg.attach(sid("abc")).await;

        reg.deliver(&sid("abc"), "last".into()).unwrap();
        assert!(reg.close(&sid("abc")));

        assert_eq!(stream.next_answer().await.as_deref(), Some("last"));
        assert_eq!(stream.next_answer().await, None);
        assert_eq!(stream.end_reason(), Some(StreamEnd::Closed));
        assert!(!reg.contains(&sid("abc")));
        assert!(matches!(
            reg.deliver(&sid("abc"), "late".into()),
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn dropping_stream_unregisters() {
        let reg = registry(Duration::from_secs(1));
        let stream = reg.attach(sid("abc")).await;
        assert_eq!(reg.len(), 1);

        drop(stream);
        assert!(reg.is_empty());
        assert!(matches!(
            reg.deliver(&sid("abc"), "x".into()),
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn reattach_retires_first_and_discards_its_backlog() {
        let reg = registry(Duration::from_secs(5));
        let mut first = reg.attach(sid("abc")).await;
        reg.deliver(&sid("abc"), "undelivered".into()).unwrap();

        let reg2 = Arc::clone(&reg);
        let second = tokio::spawn(async move { reg2.attach(sid("abc")).await });

        while !first.is_retired() {
            tokio::task::yield_now().await;
        }
        assert_eq!(first.next_answer().await, None);
        assert_eq!(first.end_reason(), Some(StreamEnd::Replaced));
        drop(first);

        let mut second = second.await.unwrap();
        reg.deliver(&sid("abc"), "fresh".into()).unwrap();
        assert_eq!(second.next_answer().await.as_deref(), Some("fresh"));
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn reattach_waits_for_previous_exit() {
        let reg = registry(Duration::from_secs(5));
        let mut first = reg.attach(sid("abc")).await;

        let reg2 = Arc::clone(&reg);
        let mut second = tokio::spawn(async move { reg2.attach(sid("abc")).await });

        while !first.is_retired() {
            tokio::task::yield_now().await;
        }
        // Not installed until the first stream has exited.
        assert!(!reg.contains(&sid("abc")));
        assert!(futures::poll!(&mut second).is_pending());

        assert_eq!(first.next_answer().await, None);
        let _second = second.await.unwrap();
        assert!(reg.contains(&sid("abc")));
        drop(first);
        assert!(reg.contains(&sid("abc")));
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_stream_is_replaced_after_timeout() {
        let reg = registry(Duration::from_secs(5));
        let first = reg.attach(sid("abc")).await;

        // First stream is never polled; attach proceeds after the timeout.
        let mut second = reg.attach(sid("abc")).await;
        assert!(first.is_retired());
        assert!(reg.contains(&sid("abc")));

        // Late teardown of the stale stream leaves the replacement alone.
        drop(first);
        assert!(reg.contains(&sid("abc")));
        reg.deliver(&sid("abc"), "still here".into()).unwrap();
        assert_eq!(second.next_answer().await.as_deref(), Some("still here"));
    }

    #[tokio::test]
    async fn sessions_are_independent() {
        let reg = registry(Duration::from_secs(1));
        let mut a = reg.attach(sid("a")).await;
        let mut b = reg.attach(sid("b")).await;

        reg.deliver(&sid("b"), "for b".into()).unwrap();
        reg.deliver(&sid("a"), "for a".into()).unwrap();

        assert_eq!(a.next_answer().await.as_deref(), Some("for a"));
        assert_eq!(b.next_answer().await.as_deref(), Some("for b"));
        drop(a);
        assert!(reg.contains(&sid("b")));
    }

    #[tokio::test]
    async fn close_all_ends_every_stream() {
        let reg = registry(Duration::from_secs(1));
        let mut a = reg.attach(sid("a")).await;
        let mut b = reg.attach(sid("b")).await;

        assert_eq!(reg.close_all(), 2);
        assert_eq!(a.next_answer().await, None);
        assert_eq!(b.next_answer().await, None);
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn attach_after_close_all_ends_immediately() {
        let reg = registry(Duration::from_secs(1));
        assert_eq!(reg.close_all(), 0);

        let mut late = reg.attach(sid("late")).await;
        let next = tokio::time::timeout(Duration::from_secs(1), late.next_answer())
            .await
            .expect("stream attached after close_all stayed open");
        assert_eq!(next, None);
        assert_eq!(late.end_reason(), Some(StreamEnd::Closed));
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn close_all_drains_queued_answers_first() {
        let reg = registry(Duration::from_secs(1));
        let mut stream = reg.attach(sid("abc")).await;
        reg.deliver(&sid("abc"), "queued".into()).unwrap();

        reg.close_all();
        assert_eq!(stream.next_answer().await.as_deref(), Some("queued"));
        assert_eq!(stream.next_answer().await, None);
        assert_eq!(stream.end_reason(), Some(StreamEnd::Closed));
    }

    #[tokio::test]
    async fn active_gauge_tracks_sessions() {
        let metrics = Arc::new(MetricsRecorder::new());
        let reg = Arc::new(SessionRegistry::new(Duration::from_secs(1), Arc::clone(&metrics)));

        let a = reg.attach(sid("a")).await;
        let _b = reg.attach(sid("b")).await;
        assert_eq!(metrics.gauge_get("relay.sessions.active", &[]), 2.0);

        drop(a);
        assert_eq!(metrics.gauge_get("relay.sessions.active", &[]), 1.0);
    }
}
