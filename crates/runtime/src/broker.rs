//! Per-session event queues.
//!
//! A producer publishes progress into a session; one consumer drains it.
//! [`SessionBroker::close`] pushes an end-of-stream marker that the consumer
//! sees after every event published before it. Sessions are removed once
//! fully drained, and [`SessionBroker::sweep`] collects the ones nobody
//! finished with.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use history::SessionId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Error, Result};

/// Default time a session may stay unclaimed or undrained.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Update,
    Final,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl SessionEvent {
    pub fn new(kind: EventKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            data: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Server-sent-events frame: `data: <json>\n\n`.
    pub fn to_sse(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("data: {json}\n\n")
    }
}

enum Frame {
    Event(SessionEvent),
    Close,
}

struct Entry {
    sender: mpsc::UnboundedSender<Frame>,
    receiver: Option<mpsc::UnboundedReceiver<Frame>>,
    created_at: Instant,
    closed_at: Option<Instant>,
}

/// Hands out session ids and routes events to their consumers.
pub struct SessionBroker {
    sessions: Mutex<HashMap<SessionId, Entry>>,
    retention: Duration,
}

impl Default for SessionBroker {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl SessionBroker {
    pub fn new(retention: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            retention,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Entry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_session(&self) -> SessionId {
        let id = SessionId::new();
        let (sender, receiver) = mpsc::unbounded_channel();
        self.lock().insert(
            id,
            Entry {
                sender,
                receiver: Some(receiver),
                created_at: Instant::now(),
                closed_at: None,
            },
        );
        debug!(session = %id, "session created");
        id
    }

    pub fn publish(&self, id: SessionId, kind: EventKind, content: impl Into<String>) -> Result<()> {
        self.publish_event(id, SessionEvent::new(kind, content))
    }

    pub fn publish_event(&self, id: SessionId, event: SessionEvent) -> Result<()> {
        let sessions = self.lock();
        let entry = sessions.get(&id).ok_or(Error::SessionNotFound(id))?;
        if entry.closed_at.is_some() {
            return Err(Error::SessionClosed(id));
        }
        entry
            .sender
            .send(Frame::Event(event))
            .map_err(|_| Error::SessionClosed(id))
    }

    /// Mark the session inactive and enqueue the end-of-stream marker.
    pub fn close(&self, id: SessionId) -> Result<()> {
        let mut sessions = self.lock();
        let entry = sessions.get_mut(&id).ok_or(Error::SessionNotFound(id))?;
        if entry.closed_at.is_some() {
            return Ok(());
        }
        entry.closed_at = Some(Instant::now());
        // The consumer may already be gone; the sweeper handles that.
        let _ = entry.sender.send(Frame::Close);
        debug!(session = %id, "session closed");
        Ok(())
    }

    /// Whether the session exists and is still accepting events.
    pub fn is_active(&self, id: SessionId) -> Option<bool> {
        self.lock().get(&id).map(|entry| entry.closed_at.is_none())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Take the session's single consumer stream.
    pub fn drain(self: &Arc<Self>, id: SessionId) -> Result<EventStream> {
        let mut sessions = self.lock();
        let entry = sessions.get_mut(&id).ok_or(Error::SessionNotFound(id))?;
        let receiver = entry.receiver.take().ok_or(Error::SessionBusy(id))?;
        Ok(EventStream {
            id,
            receiver,
            broker: Arc::clone(self),
            finished: false,
        })
    }

    fn remove(&self, id: SessionId) {
        if self.lock().remove(&id).is_some() {
            debug!(session = %id, "session drained");
        }
    }

    /// Remove sessions closed longer ago than the retention window and
    /// sessions that nobody ever started draining within it. Sessions being
    /// drained while still open are left alone.
    pub fn sweep(&self) -> usize {
        let retention = self.retention;
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, entry| {
            let expired_close = entry
                .closed_at
                .is_some_and(|closed| closed.elapsed() > retention);
            let unclaimed = entry.receiver.is_some() && entry.created_at.elapsed() > retention;
            !(expired_close || unclaimed)
        });
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(removed, "swept stale sessions");
        }
        removed
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        broker.sweep();
                    }
                }
            }
        })
    }
}

/// Consumer side of one session.
pub struct EventStream {
    id: SessionId,
    receiver: mpsc::UnboundedReceiver<Frame>,
    broker: Arc<SessionBroker>,
    finished: bool,
}

impl EventStream {
    pub fn session_id(&self) -> SessionId {
        self.id
    }

    fn accept(&mut self, frame: Option<Frame>) -> Option<SessionEvent> {
        match frame {
            Some(Frame::Event(event)) => Some(event),
            Some(Frame::Close) | None => {
                self.finished = true;
                self.broker.remove(self.id);
                None
            }
        }
    }

    /// Next event, or `None` once the session is closed and drained.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        if self.finished {
            return None;
        }
        let frame = self.receiver.recv().await;
        self.accept(frame)
    }

    /// Like [`recv`](Self::recv), but gives up after `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<SessionEvent>> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| Error::Timeout(timeout))
    }

    /// Drain every remaining event, waiting at most `timeout` for each.
    pub async fn collect_events(mut self, timeout: Duration) -> Result<Vec<SessionEvent>> {
        let mut events = Vec::new();
        while let Some(event) = self.recv_timeout(timeout).await? {
            events.push(event);
        }
        Ok(events)
    }
}

/// Blocking iteration for consumers outside an async runtime.
///
/// Panics if called from within an async task.
impl Iterator for EventStream {
    type Item = SessionEvent;

    fn next(&mut self) -> Option<SessionEvent> {
        if self.finished {
            return None;
        }
        let frame = self.receiver.blocking_recv();
        self.accept(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_order_then_stream_ends() {
        let broker = Arc::new(SessionBroker::default());
        let id = broker.create_session();
        broker.publish(id, EventKind::Update, "one").unwrap();
        broker.publish(id, EventKind::Update, "two").unwrap();
        broker.publish(id, EventKind::Final, "3").unwrap();
        broker.close(id).unwrap();

        let events = broker
            .drain(id)
            .unwrap()
            .collect_events(Duration::from_secs(1))
            .await
            .unwrap();
        let contents: Vec<&str> = events.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two", "3"]);
        assert_eq!(events[2].kind, EventKind::Final);
        assert!(broker.is_empty());
    }

    #[tokio::test]
    async fn consumer_waits_for_late_events() {
        let broker = Arc::new(SessionBroker::default());
        let id = broker.create_session();
        let mut stream = broker.drain(id).unwrap();

        let producer = Arc::clone(&broker);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.publish(id, EventKind::Update, "late").unwrap();
            producer.close(id).unwrap();
        });

        let event = stream.recv_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(event.unwrap().content, "late");
        assert!(stream.recv().await.is_none());
        assert!(stream.recv().await.is_none());
    }

    #[test]
    fn publish_after_close_is_rejected() {
        let broker = SessionBroker::default();
        let id = broker.create_session();
        broker.close(id).unwrap();
        assert_eq!(broker.is_active(id), Some(false));
        assert!(matches!(
            broker.publish(id, EventKind::Update, "x"),
            Err(Error::SessionClosed(_))
        ));
        assert!(matches!(
            broker.publish(SessionId::new(), EventKind::Update, "x"),
            Err(Error::SessionNotFound(_))
        ));
    }

    #[test]
    fn only_one_consumer_per_session() {
        let broker = Arc::new(SessionBroker::default());
        let id = broker.create_session();
        let _stream = broker.drain(id).unwrap();
        assert!(matches!(broker.drain(id), Err(Error::SessionBusy(_))));
    }

    #[test]
    fn sweep_collects_closed_and_unclaimed_sessions() {
        let broker = Arc::new(SessionBroker::new(Duration::from_millis(10)));
        let closed = broker.create_session();
        broker.close(closed).unwrap();
        let _unclaimed = broker.create_session();
        let watched = broker.create_session();
        let _stream = broker.drain(watched).unwrap();

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(broker.sweep(), 2);
        assert_eq!(broker.len(), 1);
        assert_eq!(broker.is_active(watched), Some(true));
    }

    #[test]
    fn sse_frame_format() {
        let event = SessionEvent::new(EventKind::Final, "3");
        let frame = event.to_sse();
        assert!(frame.starts_with("data: {\"type\":\"final\",\"content\":\"3\""));
        assert!(frame.ends_with("\n\n"));
    }

    #[test]
    fn blocking_iteration_outside_runtime() {
        let broker = Arc::new(SessionBroker::default());
        let id = broker.create_session();
        broker.publish(id, EventKind::Update, "a").unwrap();
        broker.publish(id, EventKind::Error, "b").unwrap();
        broker.close(id).unwrap();
        let kinds: Vec<EventKind> = broker.drain(id).unwrap().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Update, EventKind::Error]);
    }
}
