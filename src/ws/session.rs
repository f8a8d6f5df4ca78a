//! Per-connection outbound sessions
//!
//! The tick path never touches a socket. It serializes once and enqueues a
//! shared frame into each session's bounded queue. A dedicated writer task
//! per session drains that queue in order, taking a permit from the global
//! sender pool for every write.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::Message;
use dashmap::DashMap;
use futures::{Sink, SinkExt};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::protocol::ServerMsg;

/// Frame queued for a session's writer
#[derive(Debug, Clone)]
pub enum Outbound {
    Text(Arc<str>),
    Close,
}

/// Why an enqueue did not go through
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// Session is gone; the caller should evict the player
    #[error("session closed")]
    Closed,
    /// Peer is behind; this frame was dropped for it
    #[error("session queue full")]
    Full,
}

/// Outbound half of one WebSocket connection
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    name: String,
    tx: mpsc::Sender<Outbound>,
    closed: AtomicBool,
}

impl Session {
    /// Create a session and the receiving end its writer will drain
    pub fn new(name: impl Into<String>, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            name: name.into(),
            tx,
            closed: AtomicBool::new(false),
        });
        (session, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    /// Non-blocking enqueue of an already-serialized frame
    pub fn try_send(&self, frame: Arc<str>) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.tx
            .try_send(Outbound::Text(frame))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => SendError::Full,
                mpsc::error::TrySendError::Closed(_) => SendError::Closed,
            })
    }

    /// Serialize and enqueue a single message
    pub fn send_msg(&self, msg: &ServerMsg) -> Result<(), SendError> {
        match serde_json::to_string(msg) {
            Ok(text) => self.try_send(text.into()),
            Err(e) => {
                warn!(player = %self.name, error = %e, "Failed to serialize message");
                Ok(())
            }
        }
    }

    /// Best-effort close; the writer stops after its current frame
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.try_send(Outbound::Close);
        }
    }
}

/// Spawn the writer task that owns the socket's sink.
///
/// Ends when the session is closed, the queue is dropped or a write fails.
pub fn spawn_writer<S>(
    session: Arc<Session>,
    mut rx: mpsc::Receiver<Outbound>,
    mut sink: S,
    pool: Arc<Semaphore>,
) -> JoinHandle<()>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display + Send,
{
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let message = match frame {
                Outbound::Text(text) => Message::Text(text.to_string()),
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };

            let permit = match pool.acquire().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let result = sink.send(message).await;
            drop(permit);

            if let Err(e) = result {
                debug!(player = %session.name(), error = %e, "Socket write failed");
                session.close();
                break;
            }

            if session.closed.load(Ordering::Acquire) {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
        session.closed.store(true, Ordering::Release);
    })
}

/// Live sessions by player name
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, returning the one it supersedes
    pub fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.sessions.insert(session.name().to_string(), session)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Session>> {
        self.sessions.get(name).map(|s| s.value().clone())
    }

    /// Remove only if the registered session is still `id`
    pub fn remove_if_current(&self, name: &str, id: Uuid) -> bool {
        self.sessions.remove_if(name, |_, s| s.id() == id).is_some()
    }

    /// Remove and close whatever session is registered under `name`
    pub fn evict(&self, name: &str) -> bool {
        match self.sessions.remove(name) {
            Some((_, session)) => {
                session.close();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use futures::StreamExt;

    #[tokio::test]
    async fn writer_delivers_frames_in_order() {
        let (session, rx) = Session::new("ana", 8);
        let (sink, mut out) = fmpsc::unbounded::<Message>();
        let pool = Arc::new(Semaphore::new(1));
        let writer = spawn_writer(session.clone(), rx, sink, pool);

        session.try_send("one".into()).unwrap();
        session.try_send("two".into()).unwrap();

        assert_eq!(out.next().await, Some(Message::Text("one".into())));
        assert_eq!(out.next().await, Some(Message::Text("two".into())));

        session.close();
        assert_eq!(out.next().await, Some(Message::Close(None)));
        writer.await.unwrap();
        assert!(session.is_closed());
    }

    #[test]
    fn writer_accepts_the_axum_socket_sink() {
        let _ = spawn_writer::<
            futures::stream::SplitSink<axum::extract::ws::WebSocket, Message>,
        >;
    }

    #[tokio::test]
    async fn full_queue_drops_frame_but_stays_open() {
        let (session, _rx) = Session::new("ana", 1);
        tokio_test::assert_ok!(session.try_send("a".into()));
        assert_eq!(tokio_test::assert_err!(session.try_send("b".into())), SendError::Full);
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn closed_session_rejects_immediately() {
        let (session, rx) = Session::new("ana", 4);
        drop(rx);
        assert_eq!(session.try_send("a".into()), Err(SendError::Closed));

        let (session, _rx) = Session::new("bo", 4);
        session.close();
        assert_eq!(session.try_send("a".into()), Err(SendError::Closed));
    }

    #[tokio::test]
    async fn failed_write_closes_session() {
        let (session, rx) = Session::new("ana", 4);
        let (sink, out) = fmpsc::unbounded::<Message>();
        drop(out);
        let writer = spawn_writer(session.clone(), rx, sink, Arc::new(Semaphore::new(1)));

        session.try_send("lost".into()).unwrap();
        writer.await.unwrap();
        assert!(session.is_closed());
        assert_eq!(session.try_send("x".into()), Err(SendError::Closed));
    }

    #[test]
    fn registry_removes_only_matching_session() {
        let registry = SessionRegistry::new();
        let (old, _rx_old) = Session::new("ana", 4);
        let (new, _rx_new) = Session::new("ana", 4);

        registry.insert(old.clone());
        let replaced = registry.insert(new.clone());
        assert_eq!(replaced.map(|s| s.id()), Some(old.id()));

        assert!(!registry.remove_if_current("ana", old.id()));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove_if_current("ana", new.id()));
        assert!(registry.is_empty());
    }

    #[test]
    fn evict_closes_session() {
        let registry = SessionRegistry::new();
        let (session, _rx) = Session::new("ana", 4);
        registry.insert(session.clone());
        assert!(registry.evict("ana"));
        assert!(session.is_closed());
        assert!(registry.get("ana").is_none());
    }
}
