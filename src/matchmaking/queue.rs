//! Matchmaking queue implementation

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::game::InputSlot;
use crate::ws::session::Session;

/// Player in the matchmaking queue
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub name: String,
    /// Session buffered until a match is formed
    pub session: Option<Arc<Session>>,
    /// Input slot handed to the match on pairing
    pub input: Arc<InputSlot>,
    pub queued_at: Instant,
}

impl QueueEntry {
    pub fn new(name: impl Into<String>, session: Option<Arc<Session>>) -> Self {
        Self {
            name: name.into(),
            session,
            input: Arc::new(InputSlot::new()),
            queued_at: Instant::now(),
        }
    }

    /// How long this player has been waiting
    pub fn wait_time(&self) -> Duration {
        self.queued_at.elapsed()
    }
}

/// FIFO of players waiting for an opponent
#[derive(Debug, Default)]
pub struct MatchmakingQueue {
    queue: VecDeque<QueueEntry>,
}

impl MatchmakingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a player to the back of the queue.
    ///
    /// A player already waiting keeps their place; only the buffered session
    /// is replaced.
    pub fn enqueue(&mut self, entry: QueueEntry) {
        if let Some(existing) = self.queue.iter_mut().find(|e| e.name == entry.name) {
            existing.session = entry.session;
            return;
        }
        self.queue.push_back(entry);
    }

    /// Remove a player from the queue
    pub fn dequeue(&mut self, name: &str) -> Option<QueueEntry> {
        let pos = self.queue.iter().position(|e| e.name == name)?;
        self.queue.remove(pos)
    }

    /// Check if a player is in the queue
    pub fn contains(&self, name: &str) -> bool {
        self.queue.iter().any(|e| e.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut QueueEntry> {
        self.queue.iter_mut().find(|e| e.name == name)
    }

    /// Take the two longest-waiting players, oldest first
    pub fn pop_pair(&mut self) -> Option<(QueueEntry, QueueEntry)> {
        if self.queue.len() < 2 {
            return None;
        }
        let first = self.queue.pop_front()?;
        let second = self.queue.pop_front()?;
        Some((first, second))
    }

    /// Get queue length
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if queue is empty
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.queue.iter()
    }
}
