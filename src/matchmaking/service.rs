//! Matchmaking service - owns the queue, player bindings and activity

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::GameConfig;
use crate::game::practice::BindingLookup;
use crate::game::r#match::Seat;
use crate::game::{GameMatch, InputSample, InputSlot, MatchHandle, MatchObserver, MatchRegistry};
use crate::store::positions::PositionLog;
use crate::ws::protocol::ServerMsg;
use crate::ws::session::Session;

use super::queue::{MatchmakingQueue, QueueEntry};

/// Result of a join request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Waiting for an opponent
    Queued,
    /// Paired into a freshly created match
    Matched { match_id: Uuid, opponent: String },
    /// Already playing; nothing changed
    AlreadyBound { match_id: Uuid },
}

/// A player's link to the match simulating them
struct Binding {
    handle: MatchHandle,
    input: Arc<InputSlot>,
}

#[derive(Default)]
struct MatchmakerState {
    queue: MatchmakingQueue,
    bindings: HashMap<String, Binding>,
}

/// Matchmaking service.
///
/// Queue and bindings sit behind one lock so pairing is atomic: a player
/// is either queued, bound, or neither, never both.
pub struct Matchmaker {
    state: Mutex<MatchmakerState>,
    registry: Arc<MatchRegistry>,
    /// Last message time per player
    activity: DashMap<String, Instant>,
    game: GameConfig,
    positions: PositionLog,
    shutdown: watch::Receiver<bool>,
}

impl Matchmaker {
    pub fn new(
        registry: Arc<MatchRegistry>,
        game: GameConfig,
        positions: PositionLog,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MatchmakerState::default()),
            registry,
            activity: DashMap::new(),
            game,
            positions,
            shutdown,
        })
    }

    /// Join matchmaking. Pairs with the longest-waiting player if there is
    /// one; bound players are left untouched.
    pub fn enqueue(self: &Arc<Self>, name: &str, session: Option<Arc<Session>>) -> JoinOutcome {
        let mut state = self.state.lock();

        if let Some(binding) = state.bindings.get(name) {
            return JoinOutcome::AlreadyBound {
                match_id: binding.handle.id,
            };
        }

        state.queue.enqueue(QueueEntry::new(name, session));

        let Some((a, b)) = state.queue.pop_pair() else {
            info!(player = %name, queue_size = state.queue.len(), "Player joined matchmaking queue");
            return JoinOutcome::Queued;
        };

        let match_id = Uuid::new_v4();
        let seats = [
            Seat {
                name: a.name.clone(),
                input: a.input.clone(),
                session: a.session.clone(),
            },
            Seat {
                name: b.name.clone(),
                input: b.input.clone(),
                session: b.session.clone(),
            },
        ];
        let observer: Arc<dyn MatchObserver> = self.clone();
        let (game_match, handle) =
            GameMatch::new(match_id, self.game, seats, observer, self.positions.clone());

        for entry in [&a, &b] {
            state.bindings.insert(
                entry.name.clone(),
                Binding {
                    handle: handle.clone(),
                    input: entry.input.clone(),
                },
            );
        }
        self.registry.insert(handle);
        self.registry
            .track(tokio::spawn(game_match.run(self.shutdown.clone())));
        drop(state);

        info!(
            match_id = %match_id,
            a = %a.name,
            b = %b.name,
            waited_ms = a.wait_time().as_millis() as u64,
            "Created new match"
        );

        let players = vec![a.name.clone(), b.name.clone()];
        for (me, opponent) in [(&a, &b), (&b, &a)] {
            if let Some(session) = &me.session {
                let _ = session.send_msg(&ServerMsg::Matched {
                    match_id,
                    name: me.name.clone(),
                    opponent: opponent.name.clone(),
                    players: players.clone(),
                });
            }
        }

        if a.name == name {
            JoinOutcome::Matched {
                match_id,
                opponent: b.name,
            }
        } else if b.name == name {
            JoinOutcome::Matched {
                match_id,
                opponent: a.name,
            }
        } else {
            JoinOutcome::Queued
        }
    }

    /// Point an existing binding (or queue entry) at a new session
    pub fn attach_session(&self, name: &str, session: Arc<Session>) -> bool {
        let mut state = self.state.lock();
        if let Some(binding) = state.bindings.get(name) {
            return binding.handle.attach_session(name, session);
        }
        if let Some(entry) = state.queue.get_mut(name) {
            entry.session = Some(session);
            return true;
        }
        false
    }

    /// Connection for `session_id` went away.
    ///
    /// Queue entries buffered on that session are dropped; a binding stays so
    /// the player can rejoin, but the match stops sending to the old session.
    pub fn disconnect(&self, name: &str, session_id: Uuid) {
        let mut state = self.state.lock();

        let queued_here = state
            .queue
            .iter()
            .any(|e| e.name == name && e.session.as_ref().is_some_and(|s| s.id() == session_id));
        if queued_here {
            state.queue.dequeue(name);
        }

        match state.bindings.get(name) {
            Some(binding) => {
                binding.handle.detach_session(name, session_id);
            }
            None => {
                if !state.queue.contains(name) {
                    self.activity.remove(name);
                }
            }
        }
    }

    /// Latest input for a bound player; false when not bound
    pub fn route_input(&self, name: &str, sample: InputSample) -> bool {
        let state = self.state.lock();
        match state.bindings.get(name) {
            Some(binding) => {
                binding.input.store(sample);
                true
            }
            None => false,
        }
    }

    pub fn refill_boost(&self, name: &str) -> bool {
        let state = self.state.lock();
        state
            .bindings
            .get(name)
            .is_some_and(|binding| binding.handle.refill_boost(name))
    }

    pub fn pop_ball(&self, name: &str) -> bool {
        let state = self.state.lock();
        state
            .bindings
            .get(name)
            .is_some_and(|binding| binding.handle.pop_ball())
    }

    /// Drop a player from queue, binding and activity tracking
    pub fn remove_player(&self, name: &str) {
        let mut state = self.state.lock();
        state.queue.dequeue(name);
        if let Some(binding) = state.bindings.remove(name) {
            binding.handle.remove_player(name);
        }
        self.activity.remove(name);
        debug!(player = %name, "Player removed from matchmaking");
    }

    /// Release every binding of a finished match
    pub fn release_match(&self, match_id: Uuid) {
        let mut state = self.state.lock();
        let before = state.bindings.len();
        state.bindings.retain(|_, b| b.handle.id != match_id);
        let released = before - state.bindings.len();
        drop(state);

        self.registry.remove(&match_id);
        info!(match_id = %match_id, released, "Match removed from registry");
    }

    pub fn match_of(&self, name: &str) -> Option<Uuid> {
        self.state.lock().bindings.get(name).map(|b| b.handle.id)
    }

    /// Record activity for the idle sweep
    pub fn touch(&self, name: &str) {
        self.activity.insert(name.to_string(), Instant::now());
    }

    /// Players idle longer than their timeout as of `now`.
    /// Bound players use `ingame`, everyone else `lobby`.
    pub fn idle_players(&self, now: Instant, lobby: Duration, ingame: Duration) -> Vec<String> {
        let seen: Vec<(String, Instant)> = self
            .activity
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();

        let state = self.state.lock();
        seen.into_iter()
            .filter(|(name, last)| {
                let timeout = if state.bindings.contains_key(name) {
                    ingame
                } else {
                    lobby
                };
                now.saturating_duration_since(*last) > timeout
            })
            .map(|(name, _)| name)
            .collect()
    }

    /// Get current queue size
    pub fn queue_size(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn tracked_players(&self) -> usize {
        self.activity.len()
    }
}

impl BindingLookup for Matchmaker {
    fn is_bound(&self, name: &str) -> bool {
        self.state.lock().bindings.contains_key(name)
    }
}

impl MatchObserver for Matchmaker {
    fn player_evicted(&self, match_id: Uuid, name: &str) {
        let mut state = self.state.lock();
        let owned = state
            .bindings
            .get(name)
            .is_some_and(|b| b.handle.id == match_id);
        if owned {
            state.bindings.remove(name);
        }
    }

    fn match_closed(&self, match_id: Uuid) {
        self.release_match(match_id);
    }
}
