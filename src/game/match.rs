//! Match state and authoritative tick loop

use std::f32::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::GameConfig;
use crate::store::positions::{Pose, PositionLog};
use crate::util::time::{secs_to_ticks, tick_duration, Timer, SLOW_TICK_MS};
use crate::ws::protocol::ServerMsg;
use crate::ws::session::{SendError, Session};

use super::collision::{goal_crossed, resolve_car_ball, resolve_car_car, GoalSide};
use super::physics::{step_ball, step_car, BallState, PlayerState, Tuning};
use super::snapshot::{SnapshotBuilder, SnapshotHeader};
use super::{InputSample, InputSlot};

/// Match phase. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchPhase {
    /// Fewer than two players
    Waiting,
    /// Kickoff countdown, input ignored
    Countdown,
    /// Clock running
    Live,
    /// Clock ran out on a tie; next goal wins
    Overtime,
    /// Final score broadcast, match is over
    GameOver,
}

/// Slot of the player defending the left goal
pub const SLOT_A: usize = 0;
/// Slot of the player defending the right goal
pub const SLOT_B: usize = 1;

/// Player entering a new match
pub struct Seat {
    pub name: String,
    pub input: Arc<InputSlot>,
    pub session: Option<Arc<Session>>,
}

struct MatchSeat {
    player: PlayerState,
    input: Arc<InputSlot>,
    session: Option<Arc<Session>>,
    /// Controls applied this tick (brake state matters for ball contact)
    applied: InputSample,
}

/// Commands accepted by a running match
#[derive(Debug)]
pub enum MatchCommand {
    /// Route this player's frames to a new session
    AttachSession { name: String, session: Arc<Session> },
    /// Stop sending to `session_id` if it is still the attached one
    DetachSession { name: String, session_id: Uuid },
    RemovePlayer { name: String },
    RefillBoost { name: String },
    PopBall,
}

/// Recoverable per-tick failure
#[derive(Debug, thiserror::Error)]
pub enum TickError {
    #[error("non-finite state for {entity}, reset to spawn")]
    NonFinite { entity: String },
}

/// Receives lifecycle notifications from running matches
pub trait MatchObserver: Send + Sync {
    /// A player was dropped after its session failed
    fn player_evicted(&self, match_id: Uuid, name: &str);
    /// The match stopped ticking; its bindings can be released
    fn match_closed(&self, match_id: Uuid);
}

/// Match state (owned by match task)
pub struct MatchState {
    pub id: Uuid,
    pub phase: MatchPhase,
    pub tick: u64,
    pub score_a: u32,
    pub score_b: u32,
    pub countdown_ticks: u32,
    pub round_ticks: u32,
    pub ball: BallState,
    seats: [Option<MatchSeat>; 2],
    /// Cleared when a goal registers, set again once the ball is back in play
    goal_armed: bool,
    tuning: Tuning,
    config: GameConfig,
}

impl MatchState {
    fn new(id: Uuid, config: GameConfig, seats: [Seat; 2]) -> Self {
        let tuning = Tuning::default();
        let mut state = Self {
            id,
            phase: MatchPhase::Waiting,
            tick: 0,
            score_a: 0,
            score_b: 0,
            countdown_ticks: secs_to_ticks(config.countdown_secs),
            round_ticks: secs_to_ticks(config.round_secs),
            ball: BallState::centered(&tuning),
            seats: seats.map(|seat| {
                Some(MatchSeat {
                    player: PlayerState::new(seat.name, 0.0, 0.0, 0.0),
                    input: seat.input,
                    session: seat.session,
                    applied: InputSample::default(),
                })
            }),
            goal_armed: true,
            tuning,
            config,
        };
        state.reset_kickoff();
        state
    }

    pub fn player_count(&self) -> usize {
        self.seats.iter().flatten().count()
    }

    pub fn player(&self, name: &str) -> Option<&PlayerState> {
        self.seats
            .iter()
            .flatten()
            .map(|seat| &seat.player)
            .find(|p| p.name == name)
    }

    pub fn players(&self) -> impl Iterator<Item = &PlayerState> {
        self.seats.iter().flatten().map(|seat| &seat.player)
    }

    fn seat_mut(&mut self, name: &str) -> Option<&mut MatchSeat> {
        self.seats
            .iter_mut()
            .flatten()
            .find(|seat| seat.player.name == name)
    }

    fn seat_index(&self, name: &str) -> Option<usize> {
        self.seats
            .iter()
            .position(|seat| seat.as_ref().is_some_and(|s| s.player.name == name))
    }

    /// Name in a slot, if occupied
    pub fn slot_name(&self, slot: usize) -> Option<&str> {
        self.seats
            .get(slot)
            .and_then(|seat| seat.as_ref())
            .map(|seat| seat.player.name.as_str())
    }

    /// Ball to center; A on the left facing right, B on the right facing left
    fn reset_kickoff(&mut self) {
        let (cx, cy) = self.tuning.center();
        let offset = self.tuning.kickoff_offset;
        self.ball.reset(&self.tuning);
        if let Some(a) = &mut self.seats[SLOT_A] {
            a.player.place(cx - offset, cy, 0.0);
        }
        if let Some(b) = &mut self.seats[SLOT_B] {
            b.player.place(cx + offset, cy, PI);
        }
    }

    fn enter_countdown(&mut self) {
        self.phase = MatchPhase::Countdown;
        self.countdown_ticks = secs_to_ticks(self.config.countdown_secs);
        self.round_ticks = secs_to_ticks(self.config.round_secs);
        self.reset_kickoff();
        info!(match_id = %self.id, "Countdown started");
    }

    fn advance_phase(&mut self) {
        match self.phase {
            MatchPhase::Waiting => {
                if self.player_count() == 2 {
                    self.enter_countdown();
                }
            }
            MatchPhase::Countdown => {
                self.countdown_ticks = self.countdown_ticks.saturating_sub(1);
                if self.countdown_ticks == 0 {
                    self.phase = MatchPhase::Live;
                    info!(match_id = %self.id, "Kickoff");
                }
            }
            MatchPhase::Live => {
                self.round_ticks = self.round_ticks.saturating_sub(1);
                if self.round_ticks == 0 {
                    if self.score_a == self.score_b {
                        self.phase = MatchPhase::Overtime;
                        info!(match_id = %self.id, score = self.score_a, "Overtime");
                    } else {
                        self.phase = MatchPhase::GameOver;
                    }
                }
            }
            MatchPhase::Overtime | MatchPhase::GameOver => {}
        }
    }

    fn check_goal(&mut self) {
        match goal_crossed(&self.ball, &self.tuning) {
            Some(side) if self.goal_armed => {
                self.goal_armed = false;
                // The side whose goal it is concedes
                match side {
                    GoalSide::Left => self.score_b += 1,
                    GoalSide::Right => self.score_a += 1,
                }
                info!(
                    match_id = %self.id,
                    tick = self.tick,
                    score_a = self.score_a,
                    score_b = self.score_b,
                    "Goal"
                );
                self.reset_kickoff();
                if self.phase == MatchPhase::Overtime {
                    self.phase = MatchPhase::GameOver;
                }
            }
            Some(_) => {}
            None => self.goal_armed = true,
        }
    }

    /// Reset any entity whose state went non-finite
    fn check_finite(&mut self) -> Result<(), TickError> {
        let mut failed = None;
        for seat in self.seats.iter_mut().flatten() {
            let p = &mut seat.player;
            if !p.body.is_finite() || !p.angle.is_finite() || !p.boost_fuel.is_finite() {
                failed.get_or_insert_with(|| p.name.clone());
                p.respawn();
            }
        }
        if !self.ball.body.is_finite() {
            failed.get_or_insert_with(|| "ball".to_string());
            self.ball.reset(&self.tuning);
        }
        match failed {
            Some(entity) => Err(TickError::NonFinite { entity }),
            None => Ok(()),
        }
    }

    /// Winner by score, `None` on a draw
    pub fn winner(&self) -> Option<String> {
        let slot = match self.score_a.cmp(&self.score_b) {
            std::cmp::Ordering::Greater => SLOT_A,
            std::cmp::Ordering::Less => SLOT_B,
            std::cmp::Ordering::Equal => return None,
        };
        self.slot_name(slot).map(str::to_string)
    }

    fn header(&self) -> SnapshotHeader {
        SnapshotHeader {
            match_id: Some(self.id),
            tick: self.tick,
            phase: self.phase.into(),
            countdown_ticks: if self.phase == MatchPhase::Countdown {
                self.countdown_ticks
            } else {
                0
            },
            timer_ticks: match self.phase {
                MatchPhase::Overtime | MatchPhase::GameOver => 0,
                _ => self.round_ticks,
            },
            score_a: self.score_a,
            score_b: self.score_b,
        }
    }
}

/// Handle to a running match
#[derive(Clone)]
pub struct MatchHandle {
    pub id: Uuid,
    commands: mpsc::UnboundedSender<MatchCommand>,
    player_count: Arc<AtomicUsize>,
}

impl MatchHandle {
    pub fn player_count(&self) -> usize {
        self.player_count.load(Ordering::Relaxed)
    }

    /// Whether the match task has stopped
    pub fn is_finished(&self) -> bool {
        self.commands.is_closed()
    }

    fn send(&self, command: MatchCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn attach_session(&self, name: &str, session: Arc<Session>) -> bool {
        self.send(MatchCommand::AttachSession {
            name: name.to_string(),
            session,
        })
    }

    pub fn detach_session(&self, name: &str, session_id: Uuid) -> bool {
        self.send(MatchCommand::DetachSession {
            name: name.to_string(),
            session_id,
        })
    }

    pub fn remove_player(&self, name: &str) -> bool {
        self.send(MatchCommand::RemovePlayer {
            name: name.to_string(),
        })
    }

    pub fn refill_boost(&self, name: &str) -> bool {
        self.send(MatchCommand::RefillBoost {
            name: name.to_string(),
        })
    }

    pub fn pop_ball(&self) -> bool {
        self.send(MatchCommand::PopBall)
    }
}

/// Registry of all active matches
pub struct MatchRegistry {
    matches: DashMap<Uuid, MatchHandle>,
    /// Match tasks not yet joined; a finished match leaves the map before
    /// its task ends, so the handles are kept apart
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MatchRegistry {
    pub fn new() -> Self {
        Self {
            matches: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Keep a match task so shutdown can wait for it
    pub fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Take every tracked match task
    pub fn drain_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.tasks.lock())
    }

    pub fn get(&self, id: &Uuid) -> Option<MatchHandle> {
        self.matches.get(id).map(|m| m.value().clone())
    }

    pub fn insert(&self, handle: MatchHandle) {
        self.matches.insert(handle.id, handle);
    }

    pub fn remove(&self, id: &Uuid) -> Option<MatchHandle> {
        self.matches.remove(id).map(|(_, h)| h)
    }

    pub fn active_matches(&self) -> usize {
        self.matches.len()
    }

    pub fn total_players(&self) -> usize {
        self.matches
            .iter()
            .map(|m| m.value().player_count())
            .sum()
    }
}

impl Default for MatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The authoritative game match
pub struct GameMatch {
    state: MatchState,
    commands: mpsc::UnboundedReceiver<MatchCommand>,
    snapshot_builder: SnapshotBuilder,
    player_count: Arc<AtomicUsize>,
    observer: Arc<dyn MatchObserver>,
    positions: PositionLog,
}

impl GameMatch {
    /// Create a new match for two seated players (A first)
    pub fn new(
        id: Uuid,
        config: GameConfig,
        seats: [Seat; 2],
        observer: Arc<dyn MatchObserver>,
        positions: PositionLog,
    ) -> (Self, MatchHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let player_count = Arc::new(AtomicUsize::new(2));

        let handle = MatchHandle {
            id,
            commands: tx,
            player_count: player_count.clone(),
        };

        let game_match = Self {
            state: MatchState::new(id, config, seats),
            commands: rx,
            snapshot_builder: SnapshotBuilder::new(config.broadcast_skip),
            player_count,
            observer,
            positions,
        };

        (game_match, handle)
    }

    /// Run the authoritative tick loop
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            match_id = %self.state.id,
            a = self.state.slot_name(SLOT_A).unwrap_or_default(),
            b = self.state.slot_name(SLOT_B).unwrap_or_default(),
            "Match started"
        );

        let mut tick_interval = interval(tick_duration());
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {}
                _ = shutdown.changed() => {
                    info!(match_id = %self.state.id, "Shutting down match");
                    break;
                }
            }

            if !self.step() {
                break;
            }
        }

        self.finish();
    }

    /// One scheduler iteration: commands, simulation, broadcast.
    /// Returns false once the match should stop.
    pub fn step(&mut self) -> bool {
        let timer = Timer::new();
        self.process_commands();

        let was_over = self.state.phase == MatchPhase::GameOver;
        if let Err(e) = self.tick() {
            error!(match_id = %self.state.id, tick = self.state.tick, error = %e, "Tick failed");
        }
        self.log_positions();

        let just_ended = !was_over && self.state.phase == MatchPhase::GameOver;
        if just_ended {
            self.snapshot_builder.force_next();
        }
        if self.snapshot_builder.should_send() {
            let snapshot = self.snapshot_builder.build(
                self.state.header(),
                &self.state.ball,
                self.state.players(),
            );
            self.broadcast(&snapshot);
        }
        if just_ended {
            let msg = ServerMsg::GameOver {
                score_a: self.state.score_a,
                score_b: self.state.score_b,
                winner: self.state.winner(),
            };
            self.broadcast(&msg);
        }

        self.player_count
            .store(self.state.player_count(), Ordering::Relaxed);

        let elapsed = timer.elapsed_ms();
        if elapsed > SLOW_TICK_MS {
            warn!(
                match_id = %self.state.id,
                tick = self.state.tick,
                elapsed_ms = elapsed,
                pending_positions = self.positions.pending(),
                "Slow match tick"
            );
        }

        self.state.phase != MatchPhase::GameOver && self.state.player_count() > 0
    }

    /// Advance the simulation by one tick
    pub fn tick(&mut self) -> Result<(), TickError> {
        let s = &mut self.state;
        s.tick += 1;
        s.advance_phase();
        if s.phase == MatchPhase::GameOver {
            return Ok(());
        }

        let tuning = s.tuning;
        let accepting = s.phase != MatchPhase::Countdown;

        for seat in s.seats.iter_mut().flatten() {
            let (sample, jump) = seat.input.take();
            seat.player.last_applied_seq = sample.seq;
            seat.applied = if accepting {
                if jump {
                    seat.player.pending_jump = true;
                }
                sample
            } else {
                InputSample::default()
            };
            step_car(&mut seat.player, &seat.applied, &tuning);
        }

        if let [Some(a), Some(b)] = &mut s.seats {
            if !accepting {
                b.player.face_towards(a.player.body.x, a.player.body.y);
            }
            resolve_car_car(&mut a.player, &mut b.player, &tuning);
        }

        for seat in s.seats.iter_mut().flatten() {
            resolve_car_ball(&mut seat.player, &mut s.ball, seat.applied.brake, &tuning);
        }

        step_ball(&mut s.ball, &tuning);

        let result = s.check_finite();

        if matches!(s.phase, MatchPhase::Live | MatchPhase::Overtime) {
            s.check_goal();
        }

        result
    }

    /// Drain pending commands
    fn process_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            let id = self.state.id;
            match command {
                MatchCommand::AttachSession { name, session } => {
                    if let Some(seat) = self.state.seat_mut(&name) {
                        seat.session = Some(session);
                        info!(match_id = %id, player = %name, "Session attached");
                    }
                }
                MatchCommand::DetachSession { name, session_id } => {
                    if let Some(seat) = self.state.seat_mut(&name) {
                        if seat.session.as_ref().is_some_and(|s| s.id() == session_id) {
                            seat.session = None;
                            seat.input.clear();
                            debug!(match_id = %id, player = %name, "Session detached");
                        }
                    }
                }
                MatchCommand::RemovePlayer { name } => {
                    if let Some(idx) = self.state.seat_index(&name) {
                        self.state.seats[idx] = None;
                        info!(match_id = %id, player = %name, "Player removed from match");
                    }
                }
                MatchCommand::RefillBoost { name } => {
                    if let Some(seat) = self.state.seat_mut(&name) {
                        seat.player.refill_boost();
                    }
                }
                MatchCommand::PopBall => {
                    let tuning = self.state.tuning;
                    self.state.ball.pop(&tuning);
                }
            }
        }
    }

    /// Serialize once and enqueue to every attached session
    fn broadcast(&mut self, msg: &ServerMsg) {
        let frame: Arc<str> = match serde_json::to_string(msg) {
            Ok(text) => text.into(),
            Err(e) => {
                error!(match_id = %self.state.id, error = %e, "Failed to serialize broadcast");
                return;
            }
        };

        let mut failed = Vec::new();
        for (idx, seat) in self.state.seats.iter().enumerate() {
            let Some(seat) = seat else { continue };
            let Some(session) = &seat.session else { continue };
            match session.try_send(frame.clone()) {
                Ok(()) => {}
                Err(SendError::Full) => {
                    debug!(match_id = %self.state.id, player = %seat.player.name, "Outbound queue full, frame dropped");
                }
                Err(SendError::Closed) => failed.push(idx),
            }
        }

        for idx in failed {
            self.evict_seat(idx);
        }
    }

    fn evict_seat(&mut self, idx: usize) {
        if let Some(seat) = self.state.seats[idx].take() {
            if let Some(session) = &seat.session {
                session.close();
            }
            warn!(match_id = %self.state.id, player = %seat.player.name, "Send failed, removing player");
            self.observer
                .player_evicted(self.state.id, &seat.player.name);
        }
    }

    fn log_positions(&self) {
        for player in self.state.players() {
            self.positions.enqueue(
                &player.name,
                self.state.tick,
                Pose {
                    x: player.body.x,
                    y: player.body.y,
                    z: player.body.z,
                    angle: player.angle,
                },
            );
        }
    }

    fn finish(self) {
        self.player_count.store(0, Ordering::Relaxed);
        info!(
            match_id = %self.state.id,
            phase = ?self.state.phase,
            score_a = self.state.score_a,
            score_b = self.state.score_b,
            ticks = self.state.tick,
            "Match ended"
        );
        self.observer.match_closed(self.state.id);
    }
}
