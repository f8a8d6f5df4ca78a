//! Shared practice field for players waiting on an opponent
//!
//! One instance runs for the whole process with the same physics as a
//! match, minus car-car contact, scoring and phases. Players leave it the
//! moment the matchmaker binds them to a match.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::store::positions::{Pose, PositionLog};
use crate::util::time::{tick_duration, Timer, SLOW_TICK_MS};
use crate::ws::session::{SendError, SessionRegistry};

use super::collision::resolve_car_ball;
use super::physics::{step_ball, step_car, BallState, PlayerState, Tuning};
use super::snapshot::{SnapshotBuilder, SnapshotHeader};
use super::{InputSample, InputSlot};

/// Spawn area for practice cars
const SPAWN_X: std::ops::Range<f32> = 100.0..500.0;
const SPAWN_Y: std::ops::Range<f32> = 100.0..300.0;

/// Answers whether a player currently belongs to a match
pub trait BindingLookup: Send + Sync {
    fn is_bound(&self, name: &str) -> bool;
}

#[derive(Debug)]
enum PracticeCommand {
    Join { name: String },
    Leave { name: String },
    RefillBoost { name: String },
    PopBall,
}

struct PracticeSeat {
    player: PlayerState,
    input: Arc<InputSlot>,
}

/// Cloneable handle to the practice loop
#[derive(Clone)]
pub struct PracticeHandle {
    commands: mpsc::UnboundedSender<PracticeCommand>,
    inputs: Arc<DashMap<String, Arc<InputSlot>>>,
    tick: Arc<AtomicU64>,
    active: Arc<AtomicUsize>,
}

impl PracticeHandle {
    /// Add a player (no-op if already present)
    pub fn join(&self, name: &str) {
        self.inputs
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(InputSlot::new()));
        let _ = self.commands.send(PracticeCommand::Join {
            name: name.to_string(),
        });
    }

    pub fn leave(&self, name: &str) {
        self.inputs.remove(name);
        let _ = self.commands.send(PracticeCommand::Leave {
            name: name.to_string(),
        });
    }

    /// Store the latest input; false when the player is not practicing
    pub fn submit_input(&self, name: &str, sample: InputSample) -> bool {
        match self.inputs.get(name) {
            Some(slot) => {
                slot.store(sample);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inputs.contains_key(name)
    }

    pub fn refill_boost(&self, name: &str) {
        let _ = self.commands.send(PracticeCommand::RefillBoost {
            name: name.to_string(),
        });
    }

    pub fn pop_ball(&self) {
        let _ = self.commands.send(PracticeCommand::PopBall);
    }

    /// Ticks simulated so far
    pub fn tick_count(&self) -> u64 {
        self.tick.load(Ordering::Relaxed)
    }

    /// Players simulated on the last tick
    pub fn active_players(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

/// The practice simulation (owned by its task)
pub struct PracticeLoop {
    players: BTreeMap<String, PracticeSeat>,
    ball: BallState,
    tick: u64,
    rng: ChaCha8Rng,
    tuning: Tuning,
    commands: mpsc::UnboundedReceiver<PracticeCommand>,
    inputs: Arc<DashMap<String, Arc<InputSlot>>>,
    sessions: Arc<SessionRegistry>,
    bindings: Arc<dyn BindingLookup>,
    snapshot_builder: SnapshotBuilder,
    positions: PositionLog,
    tick_counter: Arc<AtomicU64>,
    active: Arc<AtomicUsize>,
}

impl PracticeLoop {
    pub fn new(
        broadcast_skip: u32,
        seed: Option<u64>,
        sessions: Arc<SessionRegistry>,
        bindings: Arc<dyn BindingLookup>,
        positions: PositionLog,
    ) -> (Self, PracticeHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inputs = Arc::new(DashMap::new());
        let tick_counter = Arc::new(AtomicU64::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let tuning = Tuning::default();

        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };

        let handle = PracticeHandle {
            commands: tx,
            inputs: inputs.clone(),
            tick: tick_counter.clone(),
            active: active.clone(),
        };

        let practice = Self {
            players: BTreeMap::new(),
            ball: BallState::centered(&tuning),
            tick: 0,
            rng,
            tuning,
            commands: rx,
            inputs,
            sessions,
            bindings,
            snapshot_builder: SnapshotBuilder::new(broadcast_skip),
            positions,
            tick_counter,
            active,
        };

        (practice, handle)
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Practice loop started");

        let mut tick_interval = interval(tick_duration());
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick_interval.tick() => self.step(),
                _ = shutdown.changed() => break,
            }
        }

        info!(ticks = self.tick, "Practice loop stopped");
    }

    /// One scheduler iteration
    pub fn step(&mut self) {
        let timer = Timer::new();
        self.process_commands();
        self.tick += 1;

        self.drop_bound_players();

        if self.players.is_empty() {
            self.ball.reset(&self.tuning);
        } else {
            self.simulate();
        }

        if self.snapshot_builder.should_send() && !self.players.is_empty() {
            self.broadcast();
        }
        self.log_positions();

        self.tick_counter.store(self.tick, Ordering::Relaxed);
        self.active.store(self.players.len(), Ordering::Relaxed);

        let elapsed = timer.elapsed_ms();
        if elapsed > SLOW_TICK_MS {
            warn!(
                tick = self.tick,
                elapsed_ms = elapsed,
                players = self.players.len(),
                pending_positions = self.positions.pending(),
                "Slow practice tick"
            );
        }
    }

    fn process_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                PracticeCommand::Join { name } => self.add_player(name),
                PracticeCommand::Leave { name } => {
                    if self.players.remove(&name).is_some() {
                        debug!(player = %name, "Left practice");
                    }
                }
                PracticeCommand::RefillBoost { name } => {
                    if let Some(seat) = self.players.get_mut(&name) {
                        seat.player.refill_boost();
                    }
                }
                PracticeCommand::PopBall => {
                    self.ball.pop(&self.tuning);
                }
            }
        }
    }

    fn add_player(&mut self, name: String) {
        if self.players.contains_key(&name) {
            return;
        }
        // A leave may have raced the join; only seat players with a live slot
        let Some(input) = self.inputs.get(&name).map(|slot| slot.value().clone()) else {
            return;
        };

        let x = self.rng.gen_range(SPAWN_X);
        let y = self.rng.gen_range(SPAWN_Y);
        info!(player = %name, x, y, "Joined practice");
        self.players.insert(
            name.clone(),
            PracticeSeat {
                player: PlayerState::new(name, x, y, 0.0),
                input,
            },
        );
    }

    fn drop_bound_players(&mut self) {
        let bindings = &self.bindings;
        let bound: Vec<String> = self
            .players
            .keys()
            .filter(|name| bindings.is_bound(name))
            .cloned()
            .collect();

        for name in bound {
            self.players.remove(&name);
            self.inputs.remove(&name);
            debug!(player = %name, "Moved from practice to match");
        }
    }

    fn simulate(&mut self) {
        let tuning = self.tuning;

        for seat in self.players.values_mut() {
            let (sample, jump) = seat.input.take();
            seat.player.last_applied_seq = sample.seq;
            if jump {
                seat.player.pending_jump = true;
            }
            step_car(&mut seat.player, &sample, &tuning);
            resolve_car_ball(&mut seat.player, &mut self.ball, sample.brake, &tuning);
        }

        step_ball(&mut self.ball, &tuning);

        for seat in self.players.values_mut() {
            if !seat.player.body.is_finite() || !seat.player.angle.is_finite() {
                error!(tick = self.tick, player = %seat.player.name, "Non-finite practice state, respawning");
                seat.player.respawn();
            }
        }
        if !self.ball.body.is_finite() {
            error!(tick = self.tick, "Non-finite practice ball, resetting");
            self.ball.reset(&tuning);
        }
    }

    fn broadcast(&mut self) {
        let snapshot = self.snapshot_builder.build(
            SnapshotHeader::practice(self.tick),
            &self.ball,
            self.players.values().map(|seat| &seat.player),
        );
        let frame: Arc<str> = match serde_json::to_string(&snapshot) {
            Ok(text) => text.into(),
            Err(e) => {
                error!(error = %e, "Failed to serialize practice snapshot");
                return;
            }
        };

        let mut failed = Vec::new();
        for name in self.players.keys() {
            let Some(session) = self.sessions.get(name) else {
                continue;
            };
            match session.try_send(frame.clone()) {
                Ok(()) => {}
                Err(SendError::Full) => {
                    debug!(player = %name, "Outbound queue full, frame dropped");
                }
                Err(SendError::Closed) => failed.push(session),
            }
        }

        for session in failed {
            let name = session.name();
            warn!(player = %name, "Send failed, removing from practice");
            self.players.remove(name);
            self.inputs.remove(name);
            self.sessions.remove_if_current(name, session.id());
            session.close();
        }
    }

    fn log_positions(&self) {
        for seat in self.players.values() {
            let p = &seat.player;
            self.positions.enqueue(
                &p.name,
                self.tick,
                Pose {
                    x: p.body.x,
                    y: p.body.y,
                    z: p.body.z,
                    angle: p.angle,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::session::{Outbound, Session};
    use parking_lot::Mutex;
    use std::collections::HashSet;

    #[derive(Default)]
    struct Bound(Mutex<HashSet<String>>);

    impl BindingLookup for Bound {
        fn is_bound(&self, name: &str) -> bool {
            self.0.lock().contains(name)
        }
    }

    struct Fixture {
        practice: PracticeLoop,
        handle: PracticeHandle,
        sessions: Arc<SessionRegistry>,
        bound: Arc<Bound>,
    }

    fn fixture() -> Fixture {
        let sessions = Arc::new(SessionRegistry::new());
        let bound = Arc::new(Bound::default());
        let (practice, handle) = PracticeLoop::new(
            1,
            Some(7),
            sessions.clone(),
            bound.clone(),
            PositionLog::disabled(),
        );
        Fixture {
            practice,
            handle,
            sessions,
            bound,
        }
    }

    fn connect(f: &Fixture, name: &str) -> mpsc::Receiver<Outbound> {
        let (session, rx) = Session::new(name, 256);
        f.sessions.insert(session);
        f.handle.join(name);
        rx
    }

    fn last_state(rx: &mut mpsc::Receiver<Outbound>) -> Option<serde_json::Value> {
        let mut last = None;
        while let Ok(Outbound::Text(text)) = rx.try_recv() {
            last = Some(serde_json::from_str(&text).unwrap());
        }
        last
    }

    #[test]
    fn join_spawns_inside_practice_area() {
        let mut f = fixture();
        let mut rx = connect(&f, "ana");
        f.practice.step();

        let seat = f.practice.players.get("ana").unwrap();
        assert!(SPAWN_X.contains(&seat.player.body.x));
        assert!(SPAWN_Y.contains(&seat.player.body.y));
        assert_eq!(f.handle.active_players(), 1);

        let state = last_state(&mut rx).unwrap();
        assert_eq!(state["type"], "state");
        assert!(state["match"].is_null());
        assert_eq!(state["phase"], "practice");
        assert_eq!(state["players"][0]["name"], "ana");
    }

    #[test]
    fn input_drives_practice_car() {
        let mut f = fixture();
        let _rx = connect(&f, "ana");
        f.practice.step();
        let start_x = f.practice.players["ana"].player.body.x;

        assert!(f.handle.submit_input(
            "ana",
            InputSample {
                seq: 3,
                throttle: 1.0,
                ..InputSample::default()
            }
        ));
        for _ in 0..5 {
            f.practice.step();
        }

        let player = &f.practice.players["ana"].player;
        assert!(player.body.x > start_x);
        assert_eq!(player.last_applied_seq, 3);
        assert!(!f.handle.submit_input("ghost", InputSample::default()));
    }

    #[test]
    fn empty_field_resets_ball() {
        let mut f = fixture();
        f.practice.ball.body.x = 300.0;
        f.practice.ball.body.vx = 200.0;
        f.practice.step();

        let tuning = Tuning::default();
        assert_eq!(f.practice.ball.body, BallState::centered(&tuning).body);
        assert_eq!(f.handle.tick_count(), 1);
    }

    #[test]
    fn bound_players_are_excluded() {
        let mut f = fixture();
        let mut rx_a = connect(&f, "ana");
        let _rx_b = connect(&f, "bo");
        f.practice.step();
        assert_eq!(f.practice.players.len(), 2);
        last_state(&mut rx_a);

        f.bound.0.lock().insert("bo".into());
        f.practice.step();
        assert_eq!(f.practice.players.len(), 1);
        assert!(!f.handle.contains("bo"));

        let state = last_state(&mut rx_a).unwrap();
        let players = state["players"].as_array().unwrap();
        assert_eq!(players.len(), 1);
        assert_eq!(players[0]["name"], "ana");
    }

    #[test]
    fn failed_send_evicts_from_practice() {
        let mut f = fixture();
        let rx = connect(&f, "ana");
        let _rx_b = connect(&f, "bo");
        drop(rx);

        f.practice.step();
        assert!(!f.practice.players.contains_key("ana"));
        assert!(f.sessions.get("ana").is_none());
        assert!(f.practice.players.contains_key("bo"));
    }

    #[test]
    fn boost_reset_and_ball_pop_apply() {
        let mut f = fixture();
        let _rx = connect(&f, "ana");
        f.practice.step();
        f.practice.players.get_mut("ana").unwrap().player.boost_fuel = 10.0;

        f.handle.refill_boost("ana");
        f.handle.pop_ball();
        f.practice.step();

        assert_eq!(f.practice.players["ana"].player.boost_fuel, 100.0);
        assert!(f.practice.ball.body.z > 0.0);
    }

    #[test]
    fn leave_removes_player() {
        let mut f = fixture();
        let _rx = connect(&f, "ana");
        f.practice.step();
        f.handle.leave("ana");
        f.practice.step();
        assert!(f.practice.players.is_empty());
        assert_eq!(f.handle.active_players(), 0);
    }
}
