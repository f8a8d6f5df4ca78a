//! Snapshot building and broadcast cadence

use uuid::Uuid;

use crate::util::time::ticks_to_millis;
use crate::ws::protocol::{BallSnapshot, PlayerSnapshot, ServerMsg, SnapshotPhase, StateSnapshot};

use super::physics::{BallState, PlayerState};

/// Scalar part of a snapshot, filled by the owning context
#[derive(Debug, Clone, Copy)]
pub struct SnapshotHeader {
    pub match_id: Option<Uuid>,
    pub tick: u64,
    pub phase: SnapshotPhase,
    pub countdown_ticks: u32,
    pub timer_ticks: u32,
    pub score_a: u32,
    pub score_b: u32,
}

impl SnapshotHeader {
    /// Header for the shared practice field
    pub fn practice(tick: u64) -> Self {
        Self {
            match_id: None,
            tick,
            phase: SnapshotPhase::Practice,
            countdown_ticks: 0,
            timer_ticks: 0,
            score_a: 0,
            score_b: 0,
        }
    }
}

/// Builds snapshots for network transmission
pub struct SnapshotBuilder {
    /// Tick counter since last snapshot
    ticks_since_snapshot: u32,
    /// Snapshot interval in ticks
    snapshot_interval: u32,
}

impl SnapshotBuilder {
    pub fn new(snapshot_interval: u32) -> Self {
        let snapshot_interval = snapshot_interval.max(1);
        Self {
            // First tick always broadcasts
            ticks_since_snapshot: snapshot_interval - 1,
            snapshot_interval,
        }
    }

    /// Check if it's time to send a snapshot
    pub fn should_send(&mut self) -> bool {
        self.ticks_since_snapshot += 1;
        if self.ticks_since_snapshot >= self.snapshot_interval {
            self.ticks_since_snapshot = 0;
            true
        } else {
            false
        }
    }

    /// Force snapshot on next check (used for important events)
    pub fn force_next(&mut self) {
        self.ticks_since_snapshot = self.snapshot_interval;
    }

    /// Build a state message
    pub fn build<'a, I>(&self, header: SnapshotHeader, ball: &BallState, players: I) -> ServerMsg
    where
        I: IntoIterator<Item = &'a PlayerState>,
    {
        let players = players
            .into_iter()
            .map(|p| PlayerSnapshot {
                name: p.name.clone(),
                x: p.body.x,
                y: p.body.y,
                z: p.body.z,
                angle: p.angle,
                boost_fuel: p.boost_fuel,
                last_seq: p.last_applied_seq,
            })
            .collect();

        ServerMsg::State(StateSnapshot {
            match_id: header.match_id,
            tick: header.tick,
            phase: header.phase,
            countdown_ms: ticks_to_millis(header.countdown_ticks),
            timer_ms: ticks_to_millis(header.timer_ticks),
            score_a: header.score_a,
            score_b: header.score_b,
            ball: BallSnapshot {
                x: ball.body.x,
                y: ball.body.y,
                z: ball.body.z,
            },
            players,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::physics::Tuning;

    #[test]
    fn cadence_follows_interval() {
        let mut builder = SnapshotBuilder::new(3);
        let sent: Vec<bool> = (0..6).map(|_| builder.should_send()).collect();
        assert_eq!(sent, vec![true, false, false, true, false, false]);

        builder.force_next();
        assert!(builder.should_send());
    }

    #[test]
    fn every_tick_when_interval_is_one() {
        let mut builder = SnapshotBuilder::new(1);
        assert!((0..5).all(|_| builder.should_send()));
    }

    #[test]
    fn build_converts_timers_to_millis() {
        let tuning = Tuning::default();
        let builder = SnapshotBuilder::new(1);
        let player = PlayerState::new("ana", 10.0, 20.0, 0.0);
        let ball = BallState::centered(&tuning);
        let header = SnapshotHeader {
            match_id: Some(Uuid::new_v4()),
            tick: 42,
            phase: SnapshotPhase::Countdown,
            countdown_ticks: 90,
            timer_ticks: 5400,
            score_a: 0,
            score_b: 0,
        };

        let ServerMsg::State(state) = builder.build(header, &ball, [&player]) else {
            panic!("expected state");
        };
        assert_eq!(state.countdown_ms, 3000);
        assert_eq!(state.timer_ms, 180_000);
        assert_eq!(state.players.len(), 1);
        assert_eq!(state.players[0].name, "ana");
        assert_eq!(state.ball.x, 520.0);
    }
}
