//! Game simulation modules

pub mod collision;
pub mod r#match;
pub mod physics;
pub mod practice;
pub mod snapshot;

pub use practice::{PracticeHandle, PracticeLoop};
pub use r#match::{GameMatch, MatchHandle, MatchObserver, MatchRegistry};

use parking_lot::Mutex;

/// Controls for a single tick (processed from `ClientMsg::Input`)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InputSample {
    pub seq: u32,
    pub throttle: f32,
    pub steer: f32,
    pub jump: bool,
    pub boost: bool,
    pub brake: bool,
}

impl InputSample {
    /// Clamp analog axes into `-1..=1`; non-finite values become neutral
    pub fn sanitized(&self) -> Self {
        Self {
            throttle: clamp_axis(self.throttle),
            steer: clamp_axis(self.steer),
            ..*self
        }
    }
}

fn clamp_axis(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Latest-input cell shared between a connection and the simulation.
///
/// Connections overwrite, the tick reads. A jump press is latched separately
/// so a tap that lands between two ticks is not lost.
#[derive(Debug, Default)]
pub struct InputSlot {
    inner: Mutex<SlotState>,
}

#[derive(Debug, Default)]
struct SlotState {
    latest: InputSample,
    jump_requested: bool,
}

impl InputSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current input
    pub fn store(&self, sample: InputSample) {
        let mut state = self.inner.lock();
        if sample.jump {
            state.jump_requested = true;
        }
        state.latest = sample;
    }

    /// Latest input plus whether a jump was requested since the last take
    pub fn take(&self) -> (InputSample, bool) {
        let mut state = self.inner.lock();
        let jump = std::mem::take(&mut state.jump_requested);
        (state.latest, jump)
    }

    /// Release held controls, keeping the sequence number
    pub fn clear(&self) {
        let mut state = self.inner.lock();
        let seq = state.latest.seq;
        *state = SlotState::default();
        state.latest.seq = seq;
    }
}
