//! Car and ball integration for one fixed timestep
//!
//! Everything here is pure: no I/O, no locks, no clocks. Matches and the
//! practice loop call the same functions with the same [`Tuning`], so the
//! versus and single-player feel cannot drift apart.

use std::f32::consts::TAU;

use super::collision::resolve_field;
use super::InputSample;
use crate::util::time::tick_delta;

/// Heights at or below this count as touching the ground
pub const GROUND_EPSILON: f32 = 0.001;

/// Full boost tank
pub const MAX_BOOST: f32 = 100.0;

/// Gameplay tuning shared by every simulation context
#[derive(Debug, Clone, Copy)]
pub struct Tuning {
    /// Fixed timestep in seconds
    pub dt: f32,

    // Field geometry
    pub field_width: f32,
    pub field_height: f32,
    /// End-wall plane in front of the left goal
    pub goal_line_left: f32,
    /// End-wall plane in front of the right goal
    pub goal_line_right: f32,
    pub goal_mouth_top: f32,
    pub goal_mouth_bottom: f32,
    /// Side length of the square patches in each field corner
    pub corner_patch_size: f32,
    /// Distance of each kickoff spawn from the center line
    pub kickoff_offset: f32,

    // Hitboxes
    pub car_radius: f32,
    pub ball_radius: f32,
    /// Radius growth per unit of height, capped at double size
    pub height_scale_factor: f32,

    // Car drive
    pub base_accel: f32,
    pub boost_accel: f32,
    /// Fuel burned per second of boosting
    pub boost_drain: f32,
    /// Extra per-tick damping while braking
    pub brake_damping: f32,
    /// Speed held while braking with throttle
    pub creep_speed: f32,
    /// Per-tick damping while throttle opposes forward motion
    pub reverse_damping: f32,
    /// General damping rate (per second)
    pub damping_rate: f32,
    pub steer_base: f32,
    /// Speed at which steering responsiveness doubles
    pub steer_speed_ref: f32,
    pub brake_steer_scale: f32,
    pub max_car_speed: f32,

    // Vertical
    pub jump_velocity: f32,
    pub car_gravity: f32,
    pub ball_gravity: f32,

    // Ball
    /// Per-tick friction above `ball_friction_threshold`
    pub ball_friction_fast: f32,
    /// Per-tick friction at or below `ball_friction_threshold`
    pub ball_friction_slow: f32,
    pub ball_friction_threshold: f32,

    // Contacts
    pub wall_bounce: f32,
    /// Entities above this height cannot enter a goal mouth
    pub goal_entry_height: f32,
    /// Distance past the goal line the ball must clear to score
    pub goal_margin: f32,
    /// Maximum height difference for two entities to touch
    pub contact_z_band: f32,
    pub high_speed: f32,
    pub medium_speed: f32,
    pub high_transfer: f32,
    pub high_car_retain: f32,
    pub medium_transfer: f32,
    pub medium_car_retain: f32,
    pub ball_launch_velocity: f32,
    pub ball_restitution: f32,
    pub car_restitution: f32,

    /// Velocity components below this snap to zero
    pub snap_epsilon: f32,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            dt: tick_delta(),
            field_width: 1040.0,
            field_height: 600.0,
            goal_line_left: 120.0,
            goal_line_right: 920.0,
            goal_mouth_top: 210.0,
            goal_mouth_bottom: 390.0,
            corner_patch_size: 80.0,
            kickoff_offset: 260.0,
            car_radius: 24.0,
            ball_radius: 30.0,
            height_scale_factor: 0.12,
            base_accel: 700.0,
            boost_accel: 800.0,
            boost_drain: 80.0,
            brake_damping: 0.92,
            creep_speed: 180.0,
            reverse_damping: 0.75,
            damping_rate: 1.2,
            steer_base: 3.0,
            steer_speed_ref: 300.0,
            brake_steer_scale: 0.5,
            max_car_speed: 1100.0,
            jump_velocity: 42.0,
            car_gravity: 100.0,
            ball_gravity: 100.0,
            ball_friction_fast: 0.995,
            ball_friction_slow: 0.985,
            ball_friction_threshold: 20.0,
            wall_bounce: 0.5,
            goal_entry_height: 6.5,
            goal_margin: 4.0,
            contact_z_band: 3.0,
            high_speed: 400.0,
            medium_speed: 200.0,
            high_transfer: 1.3,
            high_car_retain: 0.3,
            medium_transfer: 1.1,
            medium_car_retain: 0.7,
            ball_launch_velocity: 60.0,
            ball_restitution: 0.8,
            car_restitution: 0.8,
            snap_epsilon: 1.0,
        }
    }
}

impl Tuning {
    pub fn center(&self) -> (f32, f32) {
        (self.field_width / 2.0, self.field_height / 2.0)
    }

    /// Hitbox growth for an entity at height `z`
    pub fn height_scale(&self, z: f32) -> f32 {
        1.0 + (z.max(0.0) * self.height_scale_factor).min(1.0)
    }
}

/// Position and velocity of a simulated entity
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Body {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub vx: f32,
    pub vy: f32,
    pub vz: f32,
}

impl Body {
    pub fn at(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            ..Self::default()
        }
    }

    pub fn horizontal_speed(&self) -> f32 {
        self.vx.hypot(self.vy)
    }

    pub fn is_grounded(&self) -> bool {
        self.z <= GROUND_EPSILON
    }

    pub fn is_finite(&self) -> bool {
        [self.x, self.y, self.z, self.vx, self.vy, self.vz]
            .iter()
            .all(|v| v.is_finite())
    }

    /// Zero out components too small to matter (stops micro-jitter)
    pub fn snap_velocity(&mut self, epsilon: f32) {
        for v in [&mut self.vx, &mut self.vy, &mut self.vz] {
            if v.abs() < epsilon {
                *v = 0.0;
            }
        }
    }

    fn cap_horizontal_speed(&mut self, max: f32) {
        let speed = self.horizontal_speed();
        if speed > max {
            let scale = max / speed;
            self.vx *= scale;
            self.vy *= scale;
        }
    }
}

/// Authoritative car state
#[derive(Debug, Clone)]
pub struct PlayerState {
    pub name: String,
    pub body: Body,
    /// Heading in radians, kept in `0..TAU`
    pub angle: f32,
    pub boost_fuel: f32,
    pub last_applied_seq: u32,
    /// One-shot jump request that survives until the car is next grounded
    pub pending_jump: bool,
    /// Set by a grounded jump; lets the next airborne boost engage hover
    pub hover_armed: bool,
    /// Hover lock; cleared only when boost is released
    pub boost_locked: bool,
    spawn: (f32, f32, f32),
}

impl PlayerState {
    pub fn new(name: impl Into<String>, x: f32, y: f32, angle: f32) -> Self {
        Self {
            name: name.into(),
            body: Body::at(x, y),
            angle: wrap_angle(angle),
            boost_fuel: MAX_BOOST,
            last_applied_seq: 0,
            pending_jump: false,
            hover_armed: false,
            boost_locked: false,
            spawn: (x, y, angle),
        }
    }

    /// Put the car at rest on the ground at the given pose (kickoff)
    pub fn place(&mut self, x: f32, y: f32, angle: f32) {
        self.body = Body::at(x, y);
        self.angle = wrap_angle(angle);
        self.pending_jump = false;
        self.hover_armed = false;
        self.boost_locked = false;
        self.spawn = (x, y, angle);
    }

    /// Return to the last placed pose, e.g. after a non-finite step
    pub fn respawn(&mut self) {
        let (x, y, angle) = self.spawn;
        self.place(x, y, angle);
    }

    /// Reset boost fuel to the maximum
    pub fn refill_boost(&mut self) {
        self.boost_fuel = MAX_BOOST;
    }

    fn drain_boost(&mut self, amount: f32) {
        self.boost_fuel = (self.boost_fuel - amount).clamp(0.0, MAX_BOOST);
    }

    pub fn radius(&self, tuning: &Tuning) -> f32 {
        tuning.car_radius * tuning.height_scale(self.body.z)
    }

    /// Unit vector of the heading
    pub fn facing(&self) -> (f32, f32) {
        (self.angle.cos(), self.angle.sin())
    }

    /// Turn the car to look at a point
    pub fn face_towards(&mut self, x: f32, y: f32) {
        let dx = x - self.body.x;
        let dy = y - self.body.y;
        if dx != 0.0 || dy != 0.0 {
            self.angle = wrap_angle(dy.atan2(dx));
        }
    }
}

/// Authoritative ball state
#[derive(Debug, Clone)]
pub struct BallState {
    pub body: Body,
}

impl BallState {
    pub fn centered(tuning: &Tuning) -> Self {
        let (x, y) = tuning.center();
        Self { body: Body::at(x, y) }
    }

    /// Back to center, at rest
    pub fn reset(&mut self, tuning: &Tuning) {
        *self = Self::centered(tuning);
    }

    pub fn radius(&self, tuning: &Tuning) -> f32 {
        tuning.ball_radius * tuning.height_scale(self.body.z)
    }

    /// Manual pop-up; only a grounded ball can be launched
    pub fn pop(&mut self, tuning: &Tuning) -> bool {
        if self.body.is_grounded() {
            self.body.vz = tuning.ball_launch_velocity;
            true
        } else {
            false
        }
    }
}

/// Normalize an angle into `0..TAU`
pub fn wrap_angle(angle: f32) -> f32 {
    angle.rem_euclid(TAU)
}

/// Advance one car by one tick using its latest input.
///
/// Order: hover lock bookkeeping, drive forces, steering, damping, position,
/// field contacts, vertical motion, velocity snap.
pub fn step_car(car: &mut PlayerState, input: &InputSample, tuning: &Tuning) {
    let dt = tuning.dt;
    let input = input.sanitized();
    let throttle = input.throttle;

    update_hover_lock(car, &input);

    let (fx, fy) = car.facing();
    let mut accel = tuning.base_accel * throttle * dt;

    if input.boost && car.boost_fuel > 0.0 && !car.boost_locked {
        accel += tuning.boost_accel * dt;
        car.drain_boost(tuning.boost_drain * dt);
    }

    // Brake overrides acceleration, never steering
    if input.brake {
        accel = 0.0;
        car.body.vx *= tuning.brake_damping;
        car.body.vy *= tuning.brake_damping;
        if throttle != 0.0 {
            let creep = tuning.creep_speed * throttle.signum();
            car.body.vx = fx * creep;
            car.body.vy = fy * creep;
        }
    }

    car.body.vx += fx * accel;
    car.body.vy += fy * accel;

    let speed = car.body.horizontal_speed();
    let mut steer_factor = tuning.steer_base * (1.0 + speed / tuning.steer_speed_ref);
    if input.brake {
        steer_factor *= tuning.brake_steer_scale;
    }
    car.angle = wrap_angle(car.angle + input.steer * steer_factor * dt);

    if !input.brake {
        let forward_velocity = fx * car.body.vx + fy * car.body.vy;
        let reversing = throttle != 0.0
            && throttle.signum() != forward_velocity.signum()
            && forward_velocity.abs() > 0.1;
        let damping = if reversing {
            tuning.reverse_damping
        } else {
            (1.0 - tuning.damping_rate * dt).max(0.0)
        };
        car.body.vx *= damping;
        car.body.vy *= damping;
    }

    car.body.cap_horizontal_speed(tuning.max_car_speed);

    car.body.x += car.body.vx * dt;
    car.body.y += car.body.vy * dt;

    let radius = car.radius(tuning);
    resolve_field(&mut car.body, radius, tuning);

    step_car_vertical(car, &input, tuning);

    car.body.snap_velocity(tuning.snap_epsilon);
}

/// Engage or release the hover lock before any force is applied
fn update_hover_lock(car: &mut PlayerState, input: &InputSample) {
    if car.boost_locked {
        if !input.boost {
            car.boost_locked = false;
        }
        return;
    }

    if !car.body.is_grounded() && car.hover_armed && input.boost && car.boost_fuel > 0.0 {
        car.boost_locked = true;
        car.hover_armed = false;
    }
}

fn step_car_vertical(car: &mut PlayerState, input: &InputSample, tuning: &Tuning) {
    let dt = tuning.dt;

    if car.body.is_grounded() && (input.jump || car.pending_jump) {
        car.body.vz = tuning.jump_velocity;
        car.pending_jump = false;
        car.hover_armed = true;
    }

    // Hover freezes vertical integration entirely
    if car.boost_locked {
        return;
    }

    car.body.vz -= tuning.car_gravity * dt;
    car.body.z += car.body.vz * dt;
    if car.body.z < 0.0 {
        car.body.z = 0.0;
        car.body.vz = 0.0;
        car.pending_jump = false;
        car.hover_armed = false;
    }
}

/// Advance the ball by one tick
pub fn step_ball(ball: &mut BallState, tuning: &Tuning) {
    let dt = tuning.dt;
    let body = &mut ball.body;

    // Less friction at speed keeps long shots floaty
    let friction = if body.horizontal_speed() > tuning.ball_friction_threshold {
        tuning.ball_friction_fast
    } else {
        tuning.ball_friction_slow
    };
    body.vx *= friction;
    body.vy *= friction;

    body.x += body.vx * dt;
    body.y += body.vy * dt;

    body.vz -= tuning.ball_gravity * dt;
    body.z += body.vz * dt;
    if body.z < 0.0 {
        body.z = 0.0;
        body.vz = 0.0;
    }

    let radius = ball.radius(tuning);
    resolve_field(&mut ball.body, radius, tuning);

    ball.body.snap_velocity(tuning.snap_epsilon);
}
