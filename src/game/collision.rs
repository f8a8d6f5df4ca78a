//! Field geometry and contact resolution

use super::physics::{BallState, Body, PlayerState, Tuning};

/// Clearance left between a resolved entity and the obstacle it touched
const CONTACT_SKIN: f32 = 0.1;

/// Distances below this are treated as coincident centers
const COINCIDENT: f32 = 1e-4;

/// Which goal (by field end) the ball went into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalSide {
    Left,
    Right,
}

/// How a car-ball contact transferred momentum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactRegime {
    /// Hard hit: most of the car's velocity goes into the ball
    High,
    /// Medium hit: ball picks up a little more than the car's velocity
    Medium,
    /// Slow touch: normal components exchanged with restitution
    Elastic,
}

/// Axis-aligned rectangular obstacle
#[derive(Debug, Clone, Copy)]
struct Rect {
    x: f32,
    y: f32,
    w: f32,
    h: f32,
}

impl Rect {
    /// Nearest edge point and outward normal for a point inside the rect
    fn exit(&self, px: f32, py: f32) -> (f32, f32, f32, f32) {
        let left = px - self.x;
        let right = self.x + self.w - px;
        let top = py - self.y;
        let bottom = self.y + self.h - py;
        let min = left.min(right).min(top).min(bottom);

        if min == left {
            (self.x, py, -1.0, 0.0)
        } else if min == right {
            (self.x + self.w, py, 1.0, 0.0)
        } else if min == top {
            (px, self.y, 0.0, -1.0)
        } else {
            (px, self.y + self.h, 0.0, 1.0)
        }
    }
}

/// Square patches filling the field corners beside each goal line
fn corner_patches(t: &Tuning) -> [Rect; 4] {
    let s = t.corner_patch_size;
    let left = t.goal_line_left;
    let right = t.goal_line_right - s;
    let bottom = t.field_height - s;
    [
        Rect { x: left, y: 0.0, w: s, h: s },
        Rect { x: right, y: 0.0, w: s, h: s },
        Rect { x: left, y: bottom, w: s, h: s },
        Rect { x: right, y: bottom, w: s, h: s },
    ]
}

/// Place a body just outside a contact point and reflect any approaching
/// normal velocity.
fn push_out(body: &mut Body, radius: f32, px: f32, py: f32, nx: f32, ny: f32, bounce: f32) {
    body.x = px + nx * (radius + CONTACT_SKIN);
    body.y = py + ny * (radius + CONTACT_SKIN);

    let vn = body.vx * nx + body.vy * ny;
    if vn < 0.0 {
        body.vx -= (1.0 + bounce) * vn * nx;
        body.vy -= (1.0 + bounce) * vn * ny;
    }
}

fn resolve_rect(body: &mut Body, radius: f32, rect: &Rect, bounce: f32) -> bool {
    let cx = body.x.clamp(rect.x, rect.x + rect.w);
    let cy = body.y.clamp(rect.y, rect.y + rect.h);
    let dx = body.x - cx;
    let dy = body.y - cy;
    let dist_sq = dx * dx + dy * dy;
    if dist_sq > radius * radius {
        return false;
    }

    let dist = dist_sq.sqrt();
    let (px, py, nx, ny) = if dist > COINCIDENT {
        (cx, cy, dx / dist, dy / dist)
    } else {
        rect.exit(body.x, body.y)
    };
    push_out(body, radius, px, py, nx, ny, bounce);
    true
}

fn resolve_point(body: &mut Body, radius: f32, px: f32, py: f32, bounce: f32) -> bool {
    let dx = body.x - px;
    let dy = body.y - py;
    let dist = dx.hypot(dy);
    if dist >= radius {
        return false;
    }

    let (nx, ny) = if dist > COINCIDENT {
        (dx / dist, dy / dist)
    } else {
        // Straight back into the field
        if px < body.x { (1.0, 0.0) } else { (-1.0, 0.0) }
    };
    push_out(body, radius, px, py, nx, ny, bounce);
    true
}

/// Goal line, goal pocket, and posts for one end of the field.
///
/// `prev_x` is where the body was before this tick's move. The entry
/// height only gates bodies coming from the field side; anything already
/// in the pocket stays there at any height.
fn resolve_end(body: &mut Body, radius: f32, prev_x: f32, side: GoalSide, t: &Tuning) {
    let bounce = t.wall_bounce;
    // `dir` points from the end wall into the field
    let (line, back, dir) = match side {
        GoalSide::Left => (t.goal_line_left, 0.0, 1.0),
        GoalSide::Right => (t.goal_line_right, t.field_width, -1.0),
    };

    let beyond = (line - body.x) * dir;
    let was_beyond = (line - prev_x) * dir > 0.0;
    let within_mouth = body.y > t.goal_mouth_top && body.y < t.goal_mouth_bottom;
    let low = body.z <= t.goal_entry_height;
    let in_pocket = beyond > 0.0 && within_mouth && (low || was_beyond);

    if in_pocket {
        if (body.x - back) * dir < radius {
            push_out(body, radius, back, body.y, dir, 0.0, bounce);
        }
        if body.y - radius < t.goal_mouth_top {
            push_out(body, radius, body.x, t.goal_mouth_top, 0.0, 1.0, bounce);
        }
        if body.y + radius > t.goal_mouth_bottom {
            push_out(body, radius, body.x, t.goal_mouth_bottom, 0.0, -1.0, bounce);
        }
    } else {
        let mouth_open = low && within_mouth;
        if !mouth_open && (body.x - line) * dir < radius {
            push_out(body, radius, line, body.y, dir, 0.0, bounce);
        }
    }

    for post_y in [t.goal_mouth_top, t.goal_mouth_bottom] {
        resolve_point(body, radius, line, post_y, bounce);
    }
}

/// Keep a body inside the playable area: side walls, corner patches,
/// end walls, goal pockets and posts.
pub fn resolve_field(body: &mut Body, radius: f32, t: &Tuning) {
    let bounce = t.wall_bounce;
    // Called right after the position update
    let prev_x = body.x - body.vx * t.dt;

    for patch in corner_patches(t) {
        resolve_rect(body, radius, &patch, bounce);
    }

    resolve_end(body, radius, prev_x, GoalSide::Left, t);
    resolve_end(body, radius, prev_x, GoalSide::Right, t);

    if body.y - radius < 0.0 {
        push_out(body, radius, body.x, 0.0, 0.0, 1.0, bounce);
    }
    if body.y + radius > t.field_height {
        push_out(body, radius, body.x, t.field_height, 0.0, -1.0, bounce);
    }
}

/// Ball fully past a goal line (with margin) while low enough to be in the
/// mouth.
pub fn goal_crossed(ball: &BallState, t: &Tuning) -> Option<GoalSide> {
    if ball.body.z > t.goal_entry_height {
        return None;
    }
    let r = ball.radius(t);
    if ball.body.x + r < t.goal_line_left - t.goal_margin {
        Some(GoalSide::Left)
    } else if ball.body.x - r > t.goal_line_right + t.goal_margin {
        Some(GoalSide::Right)
    } else {
        None
    }
}

/// Check overlap between two circles
pub fn circles_overlap(x1: f32, y1: f32, r1: f32, x2: f32, y2: f32, r2: f32) -> bool {
    let dx = x2 - x1;
    let dy = y2 - y1;
    let combined = r1 + r2;
    dx * dx + dy * dy < combined * combined
}

/// Resolve a car touching the ball.
///
/// Only the ball is repositioned. Momentum transfer happens only while the
/// car approaches the ball along the contact normal; which regime applies is
/// picked from the car's horizontal speed (a braking car always gets the
/// elastic touch).
pub fn resolve_car_ball(
    car: &mut PlayerState,
    ball: &mut BallState,
    braking: bool,
    t: &Tuning,
) -> Option<ContactRegime> {
    if (car.body.z - ball.body.z).abs() >= t.contact_z_band {
        return None;
    }

    let min_dist = car.radius(t) + ball.radius(t);
    let dx = ball.body.x - car.body.x;
    let dy = ball.body.y - car.body.y;
    let dist = dx.hypot(dy);
    if dist >= min_dist {
        return None;
    }

    let (nx, ny) = if dist > COINCIDENT {
        (dx / dist, dy / dist)
    } else {
        car.facing()
    };

    ball.body.x = car.body.x + nx * (min_dist + CONTACT_SKIN);
    ball.body.y = car.body.y + ny * (min_dist + CONTACT_SKIN);

    let closing = (car.body.vx - ball.body.vx) * nx + (car.body.vy - ball.body.vy) * ny;
    if closing <= 0.0 {
        return None;
    }

    let speed = car.body.horizontal_speed();
    let regime = if !braking && speed > t.high_speed {
        ContactRegime::High
    } else if !braking && speed > t.medium_speed {
        ContactRegime::Medium
    } else {
        ContactRegime::Elastic
    };

    match regime {
        ContactRegime::High => {
            let launch = ball.body.is_grounded();
            ball.body.vx += car.body.vx * t.high_transfer;
            ball.body.vy += car.body.vy * t.high_transfer;
            car.body.vx *= t.high_car_retain;
            car.body.vy *= t.high_car_retain;
            if launch {
                ball.body.vz = t.ball_launch_velocity;
            }
        }
        ContactRegime::Medium => {
            ball.body.vx += car.body.vx * t.medium_transfer;
            ball.body.vy += car.body.vy * t.medium_transfer;
            car.body.vx *= t.medium_car_retain;
            car.body.vy *= t.medium_car_retain;
        }
        ContactRegime::Elastic => {
            let car_n = car.body.vx * nx + car.body.vy * ny;
            let ball_n = ball.body.vx * nx + ball.body.vy * ny;
            let e = t.ball_restitution;
            let ball_delta = car_n * e - ball_n;
            let car_delta = ball_n * e - car_n;
            ball.body.vx += ball_delta * nx;
            ball.body.vy += ball_delta * ny;
            car.body.vx += car_delta * nx;
            car.body.vy += car_delta * ny;
        }
    }

    Some(regime)
}

/// Resolve two cars overlapping. Both move half the overlap apart; normal
/// velocities are exchanged only while they approach each other.
pub fn resolve_car_car(a: &mut PlayerState, b: &mut PlayerState, t: &Tuning) -> bool {
    if (a.body.z - b.body.z).abs() >= t.contact_z_band {
        return false;
    }

    let (ra, rb) = (a.radius(t), b.radius(t));
    if !circles_overlap(a.body.x, a.body.y, ra, b.body.x, b.body.y, rb) {
        return false;
    }

    let min_dist = ra + rb;
    let dx = b.body.x - a.body.x;
    let dy = b.body.y - a.body.y;
    let dist = dx.hypot(dy);

    let (nx, ny) = if dist > COINCIDENT {
        (dx / dist, dy / dist)
    } else {
        (1.0, 0.0)
    };

    let push = (min_dist - dist) / 2.0;
    a.body.x -= nx * push;
    a.body.y -= ny * push;
    b.body.x += nx * push;
    b.body.y += ny * push;

    let va = a.body.vx * nx + a.body.vy * ny;
    let vb = b.body.vx * nx + b.body.vy * ny;
    if va - vb > 0.0 {
        let e = t.car_restitution;
        let a_delta = vb * e - va;
        let b_delta = va * e - vb;
        a.body.vx += a_delta * nx;
        a.body.vy += a_delta * ny;
        b.body.vx += b_delta * nx;
        b.body.vy += b_delta * ny;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::physics::{step_ball, step_car};
    use crate::game::InputSample;

    fn tuning() -> Tuning {
        Tuning::default()
    }

    #[test]
    fn side_wall_bounces_and_damps() {
        let t = tuning();
        let mut body = Body::at(500.0, 10.0);
        body.vy = -200.0;
        resolve_field(&mut body, 30.0, &t);
        assert!((body.y - 30.1).abs() < 1e-3);
        assert!((body.vy - 100.0).abs() < 1e-3);
    }

    #[test]
    fn angled_side_wall_hit_keeps_tangent() {
        let t = tuning();
        let mut body = Body::at(500.0, 10.0);
        body.vx = 150.0;
        body.vy = -200.0;
        resolve_field(&mut body, 30.0, &t);
        assert_eq!(body.vx, 150.0);
        assert!((body.vy - 200.0 * t.wall_bounce).abs() < 1e-3);
    }

    #[test]
    fn angled_corner_patch_hit_keeps_tangent() {
        let t = tuning();
        // Overlapping the top-left patch's right edge (x = 200) from the field
        let mut body = Body::at(215.0, 40.0);
        body.vx = -100.0;
        body.vy = 60.0;
        resolve_field(&mut body, 24.0, &t);
        assert!((body.x - (200.0 + 24.0 + CONTACT_SKIN)).abs() < 1e-3);
        assert_eq!(body.y, 40.0);
        assert!((body.vx - 100.0 * t.wall_bounce).abs() < 1e-3);
        assert_eq!(body.vy, 60.0);
    }

    #[test]
    fn separating_body_keeps_velocity() {
        let t = tuning();
        let mut body = Body::at(500.0, 10.0);
        body.vy = 50.0;
        resolve_field(&mut body, 30.0, &t);
        assert_eq!(body.vy, 50.0);
        assert!(body.y >= 30.0);
    }

    #[test]
    fn end_wall_blocks_outside_mouth() {
        let t = tuning();
        let mut body = Body::at(130.0, 150.0);
        body.vx = -300.0;
        resolve_field(&mut body, 24.0, &t);
        assert!(body.x >= t.goal_line_left + 24.0);
        assert!(body.vx > 0.0);
    }

    #[test]
    fn low_ball_enters_goal_mouth() {
        let t = tuning();
        let mut body = Body::at(110.0, 300.0);
        body.vx = -300.0;
        resolve_field(&mut body, 30.0, &t);
        assert_eq!(body.x, 110.0);
        assert_eq!(body.vx, -300.0);
    }

    #[test]
    fn high_ball_is_blocked_at_goal_line() {
        let t = tuning();
        let mut body = Body::at(130.0, 300.0);
        body.z = 20.0;
        body.vx = -300.0;
        resolve_field(&mut body, 30.0, &t);
        assert!(body.x >= t.goal_line_left + 30.0);
        assert!(body.vx > 0.0);
    }

    #[test]
    fn high_ball_crossing_the_line_this_tick_is_blocked() {
        let t = tuning();
        let mut body = Body::at(110.0, 300.0);
        body.z = 20.0;
        body.vx = -300.0;
        resolve_field(&mut body, 30.0, &t);
        assert!(body.x >= t.goal_line_left + 30.0);
        assert!(body.vx > 0.0);
    }

    #[test]
    fn popped_ball_stays_in_the_pocket() {
        let t = tuning();
        let mut ball = BallState::centered(&t);
        ball.body.x = 100.0;
        ball.body.y = 300.0;
        assert!(ball.pop(&t));

        let mut peak = 0.0f32;
        for tick in 0..60 {
            step_ball(&mut ball, &t);
            peak = peak.max(ball.body.z);
            assert!(
                ball.body.x < t.goal_line_left,
                "tick {tick}: ball left the pocket at x={} z={}",
                ball.body.x,
                ball.body.z
            );
        }
        assert!(peak > t.goal_entry_height);
    }

    #[test]
    fn car_jumping_in_the_pocket_stays_there() {
        let t = tuning();
        let mut car = PlayerState::new("keeper", 100.0, 300.0, 0.0);
        let jump = InputSample {
            seq: 1,
            jump: true,
            ..InputSample::default()
        };

        let mut peak = 0.0f32;
        for tick in 0..60 {
            step_car(&mut car, &jump, &t);
            peak = peak.max(car.body.z);
            assert!(
                car.body.x < t.goal_line_left,
                "tick {tick}: car left the pocket at x={} z={}",
                car.body.x,
                car.body.z
            );
        }
        assert!(peak > t.goal_entry_height);
    }

    #[test]
    fn pocket_back_wall_holds_ball() {
        let t = tuning();
        let mut body = Body::at(20.0, 300.0);
        body.vx = -100.0;
        resolve_field(&mut body, 30.0, &t);
        assert!(body.x >= 30.0);
        assert!(body.vx > 0.0);
    }

    #[test]
    fn corner_patch_pushes_out() {
        let t = tuning();
        // Inside the top-left patch, nearest to its right edge
        let mut body = Body::at(195.0, 40.0);
        body.vx = -100.0;
        resolve_field(&mut body, 24.0, &t);
        assert!(body.x >= 200.0 + 24.0);
    }

    #[test]
    fn post_deflects_glancing_ball() {
        let t = tuning();
        let mut body = Body::at(t.goal_line_left + 10.0, t.goal_mouth_top + 5.0);
        resolve_field(&mut body, 30.0, &t);
        let dx = body.x - t.goal_line_left;
        let dy = body.y - t.goal_mouth_top;
        assert!(dx.hypot(dy) >= 30.0);
    }

    #[test]
    fn goal_needs_full_clearance_and_low_ball() {
        let t = tuning();
        let mut ball = BallState::centered(&t);

        ball.body.x = t.goal_line_left - 30.0;
        assert_eq!(goal_crossed(&ball, &t), None);

        ball.body.x = t.goal_line_left - 40.0;
        assert_eq!(goal_crossed(&ball, &t), Some(GoalSide::Left));

        ball.body.z = 10.0;
        assert_eq!(goal_crossed(&ball, &t), None);

        ball.body.z = 0.0;
        ball.body.x = t.goal_line_right + 40.0;
        assert_eq!(goal_crossed(&ball, &t), Some(GoalSide::Right));
    }

    #[test]
    fn high_speed_hit_transfers_and_launches() {
        let t = tuning();
        let mut car = PlayerState::new("a", 400.0, 300.0, 0.0);
        car.body.vx = 500.0;
        let mut ball = BallState::centered(&t);
        ball.body.x = 450.0;

        let regime = resolve_car_ball(&mut car, &mut ball, false, &t);
        assert_eq!(regime, Some(ContactRegime::High));
        assert!((ball.body.vx - 650.0).abs() < 1e-3);
        assert!((car.body.vx - 150.0).abs() < 1e-3);
        assert_eq!(ball.body.vz, t.ball_launch_velocity);
        assert!(!circles_overlap(
            car.body.x,
            car.body.y,
            car.radius(&t),
            ball.body.x,
            ball.body.y,
            ball.radius(&t)
        ));
    }

    #[test]
    fn kickoff_drive_at_speed_hits_hard() {
        let t = tuning();
        let (cx, cy) = t.center();
        let mut car = PlayerState::new("a", cx - t.kickoff_offset, cy, 0.0);
        let mut ball = BallState::centered(&t);
        let drive = InputSample {
            seq: 1,
            throttle: 1.0,
            boost: true,
            ..InputSample::default()
        };

        let mut hit = None;
        for _ in 0..120 {
            step_car(&mut car, &drive, &t);
            let before = car.body.vx;
            if let Some(regime) = resolve_car_ball(&mut car, &mut ball, false, &t) {
                hit = Some((regime, before));
                break;
            }
        }

        let (regime, car_speed) = hit.expect("car should reach the ball");
        assert!(car_speed > t.high_speed);
        assert_eq!(regime, ContactRegime::High);
        assert!((ball.body.vx - car_speed * t.high_transfer).abs() < 1e-2);
        assert!(ball.body.vz > 0.0);
    }

    #[test]
    fn braking_car_only_nudges() {
        let t = tuning();
        let mut car = PlayerState::new("a", 400.0, 300.0, 0.0);
        car.body.vx = 500.0;
        let mut ball = BallState::centered(&t);
        ball.body.x = 450.0;

        let regime = resolve_car_ball(&mut car, &mut ball, true, &t);
        assert_eq!(regime, Some(ContactRegime::Elastic));
        assert!((ball.body.vx - 400.0).abs() < 1e-3);
        assert_eq!(ball.body.vz, 0.0);
    }

    #[test]
    fn ball_out_of_vertical_band_is_untouched() {
        let t = tuning();
        let mut car = PlayerState::new("a", 400.0, 300.0, 0.0);
        car.body.vx = 500.0;
        let mut ball = BallState::centered(&t);
        ball.body.x = 450.0;
        ball.body.z = 10.0;

        assert_eq!(resolve_car_ball(&mut car, &mut ball, false, &t), None);
        assert_eq!(ball.body.vx, 0.0);
    }

    #[test]
    fn receding_car_moves_ball_without_impulse() {
        let t = tuning();
        let mut car = PlayerState::new("a", 400.0, 300.0, 0.0);
        car.body.vx = -300.0;
        let mut ball = BallState::centered(&t);
        ball.body.x = 440.0;

        assert_eq!(resolve_car_ball(&mut car, &mut ball, false, &t), None);
        assert_eq!(ball.body.vx, 0.0);
        assert!(ball.body.x >= 400.0 + 54.0);
        assert_eq!(car.body.x, 400.0);
    }

    #[test]
    fn cars_split_overlap_and_exchange() {
        let t = tuning();
        let mut a = PlayerState::new("a", 300.0, 300.0, 0.0);
        let mut b = PlayerState::new("b", 340.0, 300.0, 0.0);
        a.body.vx = 200.0;

        assert!(resolve_car_car(&mut a, &mut b, &t));
        assert!((b.body.x - a.body.x - 48.0).abs() < 1e-3);
        assert!((a.body.x - 296.0).abs() < 1e-3);
        assert!((b.body.vx - 160.0).abs() < 1e-3);
        assert!(a.body.vx.abs() < 1e-3);
    }
}
