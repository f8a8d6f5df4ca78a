//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::r#match::MatchPhase;
use crate::game::InputSample;

/// Messages sent from client to server
///
/// Every field is optional on the wire; missing values fall back to neutral
/// defaults. The `name` carried by non-join messages is accepted for
/// compatibility but the connection's identity comes from its first join.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMsg {
    /// Enter matchmaking (and the practice field while waiting)
    Join {
        #[serde(default, deserialize_with = "lenient::string")]
        name: String,
    },

    /// Latest control state
    Input {
        #[serde(default, deserialize_with = "lenient::string")]
        name: String,
        /// Client sequence number, echoed back as `lastSeq`
        #[serde(default, deserialize_with = "lenient::seq")]
        seq: u32,
        /// -1.0 = full reverse, 1.0 = full forward
        #[serde(default, deserialize_with = "lenient::axis")]
        throttle: f32,
        /// -1.0 = full left, 1.0 = full right
        #[serde(default, deserialize_with = "lenient::axis")]
        steer: f32,
        #[serde(default, deserialize_with = "lenient::flag")]
        jump: bool,
        #[serde(default, deserialize_with = "lenient::flag")]
        boost: bool,
        #[serde(default, deserialize_with = "lenient::flag")]
        brake: bool,
    },

    /// Refill this player's boost tank
    BoostReset {
        #[serde(default, deserialize_with = "lenient::string")]
        name: String,
    },

    /// Pop the ball up if it is on the ground
    BallJump {
        #[serde(default, deserialize_with = "lenient::string")]
        name: String,
    },

    /// Anything else is ignored
    #[serde(other)]
    Unknown,
}

impl ClientMsg {
    /// Control sample for an `input` message
    pub fn as_input(&self) -> Option<InputSample> {
        match *self {
            ClientMsg::Input {
                seq,
                throttle,
                steer,
                jump,
                boost,
                brake,
                ..
            } => Some(InputSample {
                seq,
                throttle,
                steer,
                jump,
                boost,
                brake,
            }),
            _ => None,
        }
    }
}

/// Per-field fallbacks for inbound messages.
///
/// A null or mistyped field becomes its neutral value instead of failing
/// the whole message; numeric strings are read as numbers.
mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => String::new(),
        })
    }

    pub fn axis<'de, D: Deserializer<'de>>(d: D) -> Result<f32, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Number(n) => n.as_f64().unwrap_or(0.0) as f32,
            Value::String(s) => s.trim().parse().unwrap_or(0.0),
            _ => 0.0,
        })
    }

    pub fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Bool(b) => b,
            Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
            Value::String(s) => s.trim().eq_ignore_ascii_case("true"),
            _ => false,
        })
    }

    /// Sequence numbers saturate into `0..=u32::MAX`
    pub fn seq<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        let raw = match Value::deserialize(d)? {
            Value::Number(n) => n.as_f64().unwrap_or(0.0),
            Value::String(s) => s.trim().parse().unwrap_or(0.0),
            _ => 0.0,
        };
        Ok(if raw.is_finite() {
            raw.clamp(0.0, u32::MAX as f64) as u32
        } else {
            0
        })
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMsg {
    /// Paired with an opponent; a match has been created
    Matched {
        #[serde(rename = "match")]
        match_id: Uuid,
        name: String,
        opponent: String,
        /// Both players in slot order (A first)
        players: Vec<String>,
    },

    /// World state for one tick
    State(StateSnapshot),

    /// Final score; no more state follows for this match
    #[serde(rename = "gameover")]
    GameOver {
        #[serde(rename = "scoreA")]
        score_a: u32,
        #[serde(rename = "scoreB")]
        score_b: u32,
        /// Winning player's name, `None` on a draw
        winner: Option<String>,
    },

    /// Request rejected
    Error { code: String, message: String },
}

impl ServerMsg {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMsg::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Phase label carried by every state snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SnapshotPhase {
    /// Shared practice field, not a match
    Practice,
    Waiting,
    Countdown,
    Live,
    Overtime,
    #[serde(rename = "gameover")]
    GameOver,
}

impl From<MatchPhase> for SnapshotPhase {
    fn from(phase: MatchPhase) -> Self {
        match phase {
            MatchPhase::Waiting => Self::Waiting,
            MatchPhase::Countdown => Self::Countdown,
            MatchPhase::Live => Self::Live,
            MatchPhase::Overtime => Self::Overtime,
            MatchPhase::GameOver => Self::GameOver,
        }
    }
}

/// Full world state for one tick
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    /// Match id, `null` on the practice field
    #[serde(rename = "match")]
    pub match_id: Option<Uuid>,
    pub tick: u64,
    pub phase: SnapshotPhase,
    pub countdown_ms: u64,
    pub timer_ms: u64,
    #[serde(rename = "scoreA")]
    pub score_a: u32,
    #[serde(rename = "scoreB")]
    pub score_b: u32,
    pub ball: BallSnapshot,
    pub players: Vec<PlayerSnapshot>,
}

/// Ball position
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BallSnapshot {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Per-player state in a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSnapshot {
    pub name: String,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub angle: f32,
    pub boost_fuel: f32,
    /// Last input sequence applied (for client reconciliation)
    pub last_seq: u32,
}
