//! Outbound data sinks

pub mod positions;

pub use positions::{PositionLog, PositionWriter};
