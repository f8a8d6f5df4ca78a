//! Matchmaking: queue, bindings and idle eviction

pub mod monitor;
pub mod queue;
pub mod service;

pub use monitor::ActivityMonitor;
pub use service::{JoinOutcome, Matchmaker};
