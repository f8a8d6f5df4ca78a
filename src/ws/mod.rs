//! WebSocket transport: wire types, per-connection sessions and the upgrade handler

pub mod handler;
pub mod protocol;
pub mod session;
