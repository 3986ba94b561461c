//! Heartbeat gossip: wire payload, announce loop and receive-side gate.
pub mod announcer;
pub mod codec;
pub mod validator;

pub use announcer::{AnnounceSchedule, Announcer};
pub use codec::Heartbeat;
pub use validator::HeartbeatValidator;
