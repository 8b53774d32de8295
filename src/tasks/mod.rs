mod demo;
mod heartbeat;

pub use demo::DemoTicker;
pub use heartbeat::{HeartbeatRound, HeartbeatTask};
