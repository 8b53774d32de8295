//! API layer - HTTP endpoint handlers organized by domain.

mod channels;
mod events;
mod health;
mod routes;

pub use channels::{get_channel, get_channel_users, list_channels};
pub use events::{trigger_event, TriggerEventRequest, TriggerEventResponse};
pub use health::{health, stats};
pub use routes::api_routes;
