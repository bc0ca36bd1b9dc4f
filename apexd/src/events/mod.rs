//! Event system: broadcast bus, event vocabulary, JSONL logger

mod bus;
mod logger;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, create_event_bus};
pub use logger::{EVENT_LOG_FILE, spawn_event_logger};
pub use types::{Event, RestoreReason};
