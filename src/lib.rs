pub mod config;
pub mod engine;
pub mod events;
pub mod networking;

pub use config::Settings;
pub use engine::{AvatarSource, Engine};
pub use events::{EngineEvent, EventReceiver};
