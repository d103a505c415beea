pub mod config;
pub mod error;
pub mod types;

pub use config::ConfabConfig;
pub use error::ConfigError;
pub use types::{ContentType, Conversation, Message, Persona, Role};
