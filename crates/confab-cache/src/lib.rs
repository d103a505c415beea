pub mod turns;

pub use turns::{CachedTurn, TurnCache};
