pub mod client;
pub mod multiplexer;
pub mod replay;

pub use client::{ConsoleClient, ConsoleConnectionError, DETACH_KEY};
pub use multiplexer::{ConsoleListenerError, ConsoleMultiplexer};
pub use replay::{AnsiStripper, REPLAY_CAPACITY, ReplayBuffer};
