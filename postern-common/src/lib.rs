pub mod address;
pub mod config;
pub mod context;
pub mod controller;
pub mod dns;
pub mod envelope;
pub mod error;
pub mod gate;
pub mod listener;
pub mod logging;
pub mod status;
pub mod traits;

pub use tracing;

/// Broadcast to listeners, sessions and workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}
