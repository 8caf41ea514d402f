//! Voice lifecycle and control routing

pub mod controller;
pub mod manager;

pub use controller::{ConnectionStatus, ControlHandler, StreamController, StreamRef};
pub use manager::{StreamManager, StreamStatus};
