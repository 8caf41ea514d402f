//! MIDI subsystem: messages, sample-accurate scheduling and local input forwarding

pub mod forwarder;
pub mod message;
pub mod scheduler;

pub use forwarder::{InputForwarder, LocalInput};
pub use message::MidiMessage;
pub use scheduler::{MidiEventScheduler, ScheduledEvent};
