//! Audio subsystem: sample handoff and the sound-generating adapter seam

pub mod buffer;
pub mod engine;
pub mod tone;

pub use buffer::{AudioBlock, RingBuffer, RingBufferStats};
pub use engine::AudioEngine;
pub use tone::ToneEngine;
