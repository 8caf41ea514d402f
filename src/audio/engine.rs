//! Adapter seam for the sound-generating unit
//!
//! The engine itself is external: it is handed an empty block and the MIDI
//! events that fall inside it, and fills the block. Everything here runs on
//! the audio-production side, so implementations must not block or do I/O
//! inside [`AudioEngine::process`].

use crate::audio::buffer::AudioBlock;
use crate::error::EngineError;
use crate::midi::ScheduledEvent;
use crate::presets::Preset;

pub trait AudioEngine: Send {
    /// Prepare for rendering. Called once before the first block.
    fn initialize(&mut self, sample_rate: u32, block_size: usize, channels: u16)
        -> Result<(), EngineError>;

    /// Load a preset. Called on the render side between blocks.
    fn set_preset(&mut self, preset: &Preset) -> Result<(), EngineError>;

    /// Render one block. `block` arrives zeroed; `events` are sorted by offset.
    fn process(&mut self, block: &mut AudioBlock, events: &[ScheduledEvent]);

    /// Free rendering resources. The engine may be initialized again later.
    fn release(&mut self) {}

    fn name(&self) -> &str;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Engines that record what the render side asked of them

    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug, Default)]
    pub struct EngineLog {
        pub initialized: u32,
        pub released: u32,
        /// Catalog keys in the order they were applied
        pub presets: Vec<String>,
        /// Events handed over, one entry per processed block
        pub blocks: Vec<Vec<ScheduledEvent>>,
    }

    #[derive(Clone, Default)]
    pub struct RecordingEngine {
        pub log: Arc<Mutex<EngineLog>>,
        /// Value written to every sample of every block
        pub fill: f32,
    }

    impl AudioEngine for RecordingEngine {
        fn initialize(&mut self, _: u32, _: usize, _: u16) -> Result<(), EngineError> {
            self.log.lock().initialized += 1;
            Ok(())
        }

        fn set_preset(&mut self, preset: &Preset) -> Result<(), EngineError> {
            self.log.lock().presets.push(preset.key.clone());
            Ok(())
        }

        fn process(&mut self, block: &mut AudioBlock, events: &[ScheduledEvent]) {
            for ch in 0..block.num_channels() {
                block.channel_mut(ch).fill(self.fill);
            }
            self.log.lock().blocks.push(events.to_vec());
        }

        fn release(&mut self) {
            self.log.lock().released += 1;
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    /// Engine whose initialization always fails
    pub struct FailingEngine;

    impl AudioEngine for FailingEngine {
        fn initialize(&mut self, _: u32, _: usize, _: u16) -> Result<(), EngineError> {
            Err(EngineError::InitFailed("plugin not found".into()))
        }

        fn set_preset(&mut self, _: &Preset) -> Result<(), EngineError> {
            Err(EngineError::NotInitialized)
        }

        fn process(&mut self, _: &mut AudioBlock, _: &[ScheduledEvent]) {}

        fn name(&self) -> &str {
            "failing"
        }
    }
}
